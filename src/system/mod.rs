use std::{
    io,
    process::{Command, Stdio},
    sync::Arc,
};

pub mod iproute;
pub mod netsh;

#[cfg(not(target_os = "windows"))]
mod linux;
#[cfg(not(target_os = "windows"))]
pub use linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::*;

/// Everything the provisioner needs from the host network stack.
///
/// Implementations report failure through their return values and never
/// panic; callers decide whether a failure is worth a retry.
pub trait HostNetwork: Send + Sync {
    fn launch_tunnel(&self, binary: &str, arguments: &[String]) -> io::Result<()>;

    /// Kills every running tunnel by image name.
    fn kill_tunnels(&self, image_name: &str) -> bool;

    fn interface_exists(&self, name: &str) -> bool;

    fn set_static_address(&self, name: &str, address: &str, mask: &str, gateway: &str) -> bool;

    fn set_metric(&self, name: &str, metric: u32) -> bool;

    /// IPv4 address currently bound to `name`, as the host reports it.
    fn query_ipv4(&self, name: &str) -> Option<String>;

    fn interface_names(&self) -> Vec<String>;
}

#[cfg(target_os = "windows")]
pub fn host_network() -> Arc<dyn HostNetwork> {
    Arc::new(netsh::NetshHost::new(Arc::new(SilentRunner)))
}

#[cfg(not(target_os = "windows"))]
pub fn host_network() -> Arc<dyn HostNetwork> {
    Arc::new(iproute::IprouteHost::new(Arc::new(SilentRunner)))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
}

/// Seam between command construction and process execution.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, arguments: &[&str]) -> CommandOutput;

    /// Starts `program` in the background without waiting for it.
    fn spawn_detached(&self, program: &str, arguments: &[&str]) -> io::Result<()>;
}

pub struct SilentRunner;

impl CommandRunner for SilentRunner {
    fn run(&self, program: &str, arguments: &[&str]) -> CommandOutput {
        let (success, stdout) = run_silent_with_output(program, arguments);
        CommandOutput { success, stdout }
    }

    fn spawn_detached(&self, program: &str, arguments: &[&str]) -> io::Result<()> {
        spawn_detached(program, arguments)
    }
}

#[cfg(target_os = "windows")]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x08000000;

#[cfg(target_os = "windows")]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;

pub fn run_silent_with_output(program: &str, arguments: &[&str]) -> (bool, String) {
    log::debug!("[cmd] {} {}", program, arguments.join(" "));
    let mut command = Command::new(program);
    command
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    match command.output() {
        Ok(output) => {
            let success = output.status.success();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            if !success {
                log::debug!(
                    "[cmd] FAILED (exit {}): {} {}\n  stdout: {}\n  stderr: {}",
                    output.status.code().unwrap_or(-1),
                    program,
                    arguments.join(" "),
                    stdout.trim(),
                    stderr.trim(),
                );
            } else {
                log::trace!(
                    "[cmd] OK: {} {} → stdout={}",
                    program,
                    arguments.join(" "),
                    stdout.trim(),
                );
            }
            (success, stdout)
        }
        Err(error) => {
            log::debug!("[cmd] spawn error for {}: {}", program, error);
            (false, error.to_string())
        }
    }
}

/// The child is reaped on a helper thread so it never lingers as a zombie.
pub fn spawn_detached(program: &str, arguments: &[&str]) -> io::Result<()> {
    log::debug!("[cmd] spawning detached: {} {}", program, arguments.join(" "));
    let mut command = Command::new(program);
    command
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
    }

    let mut child = command.spawn()?;
    let process_id = child.id();
    let label = program.to_string();
    log::info!("[cmd] {label} started (pid={process_id})");

    std::thread::spawn(move || match child.wait() {
        Ok(status) => log::debug!("[cmd] {label} (pid={process_id}) exited: {status}"),
        Err(error) => log::debug!("[cmd] {label} (pid={process_id}) wait error: {error}"),
    });

    Ok(())
}
