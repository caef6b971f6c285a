use std::{io, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};

use super::{CommandRunner, HostNetwork};
use crate::adapters::parse_interface_table;

const POWERSHELL_ARGS: &[&str] = &[
    "-NoProfile",
    "-NonInteractive",
    "-WindowStyle",
    "Hidden",
    "-EncodedCommand",
];

/// Windows backend: `netsh` for configuration, PowerShell for readback.
pub struct NetshHost {
    runner: Arc<dyn CommandRunner>,
}

impl NetshHost {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl HostNetwork for NetshHost {
    fn launch_tunnel(&self, binary: &str, arguments: &[String]) -> io::Result<()> {
        let arguments: Vec<&str> = arguments.iter().map(String::as_str).collect();
        self.runner.spawn_detached(binary, &arguments)
    }

    fn kill_tunnels(&self, image_name: &str) -> bool {
        log::info!("[process] terminating every {image_name} by image name");
        self.runner
            .run("taskkill", &["/F", "/IM", image_name])
            .success
    }

    fn interface_exists(&self, name: &str) -> bool {
        let filter = format!("name={name}");
        self.runner
            .run("netsh", &["interface", "show", "interface", &filter])
            .success
    }

    fn set_static_address(&self, name: &str, address: &str, mask: &str, gateway: &str) -> bool {
        let name_argument = format!("name={name}");
        let address_argument = format!("addr={address}");
        let mask_argument = format!("mask={mask}");
        let gateway_argument = format!("gateway={gateway}");
        self.runner
            .run(
                "netsh",
                &[
                    "interface",
                    "ip",
                    "set",
                    "address",
                    &name_argument,
                    "source=static",
                    &address_argument,
                    &mask_argument,
                    &gateway_argument,
                ],
            )
            .success
    }

    fn set_metric(&self, name: &str, metric: u32) -> bool {
        let metric_argument = format!("metric={metric}");
        self.runner
            .run(
                "netsh",
                &["interface", "ip", "set", "interface", name, &metric_argument],
            )
            .success
    }

    fn query_ipv4(&self, name: &str) -> Option<String> {
        let encoded = encode_powershell_command(&readback_script(name));
        let mut arguments = POWERSHELL_ARGS.to_vec();
        arguments.push(&encoded);

        let output = self.runner.run("powershell", &arguments);
        if !output.success {
            return None;
        }
        first_value_line(&output.stdout)
    }

    fn interface_names(&self) -> Vec<String> {
        let output = self.runner.run("netsh", &["interface", "show", "interface"]);
        if !output.success {
            log::warn!("[adapters] netsh interface listing failed");
            return Vec::new();
        }
        parse_interface_table(&output.stdout)
    }
}

pub fn readback_script(name: &str) -> String {
    format!(
        "(Get-NetIPAddress -InterfaceAlias '{}' -AddressFamily IPv4 -ErrorAction SilentlyContinue).IPAddress",
        name.replace('\'', "''"),
    )
}

/// Base64-encoded UTF-16LE for PowerShell `-EncodedCommand`.
pub fn encode_powershell_command(command: &str) -> String {
    let data: Vec<u8> = command
        .encode_utf16()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    STANDARD.encode(&data)
}

pub(crate) fn first_value_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::system::CommandOutput;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<String>>>,
        stdout: String,
    }

    impl Recorder {
        fn with_stdout(stdout: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                stdout: stdout.to_string(),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for Recorder {
        fn run(&self, program: &str, arguments: &[&str]) -> CommandOutput {
            let mut call = vec![program.to_string()];
            call.extend(arguments.iter().map(|a| a.to_string()));
            self.calls.lock().unwrap().push(call);
            CommandOutput {
                success: true,
                stdout: self.stdout.clone(),
            }
        }

        fn spawn_detached(&self, program: &str, arguments: &[&str]) -> io::Result<()> {
            self.run(program, arguments);
            Ok(())
        }
    }

    #[test]
    fn static_address_uses_netsh_contract() {
        let recorder = Arc::new(Recorder::default());
        let host = NetshHost::new(recorder.clone());

        assert!(host.set_static_address("Proxy_2", "10.0.2.1", "255.255.255.0", "10.0.2.254"));
        assert!(host.set_metric("Proxy_2", 500));

        assert_eq!(
            recorder.calls(),
            vec![
                vec![
                    "netsh",
                    "interface",
                    "ip",
                    "set",
                    "address",
                    "name=Proxy_2",
                    "source=static",
                    "addr=10.0.2.1",
                    "mask=255.255.255.0",
                    "gateway=10.0.2.254",
                ],
                vec!["netsh", "interface", "ip", "set", "interface", "Proxy_2", "metric=500"],
            ]
        );
    }

    #[test]
    fn kill_and_existence_queries() {
        let recorder = Arc::new(Recorder::default());
        let host = NetshHost::new(recorder.clone());

        host.kill_tunnels("tun2socks.exe");
        host.interface_exists("Proxy_1");

        assert_eq!(
            recorder.calls(),
            vec![
                vec!["taskkill", "/F", "/IM", "tun2socks.exe"],
                vec!["netsh", "interface", "show", "interface", "name=Proxy_1"],
            ]
        );
    }

    #[test]
    fn readback_takes_first_non_empty_line() {
        let recorder = Arc::new(Recorder::with_stdout("\r\n  10.0.1.1 \r\n169.254.3.3\r\n"));
        let host = NetshHost::new(recorder.clone());

        assert_eq!(host.query_ipv4("Proxy_1").as_deref(), Some("10.0.1.1"));

        let calls = recorder.calls();
        assert_eq!(calls[0][0], "powershell");
        assert_eq!(calls[0].last(), Some(&encode_powershell_command(&readback_script("Proxy_1"))));
    }

    #[test]
    fn readback_of_empty_output_is_none() {
        let host = NetshHost::new(Arc::new(Recorder::with_stdout("  \r\n")));
        assert_eq!(host.query_ipv4("Proxy_1"), None);
    }

    #[test]
    fn readback_script_escapes_quotes() {
        assert!(readback_script("Bob's").contains("-InterfaceAlias 'Bob''s'"));
    }

    #[test]
    fn encoded_command_is_utf16le() {
        assert_eq!(encode_powershell_command("ab"), STANDARD.encode([b'a', 0, b'b', 0]));
    }
}
