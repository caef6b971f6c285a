use std::{
    io,
    path::{Path, PathBuf},
};

use super::spawn_detached;

mod win32 {
    use windows::{
        Win32::{
            Foundation::CloseHandle,
            UI::Shell::{SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW, ShellExecuteExW},
        },
        core::PCWSTR,
    };

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub fn shell_execute_open(file: &str) -> bool {
        let verb = to_wide("open");
        let file_wide = to_wide(file);

        let mut info = SHELLEXECUTEINFOW {
            cbSize: std::mem::size_of::<SHELLEXECUTEINFOW>() as u32,
            fMask: SEE_MASK_NOCLOSEPROCESS,
            lpVerb: PCWSTR(verb.as_ptr()),
            lpFile: PCWSTR(file_wide.as_ptr()),
            nShow: 1, // SW_SHOWNORMAL
            ..Default::default()
        };

        let result = unsafe { ShellExecuteExW(&mut info) };
        if let Err(error) = result {
            log::warn!("[win32] ShellExecuteExW failed: {error}");
            return false;
        }
        if !info.hProcess.0.is_null() {
            unsafe {
                let _ = CloseHandle(info.hProcess);
            }
        }
        true
    }
}

pub fn is_running_as_admin() -> bool {
    use windows::Win32::UI::Shell::IsUserAnAdmin;
    unsafe { IsUserAnAdmin().as_bool() }
}

/// Hands `path` to Explorer, the same as a double click.
pub fn open_with_shell(path: &Path) -> io::Result<()> {
    let display = path.to_string_lossy();
    match spawn_detached("explorer", &[&display]) {
        Ok(()) => Ok(()),
        Err(error) => {
            log::warn!("[launch] explorer failed for {display}: {error}, trying ShellExecuteEx");
            if win32::shell_execute_open(&display) {
                Ok(())
            } else {
                Err(error)
            }
        }
    }
}

pub fn check_tun_device(configured: &[PathBuf]) -> bool {
    let mut search_paths: Vec<PathBuf> = configured.to_vec();

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(directory) = exe_path.parent()
    {
        search_paths.push(directory.join("wintun.dll"));
    }
    if let Ok(system_root) = std::env::var("SystemRoot") {
        search_paths.push(
            PathBuf::from(&system_root)
                .join("System32")
                .join("wintun.dll"),
        );
    }
    if let Ok(current_dir) = std::env::current_dir() {
        search_paths.push(current_dir.join("wintun.dll"));
    }

    for path in &search_paths {
        if path.is_file() {
            log::info!("[preflight] wintun.dll found: {}", path.display());
            return true;
        }
    }

    log::warn!(
        "[preflight] wintun.dll not found in any search path: {:?}",
        search_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
    );
    false
}
