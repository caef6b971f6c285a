use std::{
    io,
    path::{Path, PathBuf},
};

use super::{run_silent_with_output, spawn_detached};

pub fn is_running_as_admin() -> bool {
    let (success, stdout) = run_silent_with_output("id", &["-u"]);
    success && stdout.trim() == "0"
}

pub fn open_with_shell(path: &Path) -> io::Result<()> {
    let display = path.to_string_lossy();
    spawn_detached("xdg-open", &[&display])
}

/// The kernel TUN device stands in for wintun here; `configured` is unused.
pub fn check_tun_device(_configured: &[PathBuf]) -> bool {
    let path = Path::new("/dev/net/tun");

    if path.exists() {
        log::debug!("[preflight] /dev/net/tun exists");
        true
    } else {
        log::warn!("[preflight] /dev/net/tun not found; the tun kernel module may not be loaded");
        false
    }
}
