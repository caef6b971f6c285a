use std::path::PathBuf;

use thiserror::Error;

/// Failures that stop an operation outright.
///
/// Per-record provisioning problems and unreadable sandbox configuration are
/// not errors: they are logged and degrade to a fallback value instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No valid proxies found!")]
    NoValidProxies,

    #[error("a provisioning batch is already running")]
    BatchInProgress,

    #[error("another arcanum process is provisioning interfaces")]
    InstanceBusy,

    #[error("Shortcut truly missing: {}", .0.display())]
    ShortcutMissing(PathBuf),

    #[error("unknown tool path '{0}' (expected tun2socks, wintun, sandboxie_ini or sbie_ini_exe)")]
    UnknownToolPath(String),

    #[error("failed to launch {}: {source}", path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read proxies from {}: {source}", path.display())]
    ProxyListRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write settings to {}: {source}", path.display())]
    SettingsWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize settings: {0}")]
    SettingsSerialize(#[from] toml::ser::Error),

    #[error("failed to render output: {0}")]
    Render(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
