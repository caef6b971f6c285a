pub mod adapters;
pub mod cli;
pub mod configuration;
pub mod error;
pub mod progress_log;
pub mod provisioner;
pub mod proxy;
pub mod sandbox_ini;
pub mod shortcuts;
#[cfg(target_os = "windows")]
pub mod single_instance;
pub mod system;

pub use error::{Error, Result};
