use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    provisioner::ProvisionPolicy,
};

pub const DEFAULT_SANDBOXIE_INI: &str = r"C:\Windows\Sandboxie.ini";
pub const DEFAULT_SBIE_INI_EXE: &str = r"C:\Program Files\Sandboxie-Plus\SbieIni.exe";

#[cfg(target_os = "windows")]
const TUN2SOCKS_FILE: &str = "tun2socks.exe";
#[cfg(not(target_os = "windows"))]
const TUN2SOCKS_FILE: &str = "tun2socks";
const WINTUN_FILE: &str = "wintun.dll";

pub const TOOL_PATH_NAMES: [&str; 4] = ["tun2socks", "wintun", "sandboxie_ini", "sbie_ini_exe"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub tun2socks: String,
    pub wintun: String,
    pub sandboxie_ini: String,
    pub sbie_ini_exe: String,
}

impl ToolPaths {
    pub fn get(&self, name: &str) -> Result<&str> {
        match name {
            "tun2socks" => Ok(&self.tun2socks),
            "wintun" => Ok(&self.wintun),
            "sandboxie_ini" => Ok(&self.sandboxie_ini),
            "sbie_ini_exe" => Ok(&self.sbie_ini_exe),
            other => Err(Error::UnknownToolPath(other.to_string())),
        }
    }

    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let slot = match name {
            "tun2socks" => &mut self.tun2socks,
            "wintun" => &mut self.wintun,
            "sandboxie_ini" => &mut self.sandboxie_ini,
            "sbie_ini_exe" => &mut self.sbie_ini_exe,
            other => return Err(Error::UnknownToolPath(other.to_string())),
        };
        *slot = value.trim().to_string();
        Ok(())
    }

    /// Fills blank entries: tun2socks and wintun from `search_dirs`, the
    /// Sandboxie pair from their standard install locations.
    pub fn fill_defaults(&mut self, search_dirs: &[PathBuf]) {
        if self.tun2socks.is_empty()
            && let Some(found) = find_in(search_dirs, TUN2SOCKS_FILE)
        {
            log::info!("[settings] found tun2socks at {}", found.display());
            self.tun2socks = found.display().to_string();
        }
        if self.wintun.is_empty()
            && let Some(found) = find_in(search_dirs, WINTUN_FILE)
        {
            log::info!("[settings] found wintun at {}", found.display());
            self.wintun = found.display().to_string();
        }
        if self.sandboxie_ini.is_empty() {
            self.sandboxie_ini = DEFAULT_SANDBOXIE_INI.to_string();
        }
        if self.sbie_ini_exe.is_empty() {
            self.sbie_ini_exe = DEFAULT_SBIE_INI_EXE.to_string();
        }
    }

    /// Where wintun.dll may live, most specific first.
    pub fn wintun_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if !self.wintun.is_empty() {
            candidates.push(PathBuf::from(&self.wintun));
        }
        if let Some(directory) = Path::new(&self.tun2socks).parent()
            && !directory.as_os_str().is_empty()
        {
            candidates.push(directory.join(WINTUN_FILE));
        }
        candidates
    }
}

fn find_in(directories: &[PathBuf], file_name: &str) -> Option<PathBuf> {
    directories
        .iter()
        .map(|directory| directory.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// The executable's directory and its parent.
pub fn bundled_tool_dirs() -> Vec<PathBuf> {
    let Ok(exe_path) = std::env::current_exe() else {
        return Vec::new();
    };
    exe_path
        .parent()
        .into_iter()
        .flat_map(|directory| [Some(directory), directory.parent()])
        .flatten()
        .map(Path::to_path_buf)
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub proxies_list: Vec<String>,
    pub last_shortcuts_dir: String,
    pub paths: ToolPaths,
    pub provisioning: ProvisionPolicy,
}

impl Settings {
    pub fn settings_file_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("arcanum")
            .join("arcanum.toml")
    }

    /// Never fails: a missing file writes defaults, while an unreadable or
    /// broken one is left on disk untouched.
    pub fn load(path: &Path) -> Self {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<Settings>(&content) {
                Ok(settings) => {
                    log::info!("[settings] loaded from {}", path.display());
                    settings
                }
                Err(error) => {
                    log::warn!("[settings] failed to parse {}: {error}", path.display());
                    Self::default()
                }
            },
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                log::warn!(
                    "[settings] cannot read {}: {error}; using defaults without saving",
                    path.display()
                );
                Self::default()
            }
            Err(_) => {
                log::info!(
                    "[settings] no settings file at {}, writing defaults",
                    path.display()
                );
                let mut settings = Self::default();
                settings.paths.fill_defaults(&bundled_tool_dirs());
                if let Err(error) = settings.save(path) {
                    log::warn!("[settings] {error}");
                }
                settings
            }
        };
        settings.paths.fill_defaults(&[]);
        settings
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| Error::SettingsWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| Error::SettingsWrite {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("[settings] saved to {}", path.display());
        Ok(())
    }

    pub fn get_path(&self, name: &str) -> Result<&str> {
        self.paths.get(name)
    }

    pub fn set_path(&mut self, name: &str, value: &str) -> Result<()> {
        self.paths.set(name, value)
    }
}
