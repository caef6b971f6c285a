use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::Serialize;

use crate::{
    error::{Error, Result},
    system,
};

static SHORTCUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+)-\[(.+?)\]\s(.+)\.lnk$").expect("shortcut pattern is valid")
});

/// A launcher named `<group>-[<box>] <app>.lnk`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShortcutEntry {
    pub display_name: String,
    pub file_path: PathBuf,
    pub box_name: String,
    pub group_id: u32,
    pub app_name: String,
}

impl ShortcutEntry {
    pub fn parse(directory: &Path, file_name: &str) -> Option<Self> {
        let captures = SHORTCUT_PATTERN.captures(file_name)?;
        let group_id = captures[1].parse::<u32>().ok()?;

        Some(Self {
            display_name: file_name.to_string(),
            file_path: normalize_path(&directory.join(file_name)),
            box_name: captures[2].to_string(),
            group_id,
            app_name: captures[3].to_string(),
        })
    }

    /// Button text: `spotify.exe` becomes `Spotify`.
    pub fn label(&self) -> String {
        let stem = self.app_name.replace(".exe", "").replace(".lnk", "");
        let mut characters = stem.chars();
        match characters.next() {
            Some(first) => first
                .to_uppercase()
                .chain(characters.flat_map(char::to_lowercase))
                .collect(),
            None => String::new(),
        }
    }
}

/// Groups keyed by numeric prefix; entries keep directory-listing order.
pub type ShortcutGroups = BTreeMap<u32, Vec<ShortcutEntry>>;

#[derive(Debug, Default)]
pub struct ShortcutScan {
    pub groups: ShortcutGroups,
    /// Directory entries that did not follow the naming convention.
    pub skipped: usize,
}

impl ShortcutScan {
    pub fn entry_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// A group is bound through the box of its first shortcut.
pub fn group_box_name(entries: &[ShortcutEntry]) -> Option<&str> {
    entries.first().map(|entry| entry.box_name.as_str())
}

pub fn scan(directory: &Path) -> ShortcutScan {
    let mut result = ShortcutScan::default();

    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(error) => {
            log::info!(
                "[shortcuts] cannot read {}: {error}",
                directory.display()
            );
            return result;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(shortcut) = file_name
            .to_str()
            .and_then(|name| ShortcutEntry::parse(directory, name))
        else {
            log::trace!("[shortcuts] ignoring {}", file_name.to_string_lossy());
            result.skipped += 1;
            continue;
        };

        result
            .groups
            .entry(shortcut.group_id)
            .or_default()
            .push(shortcut);
    }

    log::info!(
        "[shortcuts] found {} shortcuts in {} groups ({} other entries)",
        result.entry_count(),
        result.groups.len(),
        result.skipped,
    );
    result
}

/// Lexical cleanup of `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Opens a shortcut through the host shell.
///
/// Only a target that exists neither as given nor as an absolute path is an
/// error; a shell that fails to start is logged.
pub fn launch_shortcut(path: &Path) -> Result<()> {
    let target = resolve_shortcut(path)?;
    log::info!("[launch] opening {}", target.display());
    system::open_with_shell(&target).map_err(|source| Error::Launch {
        path: target,
        source,
    })
}

pub fn resolve_shortcut(path: &Path) -> Result<PathBuf> {
    let normalized = normalize_path(path);
    if normalized.exists() {
        return Ok(normalized);
    }

    log::debug!(
        "[launch] shortcut not found at {}, trying absolute path",
        normalized.display()
    );
    match std::path::absolute(&normalized) {
        Ok(absolute) if absolute.exists() => Ok(absolute),
        _ => Err(Error::ShortcutMissing(normalized)),
    }
}
