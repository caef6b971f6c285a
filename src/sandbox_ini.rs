use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{adapters::CLEAN_ADAPTER, system::CommandRunner};

pub const BIND_ADAPTER_KEY: &str = "BindAdapter";

/// Shown for a box without a `BindAdapter` setting.
pub const UNBOUND_LABEL: &str = "None";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    Unbound,
    Adapter(String),
}

impl Binding {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unbound => UNBOUND_LABEL,
            Self::Adapter(name) => name,
        }
    }

    /// `"None"` and `"clean"` both mean "no binding".
    pub fn from_choice(choice: &str) -> Self {
        if choice == UNBOUND_LABEL || choice == CLEAN_ADAPTER {
            Self::Unbound
        } else {
            Self::Adapter(choice.to_string())
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IniSection<'a> {
    pub name: &'a str,
    /// Text after the header up to the next header or end of file.
    pub body: &'a str,
}

/// Splits on lines that start with `[name]`.
///
/// Whatever follows `]` on the header line belongs to the body, and text
/// before the first header is dropped.
pub fn split_sections(content: &str) -> Vec<IniSection<'_>> {
    let mut sections: Vec<IniSection<'_>> = Vec::new();
    let mut current: Option<(&str, usize)> = None;
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        if let Some((name, header_length)) = section_header(line) {
            if let Some((previous, body_start)) = current {
                sections.push(IniSection {
                    name: previous,
                    body: &content[body_start..offset],
                });
            }
            current = Some((name, offset + header_length));
        }
        offset += line.len();
    }

    if let Some((name, body_start)) = current {
        sections.push(IniSection {
            name,
            body: &content[body_start..],
        });
    }
    sections
}

fn section_header(line: &str) -> Option<(&str, usize)> {
    let inner = line.strip_prefix('[')?;
    let end = inner.find(']')?;
    let name = &inner[..end];
    if name.is_empty() || name.contains('\n') {
        return None;
    }
    Some((name, end + 2))
}

/// First `key=value` line in `body`, value trimmed.
///
/// Indentation before the key is allowed; the key itself is case-sensitive.
pub fn find_value<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix(key)?;
        let value = rest.strip_prefix('=')?.trim();
        (!value.is_empty()).then_some(value)
    })
}

pub fn find_section<'a>(content: &'a str, section: &str) -> Option<IniSection<'a>> {
    let wanted = section.to_lowercase();
    split_sections(content)
        .into_iter()
        .find(|candidate| candidate.name.to_lowercase() == wanted)
}

pub fn lookup_binding(content: &str, box_name: &str) -> Binding {
    find_section(content, box_name)
        .and_then(|section| find_value(section.body, BIND_ADAPTER_KEY))
        .map_or(Binding::Unbound, |value| Binding::Adapter(value.to_string()))
}

/// Decodes the wide-character store.
///
/// A byte-order mark decides the encoding. Without one, an even-length buffer
/// holding any NUL is UTF-16LE (UTF-8 text never contains NUL), and anything
/// else is read as UTF-8.
pub fn decode_wide_text(bytes: &[u8]) -> String {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ if looks_like_utf16le(bytes) => decode_utf16(bytes, u16::from_le_bytes),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn looks_like_utf16le(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes.len() % 2 == 0 && bytes.contains(&0)
}

/// Reads and writes per-box `BindAdapter` settings.
///
/// Reads parse Sandboxie.ini directly; writes go through SbieIni.exe, which
/// owns the file's locking and reload discipline.
pub struct BindingResolver {
    ini_path: PathBuf,
    control_utility: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl BindingResolver {
    pub fn new(
        ini_path: impl Into<PathBuf>,
        control_utility: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            ini_path: ini_path.into(),
            control_utility: control_utility.into(),
            runner,
        }
    }

    pub fn ini_path(&self) -> &Path {
        &self.ini_path
    }

    /// Any failure to read the store resolves to [`Binding::Unbound`].
    pub fn get_binding(&self, box_name: &str) -> Binding {
        if !self.ini_path.exists() {
            log::debug!(
                "[sandbox_ini] {} does not exist",
                self.ini_path.display()
            );
            return Binding::Unbound;
        }

        match std::fs::read(&self.ini_path) {
            Ok(bytes) => {
                let binding = lookup_binding(&decode_wide_text(&bytes), box_name);
                log::debug!("[sandbox_ini] [{box_name}] {BIND_ADAPTER_KEY}={binding}");
                binding
            }
            Err(error) => {
                log::warn!(
                    "[sandbox_ini] failed to read {}: {error}",
                    self.ini_path.display()
                );
                Binding::Unbound
            }
        }
    }

    /// Arguments for SbieIni.exe; the clear form omits the value.
    pub fn control_arguments(box_name: &str, adapter: &str) -> Vec<String> {
        let mut arguments = vec![
            "set".to_string(),
            box_name.to_string(),
            BIND_ADAPTER_KEY.to_string(),
        ];
        if let Binding::Adapter(name) = Binding::from_choice(adapter) {
            arguments.push(name);
        }
        arguments
    }

    /// Single attempt; the utility's exit status is the only feedback.
    pub fn set_binding(&self, box_name: &str, adapter: &str) -> bool {
        let arguments = Self::control_arguments(box_name, adapter);
        let arguments: Vec<&str> = arguments.iter().map(String::as_str).collect();
        let program = self.control_utility.to_string_lossy();

        let output = self.runner.run(&program, &arguments);
        if output.success {
            log::info!(
                "[sandbox_ini] [{box_name}] {BIND_ADAPTER_KEY} → {}",
                Binding::from_choice(adapter)
            );
        } else {
            log::warn!("[sandbox_ini] {program} failed to update [{box_name}] {BIND_ADAPTER_KEY}");
        }
        output.success
    }
}
