use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CronvaultError, Result};

pub const PROC_MOUNTS: &str = "/proc/self/mounts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mountpoint: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|opt| opt == "ro")
    }
}

/// A snapshot of the kernel mount table in `/proc/mounts` format.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CronvaultError::message(format!("read {}: {}", path.display(), e)))?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut entries = Vec::new();
        for line in contents.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                continue;
            }
            entries.push(MountEntry {
                source: unescape(fields[0]),
                mountpoint: PathBuf::from(unescape(fields[1])),
                fs_type: fields[2].to_string(),
                options: fields[3].split(',').map(str::to_string).collect(),
            });
        }
        Self { entries }
    }

    /// The entry visible at `mountpoint`; later entries shadow earlier ones.
    pub fn find(&self, mountpoint: &Path) -> Option<&MountEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.mountpoint == mountpoint)
    }

    pub fn mounts_under(&self, base: &Path) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter(|entry| entry.mountpoint.starts_with(base))
            .map(|entry| entry.mountpoint.clone())
            .collect()
    }
}

// The kernel escapes space, tab, newline and backslash as octal.
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}
