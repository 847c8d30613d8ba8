use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Mounted,
    #[default]
    Unmounted,
    Error,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Mounted => "mounted",
            VolumeStatus::Unmounted => "unmounted",
            VolumeStatus::Error => "error",
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryStatus {
    Healthy,
    Error,
    #[default]
    Unknown,
}

impl RepositoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryStatus::Healthy => "healthy",
            RepositoryStatus::Error => "error",
            RepositoryStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RepositoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Success,
    Warning,
    Error,
    InProgress,
    Stopped,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "success",
            BackupStatus::Warning => "warning",
            BackupStatus::Error => "error",
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Stopped => "stopped",
        }
    }

    /// Exit code 3 means restic could not read some source files; the
    /// snapshot still exists.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => BackupStatus::Success,
            3 => BackupStatus::Warning,
            _ => BackupStatus::Error,
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    Auto,
    Off,
    Max,
}

impl CompressionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMode::Auto => "auto",
            CompressionMode::Off => "off",
            CompressionMode::Max => "max",
        }
    }
}

pub fn generate_short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
