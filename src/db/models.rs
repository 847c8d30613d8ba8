use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::model::{NotificationSubscription, RetentionPolicy};
use crate::repository::config::RepositoryConfig;
use crate::types::{BackupStatus, CompressionMode, RepositoryStatus, VolumeStatus};
use crate::volume::config::VolumeConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub config: VolumeConfig,
    #[serde(default)]
    pub auto_remount: bool,
    #[serde(default)]
    pub status: VolumeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Volume {
    pub fn backend(&self) -> &'static str {
        self.config.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub config: RepositoryConfig,
    #[serde(default)]
    pub compression_mode: CompressionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub status: RepositoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Repository {
    pub fn backend(&self) -> &'static str {
        self.config.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub volume_id: String,
    pub repository_id: String,
    pub cron_expression: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<RetentionPolicy>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_if_present: Vec<String>,
    #[serde(default)]
    pub one_file_system: bool,
    #[serde(default)]
    pub notifications: Vec<NotificationSubscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_status: Option<BackupStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_backup_at: Option<DateTime<Utc>>,
}

impl BackupSchedule {
    /// A schedule without a computed next run is treated as due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_backup_at {
            Some(next) => next <= now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleMirror {
    pub schedule_id: String,
    pub repository_id: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_copy_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_copy_status: Option<CopyStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_copy_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    Success,
    Error,
    Skipped,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Success => "success",
            CopyStatus::Error => "error",
            CopyStatus::Skipped => "skipped",
        }
    }
}

/// Everything persisted in the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub schedules: Vec<BackupSchedule>,
    #[serde(default)]
    pub mirrors: Vec<ScheduleMirror>,
}
