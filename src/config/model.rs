use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::repository::config::RepositoryConfig;
use crate::types::CompressionMode;
use crate::volume::config::VolumeConfig;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_dir: Option<String>,
    #[serde(default)]
    pub restic: ResticOptions,
    #[serde(default)]
    pub timeouts: TimeoutOptions,
    #[serde(default)]
    pub scheduler: SchedulerOptions,
    #[serde(default)]
    pub volumes: Vec<VolumeDefinition>,
    #[serde(default)]
    pub repositories: Vec<RepositoryDefinition>,
    #[serde(default)]
    pub schedules: Vec<ScheduleDefinition>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResticOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_repository_base: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dispatch_cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_health_cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_health_cron: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDefinition {
    pub name: String,
    #[serde(default = "default_true")]
    pub auto_remount: bool,
    #[serde(flatten)]
    pub config: VolumeConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryDefinition {
    pub name: String,
    #[serde(default)]
    pub compression: CompressionMode,
    /// Repository password reference; the global password file is used when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(flatten)]
    pub config: RepositoryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDefinition {
    pub name: String,
    pub volume: String,
    pub repository: String,
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub exclude_if_present: Vec<String>,
    #[serde(default)]
    pub one_file_system: bool,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub notifications: Vec<NotificationSubscription>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_hourly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_yearly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_within: Option<String>,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.keep_last.is_none()
            && self.keep_hourly.is_none()
            && self.keep_daily.is_none()
            && self.keep_weekly.is_none()
            && self.keep_monthly.is_none()
            && self.keep_yearly.is_none()
            && self.keep_within.is_none()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSubscription {
    pub destination: String,
    #[serde(default)]
    pub on_start: bool,
    #[serde(default)]
    pub on_success: bool,
    #[serde(default = "default_true")]
    pub on_warning: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
}

#[derive(Debug, Clone)]
pub struct ResticSettings {
    pub binary: PathBuf,
    pub password_file: PathBuf,
    pub cache_dir: PathBuf,
    pub local_repository_base: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub backup_dispatch_cron: String,
    pub volume_health_cron: String,
    pub repository_health_cron: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub mount_base: PathBuf,
    pub secrets_dir: PathBuf,
    pub restic: ResticSettings,
    pub mount_timeout: Duration,
    pub scheduler: SchedulerSettings,
}

impl Settings {
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.yaml")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.runtime_dir.join("credentials")
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub settings: Settings,
    pub volumes: Vec<VolumeDefinition>,
    pub repositories: Vec<RepositoryDefinition>,
    pub schedules: Vec<ScheduleDefinition>,
}

fn default_true() -> bool {
    true
}
