pub mod backup;
pub mod repository;
pub mod serve;
pub mod status;
pub mod volume;

use std::path::Path;

use crate::config::load::load_config;
use crate::config::model::RuntimeConfig;
use crate::context::AppContext;
use crate::error::{CronvaultError, Result};
use crate::types::BackupStatus;

pub fn exit_code(err: &CronvaultError) -> i32 {
    match err {
        CronvaultError::Config(_) => 3,
        CronvaultError::NotFound { .. } => 4,
        CronvaultError::Mount(_) => 10,
        CronvaultError::Engine(_) => 11,
        CronvaultError::Timeout { .. } => 12,
        CronvaultError::Message(_) | CronvaultError::Io(_) => 2,
    }
}

pub fn exit_for_error(err: &CronvaultError) -> ! {
    println!("{}", err);
    std::process::exit(exit_code(err));
}

pub fn exit_code_for_status(status: BackupStatus) -> i32 {
    match status {
        BackupStatus::Success => 0,
        BackupStatus::Warning => 5,
        BackupStatus::Error | BackupStatus::InProgress => 6,
        BackupStatus::Stopped => 7,
    }
}

/// Loads the configuration and brings the state file in line with it.
pub fn open(config_path: &Path) -> Result<(RuntimeConfig, AppContext)> {
    let config = load_config(config_path.to_string_lossy().as_ref())?;
    let ctx = AppContext::build(&config)?;
    ctx.reconcile(&config)?;
    Ok((config, ctx))
}
