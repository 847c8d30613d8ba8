use std::path::Path;

use crate::cli::commands::open;
use crate::context::AppContext;
use crate::db::models::Volume;
use crate::error::{CronvaultError, MountError, Result};
use crate::types::VolumeStatus;
use crate::volume::BackendOutcome;

fn find(ctx: &AppContext, name: &str) -> Result<Volume> {
    ctx.db
        .volume_by_name(name)
        .ok_or_else(|| CronvaultError::not_found("volume", name))
}

fn report(volume: &Volume, outcome: BackendOutcome, path: &Path) -> Result<()> {
    match outcome.status {
        VolumeStatus::Error => Err(MountError::Command(format!(
            "{}: {}",
            volume.name,
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        ))
        .into()),
        VolumeStatus::Mounted => {
            println!("{}: mounted at {}", volume.name, path.display());
            Ok(())
        }
        VolumeStatus::Unmounted => {
            println!("{}: unmounted", volume.name);
            Ok(())
        }
    }
}

pub async fn run_mount(config_path: &Path, name: &str) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let volume = find(&ctx, name)?;
    let outcome = ctx.volumes.mount_volume(&volume.id).await?;
    report(&volume, outcome, &ctx.volumes.path(&volume))
}

pub async fn run_unmount(config_path: &Path, name: &str) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let volume = find(&ctx, name)?;
    let outcome = ctx.volumes.unmount_volume(&volume.id).await?;
    report(&volume, outcome, &ctx.volumes.path(&volume))
}

pub async fn run_health(config_path: &Path, name: &str) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let volume = find(&ctx, name)?;
    let outcome = ctx.volumes.check_health(&volume.id).await?;
    report(&volume, outcome, &ctx.volumes.path(&volume))
}
