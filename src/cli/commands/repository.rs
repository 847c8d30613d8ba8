use std::path::Path;

use crate::cli::commands::open;
use crate::context::AppContext;
use crate::db::models::Repository;
use crate::error::{CronvaultError, Result};

fn find(ctx: &AppContext, name: &str) -> Result<Repository> {
    ctx.db
        .repository_by_name(name)
        .ok_or_else(|| CronvaultError::not_found("repository", name))
}

pub async fn run_init(config_path: &Path, name: &str) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let repository = find(&ctx, name)?;
    let status = ctx.repositories.init_or_adopt(&repository.id).await?;
    println!("{}: {}", repository.name, status);
    if let Some(error) = ctx.db.repository(&repository.id).and_then(|r| r.last_error) {
        return Err(CronvaultError::message(format!("{}: {}", repository.name, error)));
    }
    Ok(())
}

pub async fn run_check(config_path: &Path, name: &str, read_data: bool) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let repository = find(&ctx, name)?;
    let output = ctx.repositories.check(&repository.id, read_data).await?;
    print!("{}", output);
    println!("{}: healthy", repository.name);
    Ok(())
}

pub async fn run_snapshots(config_path: &Path, name: &str, schedule: Option<&str>) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let repository = find(&ctx, name)?;
    let tag = match schedule {
        Some(schedule_name) => Some(
            ctx.db
                .schedule_by_name(schedule_name)
                .ok_or_else(|| CronvaultError::not_found("schedule", schedule_name))?
                .short_id,
        ),
        None => None,
    };
    let snapshots = ctx.repositories.snapshots(&repository.id, tag.as_deref()).await?;
    if snapshots.is_empty() {
        println!("no snapshots");
    }
    for snapshot in snapshots {
        println!(
            "{}  {}  {}  {}",
            snapshot.short_id,
            snapshot.time.format("%Y-%m-%d %H:%M:%S"),
            snapshot.hostname,
            snapshot.paths.join(",")
        );
    }
    Ok(())
}

pub async fn run_unlock(config_path: &Path, name: &str) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let repository = find(&ctx, name)?;
    ctx.repositories.unlock(&repository.id).await?;
    println!("{}: unlocked", repository.name);
    Ok(())
}

pub async fn run_delete_snapshot(config_path: &Path, name: &str, snapshot_id: &str) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let repository = find(&ctx, name)?;
    ctx.repositories
        .delete_snapshot(&repository.id, snapshot_id)
        .await?;
    println!("{}: snapshot {} deleted", repository.name, snapshot_id);
    Ok(())
}
