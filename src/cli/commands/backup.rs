use std::path::Path;

use crate::cli::commands::{exit_code_for_status, open};
use crate::engine::{ExecutionOutcome, SkipReason};
use crate::error::{CronvaultError, Result};

/// Runs a schedule's backup in the foreground. Ctrl-C stops it.
pub async fn run_backup(config_path: &Path, schedule_name: &str) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let schedule = ctx
        .db
        .schedule_by_name(schedule_name)
        .ok_or_else(|| CronvaultError::not_found("schedule", schedule_name))?;

    let executor = ctx.executor.clone();
    let schedule_id = schedule.id.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("stopping backup");
            executor.stop_backup(&schedule_id);
        }
    });

    let outcome = ctx.executor.execute_backup(&schedule.id, true).await;
    interrupt.abort();
    match outcome? {
        ExecutionOutcome::Skipped(SkipReason::AlreadyRunning) => {
            println!("backup already running: {}", schedule.name);
        }
        ExecutionOutcome::Skipped(SkipReason::Disabled) => {
            println!("schedule disabled: {}", schedule.name);
        }
        ExecutionOutcome::Completed(result) => {
            println!("{}: {}", schedule.name, result.status);
            if let Some(summary) = &result.summary {
                if let Some(id) = &summary.snapshot_id {
                    println!("snapshot: {}", id);
                }
                println!(
                    "files: {} new, {} changed, {} unmodified; {} bytes added",
                    summary.files_new,
                    summary.files_changed,
                    summary.files_unmodified,
                    summary.data_added
                );
            }
            if let Some(error) = &result.error {
                println!("error: {}", error);
            }
            if let Some(next) = result.next_backup_at {
                println!("next run: {}", next.to_rfc3339());
            }
            let code = exit_code_for_status(result.status);
            if code != 0 {
                std::process::exit(code);
            }
        }
    }
    Ok(())
}
