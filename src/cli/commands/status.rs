use std::path::Path;

use chrono::{DateTime, Utc};

use crate::cli::commands::open;
use crate::context::AppContext;
use crate::error::Result;

pub fn run_due(config_path: &Path) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    let due = ctx.executor.schedules_to_execute(Utc::now());
    if due.is_empty() {
        println!("no schedules due");
    }
    for schedule in due {
        println!("{} ({})", schedule.name, schedule.cron_expression);
    }
    Ok(())
}

pub fn run_status(config_path: &Path) -> Result<()> {
    let (_, ctx) = open(config_path)?;
    for line in status_lines(&ctx) {
        println!("{}", line);
    }
    Ok(())
}

fn status_lines(ctx: &AppContext) -> Vec<String> {
    let state = ctx.db.snapshot();
    let mut lines = vec!["Volumes:".to_string()];
    for volume in &state.volumes {
        lines.push(format!(
            "  {:<20} {:<10} {:<10} {}",
            volume.name,
            volume.config.kind(),
            volume.status,
            volume.last_error.as_deref().unwrap_or("")
        ));
    }
    lines.push("Repositories:".to_string());
    for repository in &state.repositories {
        lines.push(format!(
            "  {:<20} {:<10} {:<10} {}",
            repository.name,
            repository.config.kind(),
            repository.status,
            repository.last_error.as_deref().unwrap_or("")
        ));
    }
    lines.push("Schedules:".to_string());
    for schedule in &state.schedules {
        let volume = ctx
            .db
            .volume(&schedule.volume_id)
            .map(|v| v.name)
            .unwrap_or_default();
        let repository = ctx
            .db
            .repository(&schedule.repository_id)
            .map(|r| r.name)
            .unwrap_or_default();
        lines.push(format!(
            "  {:<20} {} -> {} [{}]{} last: {} {} next: {}",
            schedule.name,
            volume,
            repository,
            schedule.cron_expression,
            if schedule.enabled { "" } else { " disabled" },
            schedule
                .last_backup_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "never".to_string()),
            format_time(schedule.last_backup_at),
            format_time(schedule.next_backup_at)
        ));
        if let Some(error) = &schedule.last_backup_error {
            lines.push(format!("    error: {}", error));
        }
    }
    lines
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}
