use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::models::{BackupSchedule, Repository, ScheduleMirror, Volume};
use super::{next_run, Database};
use crate::config::model::{RepositoryDefinition, RuntimeConfig, ScheduleDefinition, VolumeDefinition};
use crate::error::{CronvaultError, Result};
use crate::types::generate_short_id;

/// Work the caller has to finish after the rows were reconciled: volume
/// changes go through the mount lifecycle instead of being written directly.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub created_volumes: Vec<String>,
    pub changed_volumes: Vec<(String, VolumeDefinition)>,
    pub orphaned_volumes: Vec<String>,
    pub created_repositories: Vec<String>,
    pub removed_repositories: Vec<String>,
}

/// Brings the rows in line with the configured definitions, matched by name.
/// Runtime fields (status, timestamps, last results) are preserved.
pub fn reconcile(db: &Database, config: &RuntimeConfig, now: DateTime<Utc>) -> Result<ReconcileReport> {
    db.mutate(|state| {
        let mut report = ReconcileReport::default();

        for def in &config.volumes {
            match state.volumes.iter_mut().find(|v| v.name == def.name) {
                Some(row) => {
                    row.auto_remount = def.auto_remount;
                    if row.config != def.config {
                        report.changed_volumes.push((row.id.clone(), def.clone()));
                    }
                }
                None => {
                    let row = new_volume(def);
                    report.created_volumes.push(row.id.clone());
                    state.volumes.push(row);
                }
            }
        }
        let names: HashSet<&str> = config.volumes.iter().map(|v| v.name.as_str()).collect();
        report.orphaned_volumes = state
            .volumes
            .iter()
            .filter(|v| !names.contains(v.name.as_str()))
            .map(|v| v.id.clone())
            .collect();

        for def in &config.repositories {
            match state.repositories.iter_mut().find(|r| r.name == def.name) {
                Some(row) => {
                    row.config = def.config.clone();
                    row.compression_mode = def.compression;
                    row.password = def.password.clone();
                }
                None => {
                    let row = new_repository(def);
                    report.created_repositories.push(row.id.clone());
                    state.repositories.push(row);
                }
            }
        }
        let names: HashSet<&str> = config.repositories.iter().map(|r| r.name.as_str()).collect();
        let removed: Vec<String> = state
            .repositories
            .iter()
            .filter(|r| !names.contains(r.name.as_str()))
            .map(|r| r.id.clone())
            .collect();
        state.repositories.retain(|r| !removed.contains(&r.id));
        report.removed_repositories = removed;

        let mut schedules = Vec::with_capacity(config.schedules.len());
        let mut mirrors = Vec::new();
        for def in &config.schedules {
            let volume_id = lookup(&state.volumes, &def.volume, |v| (&v.name, &v.id))
                .ok_or_else(|| CronvaultError::not_found("volume", def.volume.clone()))?;
            let repository_id = lookup(&state.repositories, &def.repository, |r| (&r.name, &r.id))
                .ok_or_else(|| CronvaultError::not_found("repository", def.repository.clone()))?;
            let existing = state.schedules.iter().find(|s| s.name == def.name).cloned();
            let schedule = apply_schedule(existing, def, volume_id, repository_id, now);

            for mirror in &def.mirrors {
                let mirror_id = lookup(&state.repositories, mirror, |r| (&r.name, &r.id))
                    .ok_or_else(|| CronvaultError::not_found("repository", mirror.clone()))?;
                let row = state
                    .mirrors
                    .iter()
                    .find(|m| m.schedule_id == schedule.id && m.repository_id == mirror_id)
                    .cloned()
                    .unwrap_or(ScheduleMirror {
                        schedule_id: schedule.id.clone(),
                        repository_id: mirror_id,
                        enabled: true,
                        last_copy_at: None,
                        last_copy_status: None,
                        last_copy_error: None,
                    });
                mirrors.push(row);
            }
            schedules.push(schedule);
        }
        state.schedules = schedules;
        state.mirrors = mirrors;

        info!(
            volumes = state.volumes.len(),
            repositories = state.repositories.len(),
            schedules = state.schedules.len(),
            "configuration reconciled"
        );
        Ok(report)
    })
}

fn lookup<T>(rows: &[T], name: &str, key: impl Fn(&T) -> (&String, &String)) -> Option<String> {
    rows.iter()
        .map(&key)
        .find(|(n, _)| n.as_str() == name)
        .map(|(_, id)| id.clone())
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn new_volume(def: &VolumeDefinition) -> Volume {
    Volume {
        id: new_id(),
        short_id: generate_short_id(),
        name: def.name.clone(),
        config: def.config.clone(),
        auto_remount: def.auto_remount,
        status: Default::default(),
        last_error: None,
        last_health_check: None,
    }
}

fn new_repository(def: &RepositoryDefinition) -> Repository {
    Repository {
        id: new_id(),
        short_id: generate_short_id(),
        name: def.name.clone(),
        config: def.config.clone(),
        compression_mode: def.compression,
        password: def.password.clone(),
        status: Default::default(),
        last_checked: None,
        last_error: None,
    }
}

fn apply_schedule(
    existing: Option<BackupSchedule>,
    def: &ScheduleDefinition,
    volume_id: String,
    repository_id: String,
    now: DateTime<Utc>,
) -> BackupSchedule {
    let mut schedule = existing.unwrap_or_else(|| BackupSchedule {
        id: new_id(),
        short_id: generate_short_id(),
        name: def.name.clone(),
        volume_id: String::new(),
        repository_id: String::new(),
        cron_expression: String::new(),
        enabled: def.enabled,
        retention_policy: None,
        include_patterns: Vec::new(),
        exclude_patterns: Vec::new(),
        exclude_if_present: Vec::new(),
        one_file_system: false,
        notifications: Vec::new(),
        last_backup_at: None,
        last_backup_status: None,
        last_backup_error: None,
        next_backup_at: None,
    });
    let cron_changed = schedule.cron_expression != def.cron;
    schedule.volume_id = volume_id;
    schedule.repository_id = repository_id;
    schedule.cron_expression = def.cron.clone();
    schedule.enabled = def.enabled;
    schedule.retention_policy = def.retention.clone();
    schedule.include_patterns = def.include.clone();
    schedule.exclude_patterns = def.exclude.clone();
    schedule.exclude_if_present = def.exclude_if_present.clone();
    schedule.one_file_system = def.one_file_system;
    schedule.notifications = def.notifications.clone();
    if cron_changed || schedule.next_backup_at.is_none() {
        schedule.next_backup_at = next_run(&schedule.cron_expression, now);
    }
    schedule
}
