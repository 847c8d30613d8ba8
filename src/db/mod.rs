pub mod models;
pub mod reconcile;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::cron::CronExpression;
use crate::error::{CronvaultError, Result};
use crate::types::BackupStatus;

use self::models::{BackupSchedule, Repository, ScheduleMirror, State, Volume};

pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// The YAML state file holding every row. Each mutation is applied to a copy
/// of the state and only committed once it reached the disk.
pub struct Database {
    path: PathBuf,
    state: Mutex<State>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let contents = fs::read_to_string(path)
                .map_err(|e| CronvaultError::message(format!("read {}: {}", path.display(), e)))?;
            if contents.trim().is_empty() {
                State::default()
            } else {
                serde_yaml::from_str(&contents).map_err(|e| {
                    CronvaultError::message(format!("parse state {}: {}", path.display(), e))
                })?
            }
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    CronvaultError::message(format!("create {}: {}", parent.display(), e))
                })?;
            }
            let state = State::default();
            write_state(path, &state)?;
            state
        };
        debug!(path = %path.display(), "state opened");
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the last committed state intact.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn snapshot(&self) -> State {
        self.lock().clone()
    }

    /// Applies `f` to a copy of the state, persists it atomically and then
    /// commits it in memory. Nothing changes when `f` or the write fails.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let value = f(&mut next)?;
        if next != *guard {
            write_state(&self.path, &next)?;
            *guard = next;
        }
        Ok(value)
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.lock().volumes.clone()
    }

    pub fn volume(&self, id: &str) -> Option<Volume> {
        self.lock().volumes.iter().find(|v| v.id == id).cloned()
    }

    pub fn volume_by_name(&self, name: &str) -> Option<Volume> {
        self.lock().volumes.iter().find(|v| v.name == name).cloned()
    }

    pub fn repositories(&self) -> Vec<Repository> {
        self.lock().repositories.clone()
    }

    pub fn repository(&self, id: &str) -> Option<Repository> {
        self.lock().repositories.iter().find(|r| r.id == id).cloned()
    }

    pub fn repository_by_name(&self, name: &str) -> Option<Repository> {
        self.lock()
            .repositories
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    pub fn schedules(&self) -> Vec<BackupSchedule> {
        self.lock().schedules.clone()
    }

    pub fn schedule(&self, id: &str) -> Option<BackupSchedule> {
        self.lock().schedules.iter().find(|s| s.id == id).cloned()
    }

    pub fn schedule_by_name(&self, name: &str) -> Option<BackupSchedule> {
        self.lock().schedules.iter().find(|s| s.name == name).cloned()
    }

    pub fn mirrors_for(&self, schedule_id: &str) -> Vec<ScheduleMirror> {
        self.lock()
            .mirrors
            .iter()
            .filter(|m| m.schedule_id == schedule_id)
            .cloned()
            .collect()
    }

    pub fn update_volume(&self, id: &str, f: impl FnOnce(&mut Volume)) -> Result<Volume> {
        self.mutate(|state| {
            let row = state
                .volumes
                .iter_mut()
                .find(|v| v.id == id)
                .ok_or_else(|| CronvaultError::not_found("volume", id))?;
            f(row);
            Ok(row.clone())
        })
    }

    pub fn update_repository(&self, id: &str, f: impl FnOnce(&mut Repository)) -> Result<Repository> {
        self.mutate(|state| {
            let row = state
                .repositories
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| CronvaultError::not_found("repository", id))?;
            f(row);
            Ok(row.clone())
        })
    }

    pub fn update_schedule(
        &self,
        id: &str,
        f: impl FnOnce(&mut BackupSchedule),
    ) -> Result<BackupSchedule> {
        self.mutate(|state| {
            let row = state
                .schedules
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| CronvaultError::not_found("schedule", id))?;
            f(row);
            Ok(row.clone())
        })
    }

    pub fn update_mirror(
        &self,
        schedule_id: &str,
        repository_id: &str,
        f: impl FnOnce(&mut ScheduleMirror),
    ) -> Result<ScheduleMirror> {
        self.mutate(|state| {
            let row = state
                .mirrors
                .iter_mut()
                .find(|m| m.schedule_id == schedule_id && m.repository_id == repository_id)
                .ok_or_else(|| CronvaultError::not_found("mirror", repository_id))?;
            f(row);
            Ok(row.clone())
        })
    }

    /// Deletes the volume row. Schedules referring to it go with it.
    pub fn remove_volume(&self, id: &str) -> Result<()> {
        self.mutate(|state| {
            state.volumes.retain(|v| v.id != id);
            let dropped: Vec<String> = state
                .schedules
                .iter()
                .filter(|s| s.volume_id == id)
                .map(|s| s.id.clone())
                .collect();
            state.schedules.retain(|s| s.volume_id != id);
            state.mirrors.retain(|m| !dropped.contains(&m.schedule_id));
            Ok(())
        })
    }

    /// Resets schedules a crash left `in_progress` and returns their names.
    pub fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.mutate(|state| {
            let mut recovered = Vec::new();
            for schedule in state
                .schedules
                .iter_mut()
                .filter(|s| s.last_backup_status == Some(BackupStatus::InProgress))
            {
                schedule.last_backup_status = Some(BackupStatus::Error);
                schedule.last_backup_error = Some(INTERRUPTED_BY_RESTART.to_string());
                schedule.next_backup_at = next_run(&schedule.cron_expression, now);
                warn!(schedule = %schedule.name, "backup was interrupted by a restart");
                recovered.push(schedule.name.clone());
            }
            Ok(recovered)
        })
    }
}

pub(crate) fn next_run(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronExpression::parse(expr) {
        Ok(cron) => cron.next_after(after),
        Err(err) => {
            warn!(cron = expr, error = %err, "cannot compute next run");
            None
        }
    }
}

fn write_state(path: &Path, state: &State) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let yaml = serde_yaml::to_string(state)
        .map_err(|e| CronvaultError::message(format!("serialize state: {}", e)))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| CronvaultError::message(format!("create temp in {}: {}", dir.display(), e)))?;
    tmp.write_all(yaml.as_bytes())
        .map_err(|e| CronvaultError::message(format!("write state: {}", e)))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CronvaultError::message(format!("sync state: {}", e)))?;
    tmp.persist(path)
        .map_err(|e| CronvaultError::message(format!("persist {}: {}", path.display(), e.error)))?;
    Ok(())
}
