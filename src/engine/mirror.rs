use chrono::Utc;
use tracing::{info, warn};

use crate::config::model::RetentionPolicy;
use crate::db::models::{BackupSchedule, CopyStatus, Repository};
use crate::db::Database;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::repository::compat::mirror_incompatibility;
use crate::repository::mutex::{RepositoryLockGuard, RepositoryMutex};
use crate::repository::restic::ResticCli;

/// Applies the schedule's retention policy to its own snapshots. Failures
/// are logged; they never change the recorded backup status.
pub async fn apply_retention(
    restic: &ResticCli,
    mutex: &RepositoryMutex,
    schedule: &BackupSchedule,
    repository: &Repository,
    policy: &RetentionPolicy,
) {
    let _guard = mutex.acquire_exclusive(&repository.id, "forget").await;
    match restic.forget(repository, &schedule.short_id, policy).await {
        Ok(()) => info!(schedule = %schedule.name, repository = %repository.name, "retention applied"),
        Err(err) => warn!(
            schedule = %schedule.name,
            repository = %repository.name,
            error = %err,
            "retention failed"
        ),
    }
}

/// Copies the schedule's snapshots to every enabled mirror, one at a time.
pub async fn copy_to_mirrors(
    db: &Database,
    events: &EventBus,
    restic: &ResticCli,
    mutex: &RepositoryMutex,
    schedule: &BackupSchedule,
    source: &Repository,
    snapshot_id: Option<&str>,
) {
    for mirror in db.mirrors_for(&schedule.id).into_iter().filter(|m| m.enabled) {
        let Some(destination) = db.repository(&mirror.repository_id) else {
            warn!(schedule = %schedule.name, repository = %mirror.repository_id, "mirror repository missing");
            continue;
        };
        let (status, error) = match copy_one(events, restic, mutex, schedule, source, &destination, snapshot_id).await {
            Ok(None) => (CopyStatus::Success, None),
            Ok(Some(reason)) => {
                info!(schedule = %schedule.name, mirror = %destination.name, reason = %reason, "mirror skipped");
                (CopyStatus::Skipped, Some(reason))
            }
            Err(err) => {
                warn!(schedule = %schedule.name, mirror = %destination.name, error = %err, "mirror copy failed");
                (CopyStatus::Error, Some(err.to_string()))
            }
        };
        if let Err(err) = db.update_mirror(&schedule.id, &destination.id, |row| {
            row.last_copy_at = Some(Utc::now());
            row.last_copy_status = Some(status);
            row.last_copy_error = error.clone();
        }) {
            warn!(schedule = %schedule.name, mirror = %destination.name, error = %err, "mirror state not recorded");
        }
        events.emit(Event::MirrorCompleted {
            schedule_id: schedule.id.clone(),
            repository_id: destination.id.clone(),
            status,
            error,
        });
    }
}

/// Ok(Some(reason)) when the mirror had to be skipped.
async fn copy_one(
    events: &EventBus,
    restic: &ResticCli,
    mutex: &RepositoryMutex,
    schedule: &BackupSchedule,
    source: &Repository,
    destination: &Repository,
    snapshot_id: Option<&str>,
) -> Result<Option<String>> {
    if let Some(reason) = mirror_incompatibility(source, destination, restic.secrets())? {
        return Ok(Some(reason));
    }
    events.emit(Event::MirrorStarted {
        schedule_id: schedule.id.clone(),
        repository_id: destination.id.clone(),
    });
    let _locks = lock_pair(mutex, source, destination).await;
    restic
        .copy(source, destination, &schedule.short_id, snapshot_id)
        .await?;
    info!(schedule = %schedule.name, mirror = %destination.name, "snapshot copied to mirror");
    Ok(None)
}

/// Source shared, destination exclusive; always taken in id order so two
/// schedules mirroring into each other cannot deadlock.
async fn lock_pair(
    mutex: &RepositoryMutex,
    source: &Repository,
    destination: &Repository,
) -> (RepositoryLockGuard, RepositoryLockGuard) {
    if source.id <= destination.id {
        let a = mutex.acquire_shared(&source.id, "copy").await;
        let b = mutex.acquire_exclusive(&destination.id, "copy").await;
        (a, b)
    } else {
        let b = mutex.acquire_exclusive(&destination.id, "copy").await;
        let a = mutex.acquire_shared(&source.id, "copy").await;
        (a, b)
    }
}
