use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::mutex::RepositoryMutex;
use super::restic::{ResticCli, Snapshot};
use crate::db::models::Repository;
use crate::db::Database;
use crate::error::{CronvaultError, EngineError, Result};
use crate::types::RepositoryStatus;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Repository operations with the lock discipline applied: shared for
/// read-only queries, exclusive for anything that writes.
#[derive(Clone)]
pub struct RepositoryService {
    db: Arc<Database>,
    mutex: RepositoryMutex,
    restic: ResticCli,
}

impl RepositoryService {
    pub fn new(db: Arc<Database>, mutex: RepositoryMutex, restic: ResticCli) -> Self {
        Self { db, mutex, restic }
    }

    fn load(&self, id: &str) -> Result<Repository> {
        self.db
            .repository(id)
            .ok_or_else(|| CronvaultError::not_found("repository", id))
    }

    fn record(&self, id: &str, result: &Result<()>) -> Result<RepositoryStatus> {
        let (status, error) = match result {
            Ok(()) => (RepositoryStatus::Healthy, None),
            Err(err) => (RepositoryStatus::Error, Some(err.to_string())),
        };
        self.db.update_repository(id, |row| {
            row.status = status;
            row.last_error = error;
            row.last_checked = Some(Utc::now());
        })?;
        Ok(status)
    }

    /// Adopts an existing repository when its config is readable and
    /// initializes a new one when there is nothing at the location.
    pub async fn init_or_adopt(&self, id: &str) -> Result<RepositoryStatus> {
        let repo = self.load(id)?;
        let _guard = self.mutex.acquire_exclusive(id, "init").await;
        let result = match self.restic.probe(&repo).await {
            Ok(()) => {
                info!(repository = %repo.name, "adopted existing repository");
                Ok(())
            }
            Err(err) if is_missing(&err) => {
                info!(repository = %repo.name, "initializing repository");
                self.restic.init(&repo).await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            warn!(repository = %repo.name, error = %err, "repository unavailable");
        }
        self.record(id, &result)
    }

    pub async fn health_check(&self, id: &str) -> Result<RepositoryStatus> {
        let repo = self.load(id)?;
        let result = {
            let _guard = self.mutex.acquire_shared(id, "health").await;
            self.restic.probe(&repo).await
        };
        if let Err(err) = &result {
            warn!(repository = %repo.name, error = %err, "repository health check failed");
        }
        self.record(id, &result)
    }

    /// Probes every repository that is not busy. Repositories with an
    /// exclusive holder or waiter are skipped rather than queued behind.
    pub async fn health_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for repo in self.db.repositories() {
            if self.mutex.is_locked(&repo.id) {
                debug!(
                    repository = %repo.name,
                    holders = ?self.mutex.holders(&repo.id),
                    "repository busy; skipping health check"
                );
                report.skipped += 1;
                continue;
            }
            match self.health_check(&repo.id).await {
                Ok(RepositoryStatus::Healthy) => report.checked += 1,
                Ok(_) => {
                    report.checked += 1;
                    report.failed += 1;
                }
                Err(err) => {
                    warn!(repository = %repo.name, error = %err, "health check not recorded");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn snapshots(&self, id: &str, tag: Option<&str>) -> Result<Vec<Snapshot>> {
        let repo = self.load(id)?;
        let _guard = self.mutex.acquire_shared(id, "snapshots").await;
        self.restic.snapshots(&repo, tag).await
    }

    pub async fn check(&self, id: &str, read_data: bool) -> Result<String> {
        let repo = self.load(id)?;
        let result = {
            let _guard = self.mutex.acquire_exclusive(id, "check").await;
            self.restic.check(&repo, read_data).await
        };
        let recorded = result.as_ref().map(|_| ()).map_err(clone_error);
        self.record(id, &recorded)?;
        result
    }

    pub async fn delete_snapshot(&self, id: &str, snapshot_id: &str) -> Result<()> {
        let repo = self.load(id)?;
        let _guard = self.mutex.acquire_exclusive(id, "delete").await;
        self.restic.delete_snapshot(&repo, snapshot_id).await
    }

    pub async fn unlock(&self, id: &str) -> Result<()> {
        let repo = self.load(id)?;
        let _guard = self.mutex.acquire_exclusive(id, "unlock").await;
        self.restic.unlock(&repo).await
    }
}

fn is_missing(err: &CronvaultError) -> bool {
    match err {
        CronvaultError::Engine(EngineError::RepositoryNotFound(_)) => true,
        CronvaultError::Engine(EngineError::Failed { stderr, .. }) => {
            let lower = stderr.to_ascii_lowercase();
            lower.contains("does not exist")
                || lower.contains("is there a repository")
                || lower.contains("no such file or directory")
        }
        _ => false,
    }
}

fn clone_error(err: &CronvaultError) -> CronvaultError {
    match err {
        CronvaultError::Engine(e) => CronvaultError::Engine(e.clone()),
        other => CronvaultError::message(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::local_repository;
    use crate::repository::restic::testing::{cli, fake_restic};
    use std::time::Duration;
    use tempfile::TempDir;

    fn service(dir: &TempDir, script: &str) -> (RepositoryService, Arc<Database>, RepositoryMutex) {
        let db = Arc::new(Database::open(&dir.path().join("state.yaml")).expect("open"));
        let mutex = RepositoryMutex::new();
        let restic = cli(dir.path(), fake_restic(dir.path(), script));
        (RepositoryService::new(db.clone(), mutex.clone(), restic), db, mutex)
    }

    #[tokio::test]
    async fn health_sweep_skips_repositories_under_exclusive_lock() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("calls.log");
        let (service, db, mutex) = service(&dir, &format!("echo \"$2 $3\" >> {}", log.display()));
        db.mutate(|state| {
            state.repositories.push(local_repository("busy", &dir.path().join("busy")));
            state.repositories.push(local_repository("idle", &dir.path().join("idle")));
            Ok(())
        })
        .expect("seed");

        let guard = mutex.acquire_exclusive("busy", "backup").await;
        let report = tokio::time::timeout(Duration::from_secs(5), service.health_sweep())
            .await
            .expect("sweep must not wait for the lock");
        drop(guard);

        assert_eq!(report, SweepReport { checked: 1, skipped: 1, failed: 0 });
        let calls = std::fs::read_to_string(&log).expect("log");
        assert_eq!(calls.lines().collect::<Vec<_>>(), vec![format!("{}/idle cat", dir.path().display())]);
        assert_eq!(db.repository("idle").unwrap().status, RepositoryStatus::Healthy);
        assert_eq!(db.repository("busy").unwrap().status, RepositoryStatus::Unknown);
    }

    #[tokio::test]
    async fn missing_repository_is_initialized() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("calls.log");
        let script = format!(
            "echo \"$3\" >> {log}\nif [ \"$3\" = cat ]; then echo 'Fatal: repository does not exist' >&2; exit 10; fi",
            log = log.display()
        );
        let (service, db, _) = service(&dir, &script);
        db.mutate(|state| {
            state.repositories.push(local_repository("new", &dir.path().join("new")));
            Ok(())
        })
        .expect("seed");

        let status = service.init_or_adopt("new").await.expect("init");
        assert_eq!(status, RepositoryStatus::Healthy);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "cat\ninit\n");
    }

    #[tokio::test]
    async fn wrong_password_is_recorded_as_error() {
        let dir = TempDir::new().expect("tempdir");
        let (service, db, _) = service(&dir, "echo 'Fatal: wrong password' >&2; exit 12");
        db.mutate(|state| {
            state.repositories.push(local_repository("r", &dir.path().join("r")));
            Ok(())
        })
        .expect("seed");

        let status = service.init_or_adopt("r").await.expect("recorded");
        assert_eq!(status, RepositoryStatus::Error);
        let row = db.repository("r").unwrap();
        assert_eq!(row.last_error.as_deref(), Some("wrong repository password: Fatal: wrong password"));
        assert!(row.last_checked.is_some());
    }
}
