use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::model::{RuntimeConfig, Settings};
use crate::db::reconcile::{reconcile, ReconcileReport};
use crate::db::Database;
use crate::engine::BackupExecutor;
use crate::error::Result;
use crate::events::EventBus;
use crate::mount::inspect::PROC_MOUNTS;
use crate::notify::{LogNotifier, Notifier};
use crate::repository::mutex::RepositoryMutex;
use crate::repository::restic::ResticCli;
use crate::repository::service::RepositoryService;
use crate::scheduler::Scheduler;
use crate::secrets::{DefaultSecretResolver, SecretResolver};
use crate::types::VolumeStatus;
use crate::util::command::SystemCommandRunner;
use crate::util::paths::{ensure_private_dir, sweep_stale_files};
use crate::volume::{platform_supported, MountEnvironment};
use crate::volume::service::VolumeService;

const STALE_CREDENTIALS_AGE: Duration = Duration::from_secs(0);

pub const BACKUP_DISPATCH_JOB: &str = "backup-dispatch";
pub const VOLUME_HEALTH_JOB: &str = "volume-health";
pub const REPOSITORY_HEALTH_JOB: &str = "repository-health";

/// Everything the process shares, built once at startup and passed around
/// explicitly.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub db: Arc<Database>,
    pub events: EventBus,
    pub mutex: RepositoryMutex,
    pub volumes: VolumeService,
    pub repositories: RepositoryService,
    pub executor: BackupExecutor,
}

impl AppContext {
    pub fn build(config: &RuntimeConfig) -> Result<Self> {
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let secrets: Arc<dyn SecretResolver> =
            Arc::new(DefaultSecretResolver::new(config.settings.secrets_dir.clone()));
        let env = MountEnvironment {
            runner: Arc::new(SystemCommandRunner),
            secrets: secrets.clone(),
            mount_table: PathBuf::from(PROC_MOUNTS),
            mount_base: config.settings.mount_base.clone(),
            credentials_base: config.settings.credentials_dir(),
            timeout: config.settings.mount_timeout,
            platform_supported: platform_supported(),
        };
        Self::with_parts(config, env, secrets, notifier)
    }

    pub fn with_parts(
        config: &RuntimeConfig,
        env: MountEnvironment,
        secrets: Arc<dyn SecretResolver>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let settings = config.settings.clone();
        ensure_private_dir(&settings.data_dir)?;
        ensure_private_dir(&settings.runtime_dir)?;
        let db = Arc::new(Database::open(&settings.state_path())?);
        let events = EventBus::new();
        let mutex = RepositoryMutex::new();
        let restic = ResticCli::new(settings.restic.clone(), restic_scratch(&settings), secrets);
        let volumes = VolumeService::new(db.clone(), events.clone(), env);
        let repositories = RepositoryService::new(db.clone(), mutex.clone(), restic.clone());
        let executor = BackupExecutor::new(
            db.clone(),
            events.clone(),
            mutex.clone(),
            restic,
            volumes.clone(),
            notifier,
        );
        Ok(Self {
            settings,
            db,
            events,
            mutex,
            volumes,
            repositories,
            executor,
        })
    }

    /// Brings the state file in line with the configuration. Volume changes
    /// that need the mount lifecycle are only reported here.
    pub fn reconcile(&self, config: &RuntimeConfig) -> Result<ReconcileReport> {
        let report = reconcile(&self.db, config, Utc::now())?;
        if !report.changed_volumes.is_empty() || !report.orphaned_volumes.is_empty() {
            debug!(
                changed = report.changed_volumes.len(),
                orphaned = report.orphaned_volumes.len(),
                "volume changes are applied when the daemon starts"
            );
        }
        Ok(report)
    }

    /// Daemon startup: clean up after a crash, apply configuration changes
    /// that need the mount lifecycle and bring repositories and volumes up.
    pub async fn startup(&self, config: &RuntimeConfig) -> Result<()> {
        let keep: Vec<PathBuf> = self
            .db
            .volumes()
            .iter()
            .filter(|v| v.status == VolumeStatus::Mounted)
            .map(|v| self.volumes.backend(v).credentials_dir().to_path_buf())
            .collect();
        let removed = sweep_stale_files(&self.settings.credentials_dir(), STALE_CREDENTIALS_AGE, &keep)
            + sweep_stale_files(&restic_scratch(&self.settings), STALE_CREDENTIALS_AGE, &[]);
        if removed > 0 {
            info!(removed, "removed stale credential files");
        }

        let recovered = self.db.recover_interrupted(Utc::now())?;
        if !recovered.is_empty() {
            warn!(schedules = ?recovered, "reset backups interrupted by restart");
        }

        let report = self.reconcile(config)?;
        self.apply(report).await;

        for repository in self.db.repositories() {
            if let Err(err) = self.repositories.init_or_adopt(&repository.id).await {
                warn!(repository = %repository.name, error = %err, "repository setup failed");
            }
        }
        for volume in self.db.volumes().into_iter().filter(|v| v.auto_remount) {
            if let Err(err) = self.volumes.mount_volume(&volume.id).await {
                warn!(volume = %volume.name, error = %err, "mount failed");
            }
        }
        Ok(())
    }

    async fn apply(&self, report: ReconcileReport) {
        for (id, def) in report.changed_volumes {
            if let Err(err) = self
                .volumes
                .update_volume_config(&id, def.config, def.auto_remount)
                .await
            {
                warn!(volume = %def.name, error = %err, "volume reconfiguration failed");
            }
        }
        for id in report.orphaned_volumes {
            if let Err(err) = self.volumes.delete_volume(&id).await {
                warn!(volume = %id, error = %err, "volume removal failed");
            }
        }
        for id in report.removed_repositories {
            info!(repository = %id, "repository removed from configuration; remote data kept");
        }
    }

    /// The daemon's job table.
    pub fn scheduler(&self) -> Result<Scheduler> {
        let cfg = &self.settings.scheduler;
        let mut scheduler = Scheduler::new(cfg.tick);

        let executor = self.executor.clone();
        scheduler
            .job(BACKUP_DISPATCH_JOB, move || {
                let executor = executor.clone();
                async move {
                    dispatch_due_backups(&executor);
                    Ok(())
                }
            })
            .schedule(&cfg.backup_dispatch_cron)?;

        let volumes = self.volumes.clone();
        scheduler
            .job(VOLUME_HEALTH_JOB, move || {
                let volumes = volumes.clone();
                async move {
                    let report = volumes.health_sweep().await;
                    info!(
                        healthy = report.healthy,
                        remounted = report.remounted,
                        failed = report.failed,
                        "volume health sweep"
                    );
                    Ok(())
                }
            })
            .schedule(&cfg.volume_health_cron)?;

        let repositories = self.repositories.clone();
        scheduler
            .job(REPOSITORY_HEALTH_JOB, move || {
                let repositories = repositories.clone();
                async move {
                    let report = repositories.health_sweep().await;
                    info!(
                        checked = report.checked,
                        skipped = report.skipped,
                        failed = report.failed,
                        "repository health sweep"
                    );
                    Ok(())
                }
            })
            .schedule(&cfg.repository_health_cron)?;

        Ok(scheduler)
    }
}

fn restic_scratch(settings: &Settings) -> PathBuf {
    settings.runtime_dir.join("restic")
}

/// Starts every due schedule in its own task so a long backup never delays
/// the others.
pub fn dispatch_due_backups(executor: &BackupExecutor) -> usize {
    let due = executor.schedules_to_execute(Utc::now());
    let count = due.len();
    for schedule in due {
        executor.spawn_backup(schedule, false);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load::parse_config;
    use crate::notify::testing::RecordingNotifier;
    use crate::types::BackupStatus;
    use crate::volume::testing::Host;
    use crate::repository::restic::testing::fake_restic;

    fn config(host: &Host, restic: &std::path::Path, data: &std::path::Path) -> RuntimeConfig {
        let root = host.dir.path();
        let yaml = format!(
            r#"
dataDir: "{root}/lib"
runtimeDir: "{root}/run"
secretsDir: "{root}/secrets"
restic:
  binary: "{restic}"
scheduler:
  backupDispatchCron: "*/5 * * * *"
volumes:
  - name: "data"
    backend: directory
    path: "{data}"
repositories:
  - name: "main"
    backend: local
    password: "pw"
schedules:
  - name: "data-often"
    volume: "data"
    repository: "main"
    cron: "* * * * *"
"#,
            root = root.display(),
            restic = restic.display(),
            data = data.display()
        );
        parse_config(&yaml).expect("config")
    }

    #[tokio::test]
    async fn startup_recovers_and_dispatch_runs_due_backups() {
        let host = Host::new();
        let data = host.dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let cfg = config(&host, &fake_restic(host.dir.path(), "exit 0"), &data);
        let ctx = AppContext::with_parts(
            &cfg,
            host.env.clone(),
            host.env.secrets.clone(),
            Arc::new(RecordingNotifier::default()),
        )
        .expect("context");
        ctx.reconcile(&cfg).expect("reconcile");

        let schedule = ctx.db.schedule_by_name("data-often").expect("schedule");
        ctx.db
            .update_schedule(&schedule.id, |s| {
                s.last_backup_status = Some(BackupStatus::InProgress);
                s.next_backup_at = Some(Utc::now() - chrono::Duration::minutes(10));
            })
            .unwrap();
        let stale = ctx.settings.runtime_dir.join("restic").join("leftover");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("gcs.json"), "{}").unwrap();

        ctx.startup(&cfg).await.expect("startup");
        assert!(!stale.exists());
        let recovered = ctx.db.schedule(&schedule.id).unwrap();
        assert_eq!(recovered.last_backup_status, Some(BackupStatus::Error));
        assert_eq!(ctx.db.volume_by_name("data").unwrap().status, VolumeStatus::Mounted);

        // Recovery planned the next run in the future; force it due.
        ctx.db
            .update_schedule(&schedule.id, |s| s.next_backup_at = None)
            .unwrap();
        assert_eq!(dispatch_due_backups(&ctx.executor), 1);
        for _ in 0..100 {
            let row = ctx.db.schedule(&schedule.id).unwrap();
            if row.last_backup_status == Some(BackupStatus::Success) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let row = ctx.db.schedule(&schedule.id).unwrap();
        assert_eq!(row.last_backup_status, Some(BackupStatus::Success));
        assert!(row.next_backup_at.unwrap() > Utc::now() - chrono::Duration::seconds(1));
    }

    #[test]
    fn scheduler_registers_the_daemon_jobs() {
        let host = Host::new();
        let data = host.dir.path().join("data");
        let cfg = config(&host, &fake_restic(host.dir.path(), "exit 0"), &data);
        let ctx = AppContext::with_parts(
            &cfg,
            host.env.clone(),
            host.env.secrets.clone(),
            Arc::new(RecordingNotifier::default()),
        )
        .expect("context");
        let scheduler = ctx.scheduler().expect("scheduler");
        assert_eq!(
            scheduler.job_ids(),
            vec![BACKUP_DISPATCH_JOB, VOLUME_HEALTH_JOB, REPOSITORY_HEALTH_JOB]
        );
    }
}
