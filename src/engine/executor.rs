use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::mirror::{apply_retention, copy_to_mirrors};
use crate::db::models::{BackupSchedule, Repository, Volume};
use crate::db::{next_run, Database};
use crate::error::{CronvaultError, EngineError, Result};
use crate::events::{Event, EventBus};
use crate::notify::{NotificationContext, NotificationEvent, Notifier};
use crate::repository::mutex::RepositoryMutex;
use crate::repository::restic::{BackupProgress, BackupRequest, BackupRun, BackupSummary, ResticCli};
use crate::types::BackupStatus;
use crate::volume::service::VolumeService;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const INCOMPLETE_SNAPSHOT: &str = "snapshot created, but some source files could not be read";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupResult {
    pub status: BackupStatus,
    pub error: Option<String>,
    pub summary: Option<BackupSummary>,
    pub next_backup_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Skipped(SkipReason),
    Completed(BackupResult),
}

struct Inner {
    db: Arc<Database>,
    events: EventBus,
    mutex: RepositoryMutex,
    restic: ResticCli,
    volumes: VolumeService,
    notifier: Arc<dyn Notifier>,
    running: Mutex<HashMap<String, CancellationToken>>,
    tasks: TaskTracker,
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Clears the schedule's running marker on every exit path.
struct RunningMarker {
    inner: Arc<Inner>,
    schedule_id: String,
}

impl Drop for RunningMarker {
    fn drop(&mut self) {
        self.inner.running().remove(&self.schedule_id);
    }
}

/// Runs backups for schedules: at most one run per schedule at a time,
/// conflicting repository work serialized through the repository mutex.
#[derive(Clone)]
pub struct BackupExecutor {
    inner: Arc<Inner>,
    progress_interval: Duration,
}

impl BackupExecutor {
    pub fn new(
        db: Arc<Database>,
        events: EventBus,
        mutex: RepositoryMutex,
        restic: ResticCli,
        volumes: VolumeService,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                events,
                mutex,
                restic,
                volumes,
                notifier,
                running: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
            }),
            progress_interval: PROGRESS_INTERVAL,
        }
    }

    /// Minimum gap between two `backup:progress` events of one run.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Enabled schedules whose next run is due at `now`.
    pub fn schedules_to_execute(&self, now: DateTime<Utc>) -> Vec<BackupSchedule> {
        self.inner
            .db
            .schedules()
            .into_iter()
            .filter(|s| s.enabled && s.is_due(now))
            .collect()
    }

    pub fn is_running(&self, schedule_id: &str) -> bool {
        self.inner.running().contains_key(schedule_id)
    }

    /// Cancels a running backup; the run records `stopped` once the child
    /// is gone. Returns false when nothing was running.
    pub fn stop_backup(&self, schedule_id: &str) -> bool {
        match self.inner.running().get(schedule_id) {
            Some(token) => {
                info!(schedule_id, "stopping backup");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for token in self.inner.running().values() {
            token.cancel();
        }
    }

    /// Runs a backup in a background task that `shutdown` waits for.
    pub fn spawn_backup(&self, schedule: BackupSchedule, manual: bool) {
        let executor = self.clone();
        self.inner.tasks.spawn(async move {
            match executor.execute_backup(&schedule.id, manual).await {
                Ok(ExecutionOutcome::Completed(_)) | Ok(ExecutionOutcome::Skipped(_)) => {}
                Err(err) => warn!(schedule = %schedule.name, error = %err, "backup not executed"),
            }
        });
    }

    /// Stops every running backup and waits until each has recorded its
    /// final status.
    pub async fn shutdown(&self) {
        self.stop_all();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    fn claim(&self, schedule_id: &str) -> Option<(RunningMarker, CancellationToken)> {
        let mut running = self.inner.running();
        if running.contains_key(schedule_id) {
            return None;
        }
        let token = CancellationToken::new();
        running.insert(schedule_id.to_string(), token.clone());
        Some((
            RunningMarker {
                inner: self.inner.clone(),
                schedule_id: schedule_id.to_string(),
            },
            token,
        ))
    }

    pub async fn execute_backup(&self, schedule_id: &str, manual: bool) -> Result<ExecutionOutcome> {
        let schedule = self
            .inner
            .db
            .schedule(schedule_id)
            .ok_or_else(|| CronvaultError::not_found("schedule", schedule_id))?;
        if !schedule.enabled && !manual {
            debug!(schedule = %schedule.name, "schedule disabled; skipping");
            return Ok(ExecutionOutcome::Skipped(SkipReason::Disabled));
        }
        let Some((marker, cancel)) = self.claim(schedule_id) else {
            info!(schedule = %schedule.name, "backup already running; skipping");
            return Ok(ExecutionOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let db = &self.inner.db;
        let volume = db.volume(&schedule.volume_id);
        let repository = db.repository(&schedule.repository_id);
        let context = NotificationContext {
            schedule: schedule.name.clone(),
            volume: volume.as_ref().map(|v| v.name.clone()).unwrap_or_default(),
            repository: repository.as_ref().map(|r| r.name.clone()).unwrap_or_default(),
            error: None,
            snapshot_id: None,
            duration_seconds: None,
        };

        if let Err(err) = db.update_schedule(schedule_id, |row| {
            row.last_backup_status = Some(BackupStatus::InProgress);
            row.last_backup_error = None;
        }) {
            warn!(schedule = %schedule.name, error = %err, "cannot record backup start");
        }
        info!(
            schedule = %schedule.name,
            volume = %context.volume,
            repository = %context.repository,
            manual,
            "backup started"
        );
        self.inner.events.emit(Event::BackupStarted {
            schedule_id: schedule.id.clone(),
            schedule: schedule.name.clone(),
            volume: context.volume.clone(),
            repository: context.repository.clone(),
        });
        self.notify(&schedule, NotificationEvent::Start, &context);

        let started = Instant::now();
        let (status, error, summary) = match (volume, repository.as_ref()) {
            (Some(volume), Some(repository)) => {
                match self.run(&schedule, &volume, repository, &cancel).await {
                    Ok(run) => classify(run),
                    Err(err) => (BackupStatus::Error, Some(err.to_string()), None),
                }
            }
            (None, _) => (
                BackupStatus::Error,
                Some(CronvaultError::not_found("volume", schedule.volume_id.clone()).to_string()),
                None,
            ),
            (_, None) => (
                BackupStatus::Error,
                Some(CronvaultError::not_found("repository", schedule.repository_id.clone()).to_string()),
                None,
            ),
        };

        let finished = Utc::now();
        let next_backup_at = next_run(&schedule.cron_expression, finished);
        if let Err(err) = db.update_schedule(schedule_id, |row| {
            row.last_backup_at = Some(finished);
            row.last_backup_status = Some(status);
            row.last_backup_error = error.clone();
            row.next_backup_at = next_backup_at;
        }) {
            error!(schedule = %schedule.name, error = %err, "cannot record backup result");
        }
        drop(marker);

        match status {
            BackupStatus::Success => info!(schedule = %schedule.name, "backup completed"),
            BackupStatus::Warning => warn!(
                schedule = %schedule.name,
                error = error.as_deref().unwrap_or(""),
                "backup completed with warnings"
            ),
            BackupStatus::Stopped => info!(schedule = %schedule.name, "backup stopped"),
            _ => error!(
                schedule = %schedule.name,
                error = error.as_deref().unwrap_or(""),
                "backup failed"
            ),
        }
        self.inner.events.emit(Event::BackupCompleted {
            schedule_id: schedule.id.clone(),
            status,
            error: error.clone(),
            summary: summary.clone(),
        });

        if matches!(status, BackupStatus::Success | BackupStatus::Warning) {
            if let Some(repository) = &repository {
                self.follow_up(&schedule, repository, summary.as_ref()).await;
            }
        }

        let event = match status {
            BackupStatus::Success => Some(NotificationEvent::Success),
            BackupStatus::Warning => Some(NotificationEvent::Warning),
            BackupStatus::Error => Some(NotificationEvent::Failure),
            BackupStatus::Stopped | BackupStatus::InProgress => None,
        };
        if let Some(event) = event {
            let context = NotificationContext {
                error: error.clone(),
                snapshot_id: summary.as_ref().and_then(|s| s.snapshot_id.clone()),
                duration_seconds: Some(started.elapsed().as_secs_f64()),
                ..context
            };
            self.notify(&schedule, event, &context);
        }

        Ok(ExecutionOutcome::Completed(BackupResult {
            status,
            error,
            summary,
            next_backup_at,
        }))
    }

    async fn run(
        &self,
        schedule: &BackupSchedule,
        volume: &Volume,
        repository: &Repository,
        cancel: &CancellationToken,
    ) -> Result<BackupRun> {
        let source = tokio::select! {
            source = self.inner.volumes.ensure_mounted(&volume.id) => source?,
            _ = cancel.cancelled() => return Ok(BackupRun::Cancelled),
        };
        let _guard = tokio::select! {
            guard = self.inner.mutex.acquire_exclusive(&repository.id, "backup") => guard,
            _ = cancel.cancelled() => return Ok(BackupRun::Cancelled),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_progress(
            rx,
            self.inner.events.clone(),
            schedule.id.clone(),
            self.progress_interval,
        ));
        let request = BackupRequest {
            source: &source,
            tag: &schedule.short_id,
            compression: repository.compression_mode,
            include: &schedule.include_patterns,
            exclude: &schedule.exclude_patterns,
            exclude_if_present: &schedule.exclude_if_present,
            one_file_system: schedule.one_file_system,
        };
        let run = self
            .inner
            .restic
            .backup(repository, &request, Some(tx), cancel)
            .await;
        let _ = forwarder.await;
        run
    }

    async fn follow_up(
        &self,
        schedule: &BackupSchedule,
        repository: &Repository,
        summary: Option<&BackupSummary>,
    ) {
        if let Some(policy) = &schedule.retention_policy {
            apply_retention(&self.inner.restic, &self.inner.mutex, schedule, repository, policy).await;
        }
        copy_to_mirrors(
            &self.inner.db,
            &self.inner.events,
            &self.inner.restic,
            &self.inner.mutex,
            schedule,
            repository,
            summary.and_then(|s| s.snapshot_id.as_deref()),
        )
        .await;
    }

    /// Fire and forget: delivery problems never touch the backup result.
    fn notify(&self, schedule: &BackupSchedule, event: NotificationEvent, context: &NotificationContext) {
        for subscription in schedule.notifications.iter().filter(|s| event.wanted_by(s)) {
            let notifier = self.inner.notifier.clone();
            let destination = subscription.destination.clone();
            let schedule_id = schedule.id.clone();
            let context = context.clone();
            tokio::spawn(async move {
                if let Err(err) = notifier
                    .send_backup_notification(&destination, &schedule_id, event, &context)
                    .await
                {
                    warn!(destination = %destination, error = %err, "notification failed");
                }
            });
        }
    }
}

async fn forward_progress(
    mut rx: mpsc::UnboundedReceiver<BackupProgress>,
    events: EventBus,
    schedule_id: String,
    interval: Duration,
) {
    let mut last: Option<Instant> = None;
    while let Some(progress) = rx.recv().await {
        if last.map_or(true, |at| at.elapsed() >= interval) {
            last = Some(Instant::now());
            events.emit(Event::BackupProgress {
                schedule_id: schedule_id.clone(),
                progress,
            });
        }
    }
}

fn classify(run: BackupRun) -> (BackupStatus, Option<String>, Option<BackupSummary>) {
    match run {
        BackupRun::Cancelled => (BackupStatus::Stopped, None, None),
        BackupRun::Finished {
            exit_code,
            stderr,
            summary,
            item_errors,
        } => {
            let status = BackupStatus::from_exit_code(exit_code);
            let error = match status {
                BackupStatus::Success => None,
                BackupStatus::Warning => {
                    let stderr = stderr.trim();
                    if !stderr.is_empty() {
                        Some(stderr.to_string())
                    } else if !item_errors.is_empty() {
                        Some(item_errors.join("\n"))
                    } else {
                        Some(INCOMPLETE_SNAPSHOT.to_string())
                    }
                }
                _ => Some(EngineError::from_exit(exit_code, &stderr).to_string()),
            };
            (status, error, summary)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{NotificationSubscription, RetentionPolicy};
    use crate::db::models::ScheduleMirror;
    use crate::db::testing::{directory_volume, local_repository, schedule};
    use crate::db::models::CopyStatus;
    use crate::notify::testing::RecordingNotifier;
    use crate::repository::config::{RepositoryConfig, S3RepositoryConfig};
    use crate::repository::restic::testing::{cli, fake_restic};
    use crate::volume::config::{NfsConfig, VolumeConfig};
    use crate::volume::testing::Host;
    use chrono::Timelike;
    use futures::StreamExt;
    use std::path::PathBuf;

    struct Fixture {
        host: Host,
        db: Arc<Database>,
        events: EventBus,
        mutex: RepositoryMutex,
        notifier: Arc<RecordingNotifier>,
        executor: BackupExecutor,
        log: PathBuf,
    }

    /// A directory volume `v`, local repositories `r` and `m` and schedule
    /// `s` backing up `v` into `r`. The fake restic logs its subcommand.
    fn fixture(script: &str) -> Fixture {
        let host = Host::new();
        let root = host.dir.path().to_path_buf();
        let log = root.join("restic.log");
        let data = root.join("data");
        std::fs::create_dir_all(&data).unwrap();
        let body = format!("echo \"$3\" >> {}\n{}", log.display(), script);
        let restic = cli(&root, fake_restic(&root, &body));
        let db = Arc::new(Database::open(&root.join("state.yaml")).expect("open"));
        db.mutate(|state| {
            state.volumes.push(directory_volume("v", &data));
            state.repositories.push(local_repository("r", &root.join("r")));
            state.repositories.push(local_repository("m", &root.join("m")));
            state.schedules.push(schedule("s", "v", "r"));
            Ok(())
        })
        .expect("seed");
        let events = EventBus::new();
        let mutex = RepositoryMutex::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let volumes = VolumeService::new(db.clone(), events.clone(), host.env.clone());
        let executor = BackupExecutor::new(
            db.clone(),
            events.clone(),
            mutex.clone(),
            restic,
            volumes,
            notifier.clone(),
        );
        Fixture {
            host,
            db,
            events,
            mutex,
            notifier,
            executor,
            log,
        }
    }

    impl Fixture {
        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(&self.log)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn completed(outcome: ExecutionOutcome) -> BackupResult {
        match outcome {
            ExecutionOutcome::Completed(result) => result,
            other => panic!("expected a completed run, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrent_runs_of_one_schedule_are_single_flight() {
        let f = fixture("sleep 1");
        let (a, b) = tokio::join!(
            f.executor.execute_backup("s", false),
            f.executor.execute_backup("s", true)
        );
        let outcomes = [a.expect("a"), b.expect("b")];
        let skipped = outcomes
            .iter()
            .filter(|o| **o == ExecutionOutcome::Skipped(SkipReason::AlreadyRunning))
            .count();
        assert_eq!(skipped, 1);
        assert_eq!(f.calls(), vec!["backup".to_string()]);
        assert!(!f.executor.is_running("s"));
    }

    #[tokio::test]
    async fn disabled_schedules_only_run_when_triggered_manually() {
        let f = fixture("exit 0");
        f.db.update_schedule("s", |s| s.enabled = false).unwrap();
        let before = f.db.schedule("s").unwrap();

        let outcome = f.executor.execute_backup("s", false).await.expect("auto");
        assert_eq!(outcome, ExecutionOutcome::Skipped(SkipReason::Disabled));
        assert!(f.calls().is_empty());
        assert_eq!(f.db.schedule("s").unwrap(), before);
        assert!(f.executor.schedules_to_execute(Utc::now()).is_empty());

        let result = completed(f.executor.execute_backup("s", true).await.expect("manual"));
        assert_eq!(result.status, BackupStatus::Success);
        assert_eq!(f.calls(), vec!["backup".to_string()]);
    }

    #[tokio::test]
    async fn exit_code_three_is_a_warning_with_stderr() {
        let f = fixture("echo 'error: unreadable file X' >&2\nexit 3");
        let mut stream = f.events.subscribe();
        let now = Utc::now();

        let result = completed(f.executor.execute_backup("s", false).await.expect("run"));
        assert_eq!(result.status, BackupStatus::Warning);
        assert!(result.error.as_deref().unwrap().contains("unreadable file X"));

        let row = f.db.schedule("s").unwrap();
        assert_eq!(row.last_backup_status, Some(BackupStatus::Warning));
        assert!(row.last_backup_error.unwrap().contains("unreadable file X"));
        assert!(row.last_backup_at.unwrap() >= now);
        assert!(row.next_backup_at.unwrap() > row.last_backup_at.unwrap());

        assert_eq!(stream.next().await.unwrap().name(), "backup:started");
        assert_eq!(stream.next().await.unwrap().name(), "backup:completed");
    }

    #[tokio::test]
    async fn failures_are_classified_and_skip_follow_ups() {
        let f = fixture("echo 'Fatal: unable to open repository' >&2\nexit 1");
        f.db.update_schedule("s", |s| {
            s.retention_policy = Some(RetentionPolicy {
                keep_last: Some(3),
                ..RetentionPolicy::default()
            });
            s.notifications = vec![NotificationSubscription {
                destination: "ops".to_string(),
                on_start: false,
                on_success: true,
                on_warning: true,
                on_failure: true,
            }];
        })
        .unwrap();

        let result = completed(f.executor.execute_backup("s", false).await.expect("run"));
        assert_eq!(result.status, BackupStatus::Error);
        assert!(result.error.unwrap().contains("unable to open repository"));
        assert_eq!(f.calls(), vec!["backup".to_string()]);
        assert!(result.next_backup_at.unwrap() > Utc::now() - chrono::Duration::seconds(1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = f.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("ops".to_string(), NotificationEvent::Failure)]);
    }

    #[tokio::test]
    async fn every_five_minutes_lands_on_the_next_boundary() {
        let f = fixture("exit 0");
        let result = completed(f.executor.execute_backup("s", false).await.expect("run"));
        let next = result.next_backup_at.expect("next");
        let finished = f.db.schedule("s").unwrap().last_backup_at.unwrap();
        assert!(next > finished);
        assert!(next - finished <= chrono::Duration::minutes(5));
        assert_eq!(next.minute() % 5, 0);
        assert_eq!(next.second(), 0);
        assert!(f.executor.schedules_to_execute(finished).is_empty());
        assert_eq!(f.executor.schedules_to_execute(next).len(), 1);
    }

    #[tokio::test]
    async fn stop_kills_the_backup_and_records_stopped() {
        let f = fixture("exec sleep 30");
        let executor = f.executor.clone();
        let run = tokio::spawn(async move { executor.execute_backup("s", true).await });
        for _ in 0..100 {
            if f.calls().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(f.executor.stop_backup("s"));

        let result = completed(run.await.unwrap().expect("run"));
        assert_eq!(result.status, BackupStatus::Stopped);
        assert_eq!(f.db.schedule("s").unwrap().last_backup_status, Some(BackupStatus::Stopped));
        assert!(!f.mutex.is_locked("r"));
        assert!(!f.executor.stop_backup("s"));
    }

    #[tokio::test]
    async fn retention_and_mirrors_follow_a_successful_backup() {
        let f = fixture(
            r#"if [ "$3" = backup ]; then echo '{"message_type":"summary","snapshot_id":"feed"}'; fi"#,
        );
        f.db.mutate(|state| {
            let s = state.schedules.iter_mut().find(|s| s.id == "s").unwrap();
            s.retention_policy = Some(RetentionPolicy {
                keep_daily: Some(7),
                ..RetentionPolicy::default()
            });
            state.mirrors.push(ScheduleMirror {
                schedule_id: "s".to_string(),
                repository_id: "m".to_string(),
                enabled: true,
                last_copy_at: None,
                last_copy_status: None,
                last_copy_error: None,
            });
            Ok(())
        })
        .unwrap();

        let result = completed(f.executor.execute_backup("s", false).await.expect("run"));
        assert_eq!(result.status, BackupStatus::Success);
        assert_eq!(result.summary.unwrap().snapshot_id.as_deref(), Some("feed"));
        assert_eq!(f.calls(), vec!["backup", "forget", "copy"]);
        let mirror = &f.db.mirrors_for("s")[0];
        assert_eq!(mirror.last_copy_status, Some(CopyStatus::Success));
    }

    #[tokio::test]
    async fn mirrors_with_conflicting_credentials_are_skipped() {
        let f = fixture("exit 0");
        let s3 = |bucket: &str, key: &str| {
            RepositoryConfig::S3(S3RepositoryConfig {
                endpoint: "https://s3.example".to_string(),
                bucket: bucket.to_string(),
                access_key_id: key.to_string(),
                secret_access_key: "secret".to_string(),
            })
        };
        f.db.update_repository("r", |r| r.config = s3("primary", "KEY1")).unwrap();
        f.db.update_repository("m", |r| r.config = s3("mirror", "KEY2")).unwrap();
        f.db.mutate(|state| {
            state.mirrors.push(ScheduleMirror {
                schedule_id: "s".to_string(),
                repository_id: "m".to_string(),
                enabled: true,
                last_copy_at: None,
                last_copy_status: None,
                last_copy_error: None,
            });
            Ok(())
        })
        .unwrap();

        let result = completed(f.executor.execute_backup("s", false).await.expect("run"));
        assert_eq!(result.status, BackupStatus::Success);
        assert_eq!(f.calls(), vec!["backup"]);
        let mirror = &f.db.mirrors_for("s")[0];
        assert_eq!(mirror.last_copy_status, Some(CopyStatus::Skipped));
        assert!(mirror.last_copy_error.as_deref().unwrap().contains("different credentials"));
    }

    #[tokio::test]
    async fn wrong_password_keeps_restic_stderr() {
        let f = fixture("echo 'Fatal: wrong password or no key found for repo X' >&2\nexit 12");
        let result = completed(f.executor.execute_backup("s", false).await.expect("run"));
        assert_eq!(result.status, BackupStatus::Error);
        let row = f.db.schedule("s").unwrap();
        assert_eq!(row.last_backup_status, Some(BackupStatus::Error));
        let error = row.last_backup_error.expect("error recorded");
        assert!(error.starts_with("wrong repository password"));
        assert!(error.contains("no key found for repo X"));
    }

    #[tokio::test]
    async fn silent_warning_still_records_a_reason() {
        let f = fixture("exit 3");
        let result = completed(f.executor.execute_backup("s", false).await.expect("run"));
        assert_eq!(result.status, BackupStatus::Warning);
        let error = f.db.schedule("s").unwrap().last_backup_error.expect("error recorded");
        assert_eq!(error, INCOMPLETE_SNAPSHOT);
    }

    const STATUS_LINES: &str = r#"for i in 1 2 3 4 5 6; do
  echo "{\"message_type\":\"status\",\"percent_done\":0.$i,\"files_done\":$i}"
  sleep 0.1
done
echo '{"message_type":"summary","snapshot_id":"cafe"}'"#;

    async fn progress_events(executor: &BackupExecutor, events: &EventBus) -> Vec<BackupProgress> {
        let mut stream = events.subscribe();
        let result = completed(executor.execute_backup("s", false).await.expect("run"));
        assert_eq!(result.status, BackupStatus::Success);
        let mut progress = Vec::new();
        while let Some(event) = stream.next().await {
            match event {
                Event::BackupProgress { schedule_id, progress: p } => {
                    assert_eq!(schedule_id, "s");
                    progress.push(p);
                }
                Event::BackupCompleted { .. } => break,
                _ => {}
            }
        }
        progress
    }

    #[tokio::test]
    async fn progress_records_reach_the_event_bus() {
        let f = fixture(STATUS_LINES);
        let executor = f.executor.clone().with_progress_interval(Duration::ZERO);
        let progress = progress_events(&executor, &f.events).await;
        let files: Vec<u64> = progress.iter().map(|p| p.files_done).collect();
        assert_eq!(files, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn progress_events_are_throttled() {
        let f = fixture(STATUS_LINES);
        let executor = f.executor.clone().with_progress_interval(Duration::from_secs(30));
        let progress = progress_events(&executor, &f.events).await;
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].files_done, 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_stopped_runs_to_be_recorded() {
        let f = fixture("exec sleep 30");
        let row = f.db.schedule("s").unwrap();
        f.executor.spawn_backup(row, false);
        for _ in 0..100 {
            if f.calls().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(f.executor.is_running("s"));

        let started = Instant::now();
        f.executor.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!f.executor.is_running("s"));
        assert_eq!(f.db.schedule("s").unwrap().last_backup_status, Some(BackupStatus::Stopped));
    }

    #[tokio::test]
    async fn stop_interrupts_a_hanging_mount() {
        let f = fixture("exit 0");
        f.db.update_volume("v", |v| {
            v.config = VolumeConfig::Nfs(NfsConfig {
                server: "nas".to_string(),
                export_path: "/export".to_string(),
                port: 2049,
                version: "4.1".to_string(),
                read_only: true,
            })
        })
        .unwrap();
        f.host.runner.hang(Duration::from_secs(30));

        let executor = f.executor.clone();
        let run = tokio::spawn(async move { executor.execute_backup("s", true).await });
        for _ in 0..100 {
            if !f.host.runner.programs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(f.executor.stop_backup("s"));

        let started = Instant::now();
        let result = completed(run.await.unwrap().expect("run"));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, BackupStatus::Stopped);
        assert!(f.calls().is_empty());
    }
}
