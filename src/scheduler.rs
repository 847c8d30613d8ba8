use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cron::CronExpression;
use crate::error::{ConfigError, Result};

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Job {
    id: String,
    cron: CronExpression,
    run: JobFn,
    next: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
}

/// Clears a job's running flag even if its task panics.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Table of cron jobs checked on every tick. Due jobs run as detached
/// tasks; a job whose previous invocation is still running is skipped.
pub struct Scheduler {
    jobs: Vec<Job>,
    tick: Duration,
}

pub struct JobBuilder<'a> {
    scheduler: &'a mut Scheduler,
    id: String,
    run: JobFn,
}

impl<'a> JobBuilder<'a> {
    pub fn schedule(self, cron: &str) -> Result<()> {
        let cron = CronExpression::parse(cron)
            .map_err(|e| ConfigError::Invalid(format!("job {}: {}", self.id, e)))?;
        debug!(job = %self.id, cron = %cron, "job registered");
        self.scheduler.jobs.push(Job {
            id: self.id,
            cron,
            run: self.run,
            next: None,
            running: Arc::new(AtomicBool::new(false)),
        });
        Ok(())
    }
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            tick,
        }
    }

    pub fn job<F, Fut>(&mut self, id: &str, run: F) -> JobBuilder<'_>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        JobBuilder {
            scheduler: self,
            id: id.to_string(),
            run: Arc::new(move || run().boxed()),
        }
    }

    pub fn job_ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.id.as_str()).collect()
    }

    /// Plans the first run of every job strictly after `now`.
    pub fn start(&mut self, now: DateTime<Utc>) {
        for job in &mut self.jobs {
            job.next = job.cron.next_after(now);
            debug!(job = %job.id, next = ?job.next, "job planned");
        }
    }

    /// Spawns every job due at `now` and returns how many were started.
    pub fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let mut started = 0;
        for job in &mut self.jobs {
            let due = matches!(job.next, Some(next) if next <= now);
            if !due {
                continue;
            }
            job.next = job.cron.next_after(now);
            if job.running.swap(true, Ordering::SeqCst) {
                debug!(job = %job.id, "previous run still active; skipping");
                continue;
            }
            let flag = RunningFlag(job.running.clone());
            let run = job.run.clone();
            let id = job.id.clone();
            tokio::spawn(async move {
                let _flag = flag;
                if let Err(err) = run().await {
                    warn!(job = %id, error = %err, "job failed");
                }
            });
            started += 1;
        }
        started
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        self.start(Utc::now());
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(jobs = self.jobs.len(), "scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
            }
        }
        info!("scheduler stopped");
    }
}
