//! Interval scheduler that runs every job under the distributed lock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lock::{AtomicStore, DistributedLock, LockOutcome};
use crate::sync::lock;

/// A periodic job. Its `name` is the lock key, so every process registering
/// the same job must use the same name.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<J> ScheduledJob for Arc<J>
where
    J: ScheduledJob + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn run(&self) -> anyhow::Result<()> {
        (**self).run().await
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Runs that held the lock (succeeded + failed).
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Ticks where another process held the lock.
    pub skipped: u64,
    /// Ticks where the lock store was unreachable.
    pub lock_errors: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

struct Registration {
    job: Arc<dyn ScheduledJob>,
    interval: Duration,
    ttl: Duration,
}

/// Runs registered jobs on fixed intervals, each tick gated by
/// [`DistributedLock::with_lock`] so only one process in the cluster runs it.
pub struct JobScheduler<A> {
    lock: DistributedLock<A>,
    jobs: Vec<Registration>,
}

impl<A> std::fmt::Debug for JobScheduler<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.jobs.iter().map(|r| r.job.name()).collect();
        f.debug_struct("JobScheduler").field("jobs", &names).finish_non_exhaustive()
    }
}

impl<A: AtomicStore + 'static> JobScheduler<A> {
    pub fn new(lock: DistributedLock<A>) -> Self {
        Self {
            lock,
            jobs: Vec::new(),
        }
    }

    /// Register `job` to run every `interval`, locked for the default TTL.
    pub fn register(self, job: impl ScheduledJob + 'static, interval: Duration) -> Self {
        let ttl = self.lock.config().default_ttl;
        self.register_with_ttl(job, interval, ttl)
    }

    /// The TTL should exceed the job's worst-case run time; a run that
    /// outlives it may overlap with another process. A zero interval is
    /// treated as 1ms.
    pub fn register_with_ttl(
        mut self,
        job: impl ScheduledJob + 'static,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        self.jobs.push(Registration {
            job: Arc::new(job),
            interval: interval.max(Duration::from_millis(1)),
            ttl,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Spawn one task per job on the current runtime. The first run of each
    /// job happens immediately.
    pub fn spawn(self, parent: &CancellationToken) -> SchedulerHandle {
        let token = parent.child_token();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));

        let joins = self
            .jobs
            .into_iter()
            .map(|registration| {
                tokio::spawn(job_loop(
                    self.lock.clone(),
                    registration,
                    token.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        SchedulerHandle { token, joins, stats }
    }
}

/// Handle to control and join the scheduler's tasks.
///
/// Dropping the handle cancels the tasks without waiting for them.
#[derive(Debug)]
pub struct SchedulerHandle {
    token: CancellationToken,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request shutdown and wait for in-flight runs to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for join in self.joins.drain(..) {
            if let Err(err) = join.await {
                error!(error = %err, "scheduled job task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        lock(&self.stats).clone()
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn job_loop<A: AtomicStore + 'static>(
    lock_service: DistributedLock<A>,
    registration: Registration,
    token: CancellationToken,
    stats: Arc<Mutex<SchedulerStats>>,
) {
    let Registration { job, interval, ttl } = registration;
    let name = job.name().to_string();
    info!(job = %name, interval_secs = interval.as_secs(), "scheduled job started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A run in progress is allowed to finish before shutdown is observed.
        let outcome = lock_service.with_lock(&name, ttl, || job.run()).await;

        let mut s = lock(&stats);
        match outcome {
            Ok(LockOutcome::Ran(Ok(()))) => {
                s.runs += 1;
                s.succeeded += 1;
                s.last_run_at = Some(Utc::now());
                debug!(job = %name, "scheduled run succeeded");
            }
            Ok(LockOutcome::Ran(Err(err))) => {
                s.runs += 1;
                s.failed += 1;
                s.last_run_at = Some(Utc::now());
                warn!(job = %name, error = %err, "scheduled run failed");
            }
            Ok(LockOutcome::Skipped) => s.skipped += 1,
            Err(err) => {
                s.lock_errors += 1;
                error!(job = %name, error = %err, "could not acquire job lock");
            }
        }
    }

    info!(job = %name, "scheduled job stopped");
}
