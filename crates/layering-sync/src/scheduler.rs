//! Maintenance scheduler implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::isolation::isolate;
use crate::pool::WorkerPool;
use crate::sync::{CacheManager, MessageSync};
use crate::types::{JobKind, JobSchedule, JobState, JobStats};
use crate::{MaintenanceConfig, SchedulerError, SyncError};

/// Owns the pull, reset, and reconnection jobs for one node.
///
/// Construct it with its collaborator and configuration, then call
/// [`init`](Self::init) once. `init` consumes the scheduler, so a second
/// initialization cannot happen.
pub struct MaintenanceScheduler {
    config: MaintenanceConfig,
    sync: Arc<dyn MessageSync>,
    clock: Arc<dyn Clock>,
    handle: Option<Handle>,
}

impl MaintenanceScheduler {
    /// Create a scheduler using the system clock and the caller's runtime.
    pub fn new(
        config: MaintenanceConfig,
        sync: Arc<dyn MessageSync>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            config,
            sync,
            clock: Arc::new(SystemClock),
            handle: None,
        })
    }

    /// Use `clock` to place the daily reset.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bind the collaborator, sync the offset, and start every job on the
    /// current runtime.
    ///
    /// The offset sync completes before any job is spawned, so the first pull
    /// always starts from a known position. A failure at either step aborts
    /// initialization and nothing is scheduled.
    ///
    /// The caller's runtime is not checked against `worker_threads`; use
    /// [`start`](Self::start) or [`init_blocking`](Self::init_blocking) for a
    /// pool of the configured size.
    #[tracing::instrument(skip_all)]
    pub async fn init(
        self,
        manager: Arc<dyn CacheManager>,
    ) -> Result<MaintenanceHandle, SchedulerError> {
        let Self {
            config,
            sync,
            clock,
            handle,
        } = self;

        sync.init(manager).await.map_err(SchedulerError::Bind)?;
        debug!("message sync bound to cache manager");

        sync.sync_offset()
            .await
            .map_err(SchedulerError::InitialSync)?;
        info!("message offset synchronized");

        let spawner = handle.unwrap_or_else(Handle::current);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let jobs = JobKind::ALL
            .iter()
            .map(|&kind| {
                let schedule = JobSchedule::for_job(kind, &config, clock.as_ref());
                let (stats_tx, stats_rx) = watch::channel(JobStats::default());

                info!(
                    job = %kind,
                    initial_delay_secs = schedule.initial_delay.as_secs(),
                    period_secs = schedule.period.as_secs(),
                    "scheduled maintenance job"
                );

                let task = spawner.spawn(run_job(
                    kind,
                    schedule,
                    Arc::clone(&sync),
                    shutdown_rx.clone(),
                    stats_tx,
                ));

                ScheduledJob {
                    kind,
                    schedule,
                    stats: stats_rx,
                    task: Some(task),
                }
            })
            .collect();

        Ok(MaintenanceHandle { shutdown_tx, jobs })
    }

    /// Initialize on `pool`, blocking the calling thread through the offset
    /// sync.
    ///
    /// For callers outside any async runtime. Fails with
    /// [`SchedulerError::InvalidConfig`] if the pool has fewer threads than
    /// `worker_threads`.
    pub fn init_blocking(
        self,
        pool: &WorkerPool,
        manager: Arc<dyn CacheManager>,
    ) -> Result<MaintenanceHandle, SchedulerError> {
        if pool.threads() < self.config.worker_threads {
            return Err(SchedulerError::InvalidConfig(format!(
                "worker pool has {} threads, configuration needs {}",
                pool.threads(),
                self.config.worker_threads
            )));
        }

        let scheduler = Self {
            handle: Some(pool.handle()),
            ..self
        };
        pool.block_on(scheduler.init(manager))
    }

    /// Build a worker pool of `worker_threads` and initialize on it.
    ///
    /// The returned service owns both the pool and the running jobs.
    pub fn start(
        self,
        manager: Arc<dyn CacheManager>,
    ) -> Result<MaintenanceService, SchedulerError> {
        let pool = WorkerPool::new(self.config.worker_threads)?;
        let handle = self.init_blocking(&pool, manager)?;
        Ok(MaintenanceService { pool, handle })
    }
}

/// Maintenance jobs together with the worker pool they run on.
pub struct MaintenanceService {
    pool: WorkerPool,
    handle: MaintenanceHandle,
}

impl MaintenanceService {
    pub fn handle(&self) -> &MaintenanceHandle {
        &self.handle
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Stop every job, then shut the pool down, giving other tasks on it up
    /// to `timeout` to finish.
    pub fn shutdown(self, timeout: Duration) {
        let Self { pool, handle } = self;
        pool.block_on(handle.shutdown());
        pool.shutdown(timeout);
    }
}

struct ScheduledJob {
    kind: JobKind,
    schedule: JobSchedule,
    stats: watch::Receiver<JobStats>,
    task: Option<JoinHandle<()>>,
}

/// Running maintenance jobs.
///
/// Dropping the handle signals every job to stop at its next wait.
#[must_use = "dropping the handle stops every maintenance job"]
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
    jobs: Vec<ScheduledJob>,
}

impl MaintenanceHandle {
    fn job(&self, kind: JobKind) -> &ScheduledJob {
        &self.jobs[kind.index()]
    }

    /// Latest counters for `kind`.
    pub fn stats(&self, kind: JobKind) -> JobStats {
        self.job(kind).stats.borrow().clone()
    }

    /// Watch counters for `kind` as they change.
    pub fn subscribe(&self, kind: JobKind) -> watch::Receiver<JobStats> {
        self.job(kind).stats.clone()
    }

    /// Schedule `kind` was started with.
    pub fn schedule(&self, kind: JobKind) -> JobSchedule {
        self.job(kind).schedule
    }

    /// Whether any job task is still alive.
    pub fn is_running(&self) -> bool {
        self.jobs
            .iter()
            .any(|j| j.task.as_ref().is_some_and(|t| !t.is_finished()))
    }

    /// Stop scheduling and wait for every job to exit.
    ///
    /// Executions already in progress run to completion first.
    pub async fn shutdown(mut self) {
        info!("stopping maintenance jobs");
        let _ = self.shutdown_tx.send(true);

        for job in &mut self.jobs {
            let Some(task) = job.task.take() else {
                continue;
            };
            if let Err(e) = task.await
                && e.is_panic()
            {
                error!(job = %job.kind, "maintenance job task panicked");
            }
        }

        info!("maintenance jobs stopped");
    }

    /// Cancel every job immediately, including executions in progress.
    pub fn abort(&self) {
        for job in &self.jobs {
            if let Some(task) = &job.task {
                task.abort();
            }
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Publishes [`JobState::Cancelled`] however the job loop ends, including
/// an aborted task or a pool shutdown dropping it mid-wait.
struct StatsPublisher(watch::Sender<JobStats>);

impl Drop for StatsPublisher {
    fn drop(&mut self) {
        self.0.send_modify(|s| s.state = JobState::Cancelled);
    }
}

/// Fixed-delay loop for one job.
///
/// The wait is the only cooperative cancellation point, so one job never has
/// two executions in flight.
async fn run_job(
    kind: JobKind,
    schedule: JobSchedule,
    sync: Arc<dyn MessageSync>,
    mut shutdown: watch::Receiver<bool>,
    stats: watch::Sender<JobStats>,
) {
    let publisher = StatsPublisher(stats);
    let stats = &publisher.0;
    let mut delay = schedule.initial_delay;

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }

            _ = sleep(delay) => {}
        }

        let consecutive_failures = stats.borrow().consecutive_failures;
        stats.send_modify(|s| {
            s.state = JobState::Running;
            s.runs += 1;
        });
        debug!(job = %kind, "running maintenance job");

        let outcome = isolate(kind, consecutive_failures, execute(kind, sync.as_ref())).await;
        if outcome.is_success() {
            debug!(job = %kind, "maintenance job completed");
        }

        stats.send_modify(|s| {
            s.record(&outcome);
            s.state = JobState::Scheduled;
        });
        delay = schedule.period;
    }

    debug!(job = %kind, "maintenance job cancelled");
}

async fn execute(kind: JobKind, sync: &dyn MessageSync) -> Result<(), SyncError> {
    match kind {
        JobKind::Pull => {
            let applied = sync.pull_message().await?;
            if applied > 0 {
                debug!(applied, "pulled invalidation messages");
            }
            Ok(())
        }
        JobKind::Reset => sync.reset_offset().await,
        JobKind::Reconnect => sync.reconnection().await,
    }
}
