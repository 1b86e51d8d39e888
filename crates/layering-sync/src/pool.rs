//! Dedicated worker pool for maintenance jobs.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::info;

use crate::SchedulerError;

/// Thread name prefix for pool workers.
pub const WORKER_THREAD_NAME: &str = "layering-cache-pull-message";

/// A fixed-size multi-threaded runtime owned by one scheduler instance.
///
/// Shutting the pool down is the executor shutdown that cancels every pending
/// job execution.
pub struct WorkerPool {
    runtime: Runtime,
    threads: usize,
}

impl WorkerPool {
    /// Build a pool with `threads` workers.
    pub fn new(threads: usize) -> Result<Self, SchedulerError> {
        if threads == 0 {
            return Err(SchedulerError::InvalidConfig(
                "worker pool needs at least one thread".to_string(),
            ));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()?;

        info!(threads, "maintenance worker pool started");
        Ok(Self { runtime, threads })
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Handle for spawning onto the pool.
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Run `future` to completion on the pool, blocking the calling thread.
    ///
    /// Must not be called from inside an async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Stop the pool, waiting up to `timeout` for running work to yield.
    pub fn shutdown(self, timeout: Duration) {
        info!(threads = self.threads, "maintenance worker pool shutting down");
        self.runtime.shutdown_timeout(timeout);
    }
}
