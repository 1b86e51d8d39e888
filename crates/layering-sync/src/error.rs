//! Error types for cache maintenance.

use thiserror::Error;

/// Errors raised by a [`MessageSync`](crate::MessageSync) collaborator.
///
/// These never escape a scheduled job; the scheduler logs them and retries on
/// the next tick.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation ran before the collaborator was bound to a cache manager.
    #[error("message sync is not bound to a cache manager")]
    NotInitialized,

    /// The collaborator was bound twice.
    #[error("message sync is already bound to a cache manager")]
    AlreadyInitialized,

    /// The shared second-level store could not be reached.
    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// The pub/sub subscription is down.
    #[error("subscription disconnected: {0}")]
    Disconnected(String),

    /// A log entry could not be decoded.
    #[error("failed to decode invalidation message: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the failure is expected to clear up on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_) | SyncError::Disconnected(_)
        )
    }
}

/// Errors that abort scheduler setup.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid scheduler configuration.
    #[error("invalid maintenance configuration: {0}")]
    InvalidConfig(String),

    /// Binding the collaborator to the cache manager failed.
    #[error("failed to bind message sync: {0}")]
    Bind(#[source] SyncError),

    /// The startup offset sync failed, so no pull may run.
    #[error("initial offset sync failed: {0}")]
    InitialSync(#[source] SyncError),

    /// The worker pool could not be built.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] std::io::Error),
}
