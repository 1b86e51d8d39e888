//! First-level cache maintenance for layering caches.
//!
//! Each node keeps its local cache consistent with other nodes by pulling
//! invalidation messages from a shared log. This crate provides:
//! - A scheduler that runs the pull, daily offset reset, and reconnection
//!   jobs with fixed-delay timing and per-job fault isolation
//! - The [`MessageSync`] and [`CacheManager`] contracts those jobs drive
//! - An in-process shared log and log-backed [`MessageSync`]

mod clock;
mod config;
mod error;
mod isolation;
mod local_cache;
mod log_sync;
mod message;
mod message_log;
mod pool;
mod scheduler;
mod sync;
mod types;

pub use clock::{Clock, ManualClock, SystemClock, delay_until};
pub use config::{MaintenanceConfig, env, parse_time_of_day};
pub use error::{SchedulerError, SyncError};
pub use isolation::isolate;
pub use local_cache::LocalCacheManager;
pub use log_sync::LogMessageSync;
pub use message::InvalidationMessage;
pub use message_log::{LogEntry, MessageLog};
pub use pool::WorkerPool;
pub use scheduler::{MaintenanceHandle, MaintenanceScheduler, MaintenanceService};
pub use sync::{CacheManager, MessageSync};
pub use types::{JobKind, JobSchedule, JobState, JobStats, RunOutcome};
