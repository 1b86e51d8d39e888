//! Contracts between the maintenance scheduler and the cache it maintains.

use std::sync::Arc;

use async_trait::async_trait;

use crate::SyncError;

/// Hooks through which invalidations reach the first-level cache.
pub trait CacheManager: Send + Sync {
    /// Drop a single key from a named local cache.
    fn evict(&self, cache_name: &str, key: &str);

    /// Drop every entry of a named local cache.
    fn clear(&self, cache_name: &str);
}

/// Offset storage, message retrieval, and pub/sub connection for one node.
///
/// The scheduler calls these from different jobs that may run at the same
/// time on different worker threads, so implementations must be internally
/// synchronized.
#[async_trait]
pub trait MessageSync: Send + Sync {
    /// Bind to the cache manager that receives invalidations.
    ///
    /// Called exactly once, before any other operation.
    async fn init(&self, manager: Arc<dyn CacheManager>) -> Result<(), SyncError>;

    /// Move the local offset to the current head of the shared log.
    ///
    /// Must be safe to call before anything has been pulled.
    async fn sync_offset(&self) -> Result<(), SyncError>;

    /// Apply every message after the local offset, in log order.
    ///
    /// The offset advances only past messages that were applied, with one
    /// exception: an entry that cannot be decoded is logged and skipped, so a
    /// single poison entry cannot stall every later invalidation. Returns the
    /// number of messages applied; a call with nothing new returns zero.
    async fn pull_message(&self) -> Result<usize, SyncError>;

    /// Prune offset tracking state that is already confirmed applied.
    async fn reset_offset(&self) -> Result<(), SyncError>;

    /// Restore the subscription channel if it is down. Cheap when healthy.
    async fn reconnection(&self) -> Result<(), SyncError>;
}
