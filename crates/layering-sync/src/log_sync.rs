//! Message sync backed by a [`MessageLog`].
//!
//! Each node keeps a cursor into the shared log. Messages arrive two ways:
//! pushed through the log's subscription while connected, and pulled on a
//! timer from the cursor onward. Pushed messages that land ahead of the
//! cursor are remembered in a dedup window so the next pull skips them.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::SyncError;
use crate::message::InvalidationMessage;
use crate::message_log::{LogEntry, MessageLog};
use crate::sync::{CacheManager, MessageSync};

/// Position in the shared log plus the dedup window ahead of it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Cursor {
    /// Offset just past the last applied message.
    offset: u64,
    /// Offsets at or beyond `offset` already applied from the subscription.
    pushed: BTreeSet<u64>,
}

impl Cursor {
    /// Record a pushed entry. Returns whether it still needs applying.
    fn accept_pushed(&mut self, offset: u64) -> bool {
        if offset < self.offset || !self.pushed.insert(offset) {
            return false;
        }
        self.advance_over_pushed();
        true
    }

    /// Record a pulled entry. Returns whether it still needs applying.
    fn accept_pulled(&mut self, offset: u64) -> bool {
        let fresh = !self.pushed.remove(&offset);
        self.offset = self.offset.max(offset + 1);
        fresh
    }

    fn advance_over_pushed(&mut self) {
        while self.pushed.remove(&self.offset) {
            self.offset += 1;
        }
    }

    /// Drop dedup entries the cursor has already passed.
    fn prune(&mut self) -> usize {
        let before = self.pushed.len();
        self.pushed = self.pushed.split_off(&self.offset);
        before - self.pushed.len()
    }
}

struct Shared {
    log: Arc<MessageLog>,
    manager: OnceLock<Arc<dyn CacheManager>>,
    cursor: Mutex<Cursor>,
    connected: AtomicBool,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn manager(&self) -> Result<Arc<dyn CacheManager>, SyncError> {
        self.manager.get().cloned().ok_or(SyncError::NotInitialized)
    }

    fn listener_alive(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn apply_pushed(&self, entry: LogEntry) {
        let Ok(manager) = self.manager() else {
            return;
        };

        let message: InvalidationMessage = match serde_json::from_str(&entry.payload) {
            Ok(message) => message,
            Err(e) => {
                // Left for the pull to skip past.
                warn!(offset = entry.offset, error = %e, "ignoring undecodable pushed message");
                return;
            }
        };

        let mut cursor = self.cursor.lock().await;
        if cursor.accept_pushed(entry.offset) {
            message.apply(manager.as_ref());
            trace!(offset = entry.offset, cache = message.cache_name(), "applied pushed message");
        }
    }
}

/// Node-local [`MessageSync`] over a shared [`MessageLog`].
pub struct LogMessageSync {
    shared: Arc<Shared>,
}

impl LogMessageSync {
    pub fn new(log: Arc<MessageLog>) -> Self {
        Self {
            shared: Arc::new(Shared {
                log,
                manager: OnceLock::new(),
                cursor: Mutex::new(Cursor::default()),
                connected: AtomicBool::new(false),
                listener: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Offset just past the last applied message.
    pub async fn offset(&self) -> u64 {
        self.shared.cursor.lock().await.offset
    }

    /// Pushed messages waiting for the cursor to catch up.
    pub async fn dedup_window(&self) -> usize {
        self.shared.cursor.lock().await.pushed.len()
    }

    /// Whether the subscription listener is running.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst) && self.shared.listener_alive()
    }

    async fn subscribe(&self) -> Result<(), SyncError> {
        let rx = self.shared.log.subscribe().await.map_err(|e| {
            SyncError::Disconnected(format!("could not subscribe to message log: {e}"))
        })?;

        let task = tokio::spawn(listen(Arc::clone(&self.shared), rx));
        let previous = self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for LogMessageSync {
    fn drop(&mut self) {
        if let Some(task) = self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn listen(shared: Arc<Shared>, mut rx: broadcast::Receiver<LogEntry>) {
    debug!("message subscription listener started");

    loop {
        match rx.recv().await {
            Ok(entry) => shared.apply_pushed(entry).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "message subscription lagged, next pull will catch up");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    warn!("message subscription lost");
}

#[async_trait]
impl MessageSync for LogMessageSync {
    async fn init(&self, manager: Arc<dyn CacheManager>) -> Result<(), SyncError> {
        self.shared
            .manager
            .set(manager)
            .map_err(|_| SyncError::AlreadyInitialized)
    }

    async fn sync_offset(&self) -> Result<(), SyncError> {
        let mut cursor = self.shared.cursor.lock().await;
        let head = self.shared.log.head().await?;

        let previous = cursor.offset;
        cursor.offset = cursor.offset.max(head);
        cursor.advance_over_pushed();
        cursor.prune();

        info!(previous, offset = cursor.offset, "synced local message offset to log head");
        Ok(())
    }

    async fn pull_message(&self) -> Result<usize, SyncError> {
        let manager = self.shared.manager()?;
        let mut cursor = self.shared.cursor.lock().await;
        let base = self.shared.log.base().await?;

        if cursor.offset < base {
            warn!(
                offset = cursor.offset,
                base,
                lost = base - cursor.offset,
                "message log retention passed local offset, some invalidations were missed"
            );
            cursor.offset = base;
            cursor.advance_over_pushed();
        }

        let entries = self.shared.log.read_from(cursor.offset).await?;

        let mut applied = 0;
        for entry in entries {
            let message = match serde_json::from_str::<InvalidationMessage>(&entry.payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(offset = entry.offset, error = %e, "skipping undecodable message");
                    None
                }
            };

            if cursor.accept_pulled(entry.offset)
                && let Some(message) = message
            {
                message.apply(manager.as_ref());
                applied += 1;
            }
        }

        if applied > 0 {
            debug!(applied, offset = cursor.offset, "pulled invalidation messages");
        }
        Ok(applied)
    }

    async fn reset_offset(&self) -> Result<(), SyncError> {
        let mut cursor = self.shared.cursor.lock().await;
        let base = self.shared.log.base().await?;

        if cursor.offset < base {
            warn!(
                offset = cursor.offset,
                base,
                "local message offset is behind log retention, re-baselining"
            );
            cursor.offset = base;
            cursor.advance_over_pushed();
        }

        let pruned = cursor.prune();
        info!(offset = cursor.offset, pruned, "reset local message offset state");
        Ok(())
    }

    async fn reconnection(&self) -> Result<(), SyncError> {
        if self.is_connected() {
            trace!("message subscription healthy");
            return Ok(());
        }

        self.shared.manager()?;
        self.subscribe().await?;
        info!("message subscription restored");

        // Anything published while disconnected only reaches us by pulling.
        let applied = self.pull_message().await?;
        if applied > 0 {
            info!(applied, "caught up after reconnecting");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_cache::LocalCacheManager;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cursor_push_in_order_advances() {
        let mut cursor = Cursor::default();
        assert!(cursor.accept_pushed(0));
        assert!(cursor.accept_pushed(1));
        assert_eq!(cursor.offset, 2);
        assert!(cursor.pushed.is_empty());
    }

    #[test]
    fn test_cursor_push_ahead_is_remembered() {
        let mut cursor = Cursor::default();
        assert!(cursor.accept_pushed(2));
        assert_eq!(cursor.offset, 0);
        assert_eq!(cursor.pushed, BTreeSet::from([2]));

        assert!(!cursor.accept_pushed(2), "duplicate push");

        assert!(cursor.accept_pulled(0));
        assert!(cursor.accept_pulled(1));
        assert!(!cursor.accept_pulled(2), "already pushed");
        assert_eq!(cursor.offset, 3);
        assert!(cursor.pushed.is_empty());
    }

    #[test]
    fn test_cursor_ignores_stale_push() {
        let mut cursor = Cursor {
            offset: 5,
            pushed: BTreeSet::new(),
        };
        assert!(!cursor.accept_pushed(3));
        assert_eq!(cursor.offset, 5);
    }

    #[test]
    fn test_cursor_prune_keeps_window_ahead() {
        let mut cursor = Cursor {
            offset: 4,
            pushed: BTreeSet::from([1, 2, 6, 9]),
        };
        assert_eq!(cursor.prune(), 2);
        assert_eq!(cursor.pushed, BTreeSet::from([6, 9]));
    }

    async fn bound(log: &Arc<MessageLog>) -> (LogMessageSync, Arc<LocalCacheManager>) {
        let sync = LogMessageSync::new(Arc::clone(log));
        let cache = LocalCacheManager::new();
        sync.init(cache.clone()).await.unwrap();
        (sync, cache)
    }

    #[tokio::test]
    async fn test_operations_require_binding() {
        let sync = LogMessageSync::new(MessageLog::new());
        assert!(matches!(
            sync.pull_message().await,
            Err(SyncError::NotInitialized)
        ));
        assert!(matches!(
            sync.reconnection().await,
            Err(SyncError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_double_init_rejected() {
        let log = MessageLog::new();
        let (sync, cache) = bound(&log).await;
        assert!(matches!(
            sync.init(cache).await,
            Err(SyncError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_sync_offset_skips_history() {
        let log = MessageLog::new();
        log.publish(&InvalidationMessage::evict("users", "1"))
            .await
            .unwrap();
        log.publish(&InvalidationMessage::evict("users", "2"))
            .await
            .unwrap();

        let (sync, cache) = bound(&log).await;
        cache.put("users", "1", "alice");

        sync.sync_offset().await.unwrap();
        assert_eq!(sync.offset().await, 2);

        assert_eq!(sync.pull_message().await.unwrap(), 0);
        assert_eq!(cache.get("users", "1").as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_pull_applies_in_order_and_is_idempotent() {
        let log = MessageLog::new();
        let (sync, cache) = bound(&log).await;
        sync.sync_offset().await.unwrap();

        cache.put("users", "1", "alice");
        cache.put("users", "2", "bob");
        cache.put("orders", "9", "pending");

        log.publish(&InvalidationMessage::evict("users", "1"))
            .await
            .unwrap();
        log.publish(&InvalidationMessage::clear("orders"))
            .await
            .unwrap();

        assert_eq!(sync.pull_message().await.unwrap(), 2);
        assert_eq!(sync.offset().await, 2);
        assert_eq!(cache.get("users", "1"), None);
        assert_eq!(cache.get("users", "2").as_deref(), Some("bob"));
        assert_eq!(cache.len("orders"), 0);

        assert_eq!(sync.pull_message().await.unwrap(), 0);
        assert_eq!(sync.offset().await, 2);
    }

    #[tokio::test]
    async fn test_pull_failure_keeps_offset() {
        let log = MessageLog::new();
        let (sync, _cache) = bound(&log).await;
        sync.sync_offset().await.unwrap();
        log.publish(&InvalidationMessage::clear("c")).await.unwrap();

        log.set_available(false);
        assert!(matches!(
            sync.pull_message().await,
            Err(SyncError::StoreUnavailable(_))
        ));
        assert_eq!(sync.offset().await, 0);

        log.set_available(true);
        assert_eq!(sync.pull_message().await.unwrap(), 1);
        assert_eq!(sync.offset().await, 1);
    }

    #[tokio::test]
    async fn test_pull_skips_undecodable_entries() {
        let log = MessageLog::new();
        let (sync, cache) = bound(&log).await;
        sync.sync_offset().await.unwrap();
        cache.put("users", "1", "alice");

        log.publish_raw("not json".to_string()).await.unwrap();
        log.publish(&InvalidationMessage::evict("users", "1"))
            .await
            .unwrap();

        assert_eq!(sync.pull_message().await.unwrap(), 1);
        assert_eq!(sync.offset().await, 2);
        assert_eq!(cache.get("users", "1"), None);
    }

    #[tokio::test]
    async fn test_pull_after_truncation_jumps_to_base() {
        let log = MessageLog::new();
        let (sync, _cache) = bound(&log).await;
        sync.sync_offset().await.unwrap();

        for i in 0..4 {
            log.publish(&InvalidationMessage::evict("c", i.to_string()))
                .await
                .unwrap();
        }
        log.truncate_before(3).await.unwrap();

        assert_eq!(sync.pull_message().await.unwrap(), 1);
        assert_eq!(sync.offset().await, 4);
    }

    #[tokio::test]
    async fn test_reset_rebaselines_without_regressing() {
        let log = MessageLog::new();
        let (sync, _cache) = bound(&log).await;
        sync.sync_offset().await.unwrap();

        for i in 0..6 {
            log.publish(&InvalidationMessage::evict("c", i.to_string()))
                .await
                .unwrap();
        }
        assert_eq!(sync.pull_message().await.unwrap(), 6);

        log.truncate_before(2).await.unwrap();
        sync.reset_offset().await.unwrap();
        assert_eq!(sync.offset().await, 6);

        log.truncate_before(6).await.unwrap();
        sync.reset_offset().await.unwrap();
        assert_eq!(sync.offset().await, 6);
        assert_eq!(sync.pull_message().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_prunes_dedup_window() {
        let log = MessageLog::new();
        let (sync, _cache) = bound(&log).await;
        sync.sync_offset().await.unwrap();

        // Offset 0 is still unpulled when offset 1 arrives by push.
        log.publish(&InvalidationMessage::evict("c", "0")).await.unwrap();
        sync.subscribe().await.unwrap();
        log.publish(&InvalidationMessage::evict("c", "1")).await.unwrap();
        for _ in 0..100 {
            if sync.dedup_window().await == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sync.dedup_window().await, 1);
        assert_eq!(sync.offset().await, 0);

        // Retention passes both entries; the reset re-baselines and prunes.
        log.truncate_before(2).await.unwrap();
        sync.reset_offset().await.unwrap();
        assert_eq!(sync.offset().await, 2);
        assert_eq!(sync.dedup_window().await, 0);
    }

    #[tokio::test]
    async fn test_reconnection_subscribes_and_catches_up() {
        let log = MessageLog::new();
        let (sync, cache) = bound(&log).await;
        sync.sync_offset().await.unwrap();
        cache.put("users", "1", "alice");
        cache.put("users", "2", "bob");

        // Published while no subscription exists.
        log.publish(&InvalidationMessage::evict("users", "1"))
            .await
            .unwrap();

        assert!(!sync.is_connected());
        sync.reconnection().await.unwrap();
        assert!(sync.is_connected());
        assert_eq!(log.subscriber_count().await, 1);
        assert_eq!(cache.get("users", "1"), None);

        // Healthy subscription: no second subscriber.
        sync.reconnection().await.unwrap();
        assert_eq!(log.subscriber_count().await, 1);

        log.publish(&InvalidationMessage::evict("users", "2"))
            .await
            .unwrap();
        for _ in 0..100 {
            if cache.get("users", "2").is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.get("users", "2"), None);
        assert_eq!(sync.offset().await, 2);

        // The pushed message is not applied a second time by pull.
        assert_eq!(sync.pull_message().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lost_subscription_is_restored() {
        let log = MessageLog::new();
        let (sync, _cache) = bound(&log).await;
        sync.sync_offset().await.unwrap();
        sync.reconnection().await.unwrap();

        log.drop_subscribers().await;
        for _ in 0..100 {
            if !sync.is_connected() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!sync.is_connected());

        sync.reconnection().await.unwrap();
        assert!(sync.is_connected());
        assert_eq!(log.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_reconnection_fails_while_store_down() {
        let log = MessageLog::new();
        let (sync, _cache) = bound(&log).await;
        log.set_available(false);

        assert!(matches!(
            sync.reconnection().await,
            Err(SyncError::Disconnected(_))
        ));
        assert!(!sync.is_connected());
    }
}
