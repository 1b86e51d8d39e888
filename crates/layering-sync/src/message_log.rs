//! Shared append-only invalidation log.
//!
//! Stands in for the second-level store every node writes invalidations to.
//! Entries are addressed by a monotonically increasing offset; old entries
//! can be dropped by retention, which moves the log's base forward. New
//! entries are also fanned out to live subscribers, mirroring the store's
//! pub/sub channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use crate::SyncError;
use crate::message::InvalidationMessage;

/// Buffered entries per subscriber before it starts lagging.
pub const SUBSCRIBER_CAPACITY: usize = 1024;

/// One encoded message and its position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub offset: u64,
    pub payload: String,
}

struct LogInner {
    /// Offset of `entries[0]`.
    base: u64,
    entries: VecDeque<String>,
    publisher: broadcast::Sender<LogEntry>,
}

impl LogInner {
    fn head(&self) -> u64 {
        self.base + self.entries.len() as u64
    }
}

/// The shared invalidation log.
pub struct MessageLog {
    inner: RwLock<LogInner>,
    available: AtomicBool,
}

impl MessageLog {
    /// Create an empty log.
    pub fn new() -> Arc<Self> {
        let (publisher, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Arc::new(Self {
            inner: RwLock::new(LogInner {
                base: 0,
                entries: VecDeque::new(),
                publisher,
            }),
            available: AtomicBool::new(true),
        })
    }

    /// Simulate the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(available, "message log availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), SyncError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(SyncError::StoreUnavailable(
                "message log is not reachable".to_string(),
            ))
        }
    }

    /// Append an invalidation and notify subscribers. Returns its offset.
    pub async fn publish(&self, message: &InvalidationMessage) -> Result<u64, SyncError> {
        let payload = serde_json::to_string(message)?;
        self.publish_raw(payload).await
    }

    /// Append an already encoded payload.
    pub async fn publish_raw(&self, payload: String) -> Result<u64, SyncError> {
        self.ensure_available()?;

        let mut inner = self.inner.write().await;
        let offset = inner.head();
        inner.entries.push_back(payload.clone());

        // No subscribers is fine; pulls still see the entry.
        let _ = inner.publisher.send(LogEntry { offset, payload });

        debug!(offset, "published invalidation message");
        Ok(offset)
    }

    /// Offset the next published entry will get.
    pub async fn head(&self) -> Result<u64, SyncError> {
        self.ensure_available()?;
        Ok(self.inner.read().await.head())
    }

    /// Oldest offset still retained.
    pub async fn base(&self) -> Result<u64, SyncError> {
        self.ensure_available()?;
        Ok(self.inner.read().await.base)
    }

    /// Every retained entry at or after `offset`, in log order.
    ///
    /// If retention already dropped part of the requested range, the result
    /// starts at the log base.
    pub async fn read_from(&self, offset: u64) -> Result<Vec<LogEntry>, SyncError> {
        self.ensure_available()?;

        let inner = self.inner.read().await;
        let start = offset.max(inner.base);
        let skip = (start - inner.base) as usize;

        Ok(inner
            .entries
            .iter()
            .skip(skip)
            .enumerate()
            .map(|(i, payload)| LogEntry {
                offset: start + i as u64,
                payload: payload.clone(),
            })
            .collect())
    }

    /// Drop every entry before `offset`. Returns how many were dropped.
    pub async fn truncate_before(&self, offset: u64) -> Result<usize, SyncError> {
        self.ensure_available()?;

        let mut inner = self.inner.write().await;
        let target = offset.min(inner.head());
        let mut dropped = 0;
        while inner.base < target {
            inner.entries.pop_front();
            inner.base += 1;
            dropped += 1;
        }

        if dropped > 0 {
            info!(dropped, base = inner.base, "truncated message log");
        }
        Ok(dropped)
    }

    /// Subscribe to entries published from now on.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<LogEntry>, SyncError> {
        self.ensure_available()?;
        Ok(self.inner.read().await.publisher.subscribe())
    }

    /// Close every live subscription, as a dropped pub/sub connection would.
    pub async fn drop_subscribers(&self) {
        let mut inner = self.inner.write().await;
        let (publisher, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let old = std::mem::replace(&mut inner.publisher, publisher);
        info!(
            subscribers = old.receiver_count(),
            "dropped message log subscribers"
        );
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.read().await.publisher.receiver_count()
    }
}
