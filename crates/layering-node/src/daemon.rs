//! Run command for a single cache node.
//!
//! The node wires together:
//! - An in-process `MessageLog` standing in for the shared store
//! - A `LocalCacheManager` holding the node's first-level caches
//! - A `LogMessageSync` kept current by the maintenance scheduler
//! - An optional simulated remote writer publishing invalidations

use std::sync::Arc;
use std::time::Duration;

use miette::{IntoDiagnostic, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use layering_sync::{
    InvalidationMessage, JobKind, LocalCacheManager, LogMessageSync, MaintenanceConfig,
    MaintenanceScheduler, MessageLog,
};

/// Cache the simulated writer invalidates.
const SAMPLE_CACHE: &str = "users";

/// Distinct keys the simulated writer cycles through.
const SAMPLE_KEYS: u64 = 16;

/// Every Nth simulated invalidation clears the whole cache.
const CLEAR_EVERY: u64 = 10;

/// How long the pool gets to wind down after the jobs stop.
const POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the run command.
pub struct DaemonConfig {
    pub schedule: MaintenanceConfig,
    /// Interval for the simulated remote writer, if enabled.
    pub publish_interval: Option<Duration>,
    /// Log entries kept after each simulated publish.
    pub retain: Option<u64>,
}

/// Run the node until Ctrl-C.
pub fn run(config: DaemonConfig) -> Result<()> {
    let log = MessageLog::new();
    let cache = LocalCacheManager::new();
    let sync = Arc::new(LogMessageSync::new(Arc::clone(&log)));

    info!(
        pull_period_secs = config.schedule.pull_period.as_secs(),
        reset_time = %config.schedule.reset_time,
        reconnect_period_secs = config.schedule.reconnect_period.as_secs(),
        workers = config.schedule.worker_threads,
        "starting cache node"
    );

    let service = MaintenanceScheduler::new(config.schedule, sync.clone())
        .into_diagnostic()?
        .start(cache.clone())
        .into_diagnostic()?;
    let pool = service.pool();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let writer = config.publish_interval.map(|interval| {
        pool.handle().spawn(simulated_writer(
            Arc::clone(&log),
            Arc::clone(&cache),
            interval,
            config.retain,
            shutdown_rx.clone(),
        ))
    });

    pool.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
        }
    });
    info!("received shutdown signal");
    let _ = shutdown_tx.send(true);

    if let Some(writer) = writer {
        pool.block_on(join_writer(writer));
    }

    for kind in JobKind::ALL {
        let stats = service.handle().stats(kind);
        info!(
            job = %kind,
            runs = stats.runs,
            failures = stats.failures,
            last_error = stats.last_error.as_deref().unwrap_or(""),
            "job summary"
        );
    }

    let offset = pool.block_on(sync.offset());
    service.shutdown(POOL_SHUTDOWN_TIMEOUT);

    info!(offset, cached = cache.len(SAMPLE_CACHE), "cache node stopped");
    Ok(())
}

/// Stand-in for another node writing through the shared store.
///
/// Each tick caches a value locally, as a read on this node would, and then
/// publishes its invalidation, so the entry disappears once a pull or the
/// subscription delivers the message.
async fn simulated_writer(
    log: Arc<MessageLog>,
    cache: Arc<LocalCacheManager>,
    interval: Duration,
    retain: Option<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "simulated writer started");
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        seq += 1;
        let message = if seq % CLEAR_EVERY == 0 {
            InvalidationMessage::clear(SAMPLE_CACHE)
        } else {
            let key = (seq % SAMPLE_KEYS).to_string();
            cache.put(SAMPLE_CACHE, key.clone(), format!("value-{seq}"));
            InvalidationMessage::evict(SAMPLE_CACHE, key)
        };

        match log.publish(&message).await {
            Ok(offset) => debug!(offset, seq, "published sample invalidation"),
            Err(e) => {
                warn!(error = %e, seq, "failed to publish sample invalidation");
                continue;
            }
        }

        if let Some(keep) = retain
            && let Ok(head) = log.head().await
        {
            let _ = log.truncate_before(head.saturating_sub(keep)).await;
        }
    }

    info!(published = seq, "simulated writer stopped");
}

/// Wait for the simulated writer to exit. Returns whether it stopped cleanly.
async fn join_writer(writer: JoinHandle<()>) -> bool {
    match writer.await {
        Ok(()) => true,
        Err(e) if e.is_panic() => {
            error!(error = %e, "simulated writer panicked");
            false
        }
        Err(e) => {
            warn!(error = %e, "simulated writer cancelled");
            false
        }
    }
}
