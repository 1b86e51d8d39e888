//! Property tests for the log-backed message sync.
//!
//! Random interleavings of publishes, pulls, resets, retention, lost
//! subscriptions, and store outages. Two properties are checked:
//!
//! - The local offset never moves backward
//! - Once the store is reachable again, every message still retained in the
//!   log has been applied to the local cache

use std::sync::Arc;

use proptest::prelude::*;
use tokio::runtime::Runtime;

use layering_sync::{InvalidationMessage, LocalCacheManager, LogMessageSync, MessageLog, MessageSync};

const CACHE: &str = "items";

#[derive(Debug, Clone)]
enum Operation {
    Publish,
    Pull,
    Reset,
    /// Keep only the newest `keep` entries.
    Truncate { keep: u64 },
    DropSubscribers,
    Reconnect,
    StoreDown,
    StoreUp,
    Yield,
}

fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => Just(Operation::Publish),
        3 => Just(Operation::Pull),
        1 => Just(Operation::Reset),
        1 => (0u64..4).prop_map(|keep| Operation::Truncate { keep }),
        1 => Just(Operation::DropSubscribers),
        2 => Just(Operation::Reconnect),
        1 => Just(Operation::StoreDown),
        1 => Just(Operation::StoreUp),
        2 => Just(Operation::Yield),
    ]
}

struct Run {
    offsets: Vec<u64>,
    /// (log offset, key) of every successful publish.
    published: Vec<(u64, String)>,
    base: u64,
    head: u64,
    final_offset: u64,
    cache: Arc<LocalCacheManager>,
}

async fn execute(operations: Vec<Operation>) -> Run {
    let log = MessageLog::new();
    let cache = LocalCacheManager::new();
    let sync = LogMessageSync::new(Arc::clone(&log));
    sync.init(cache.clone()).await.unwrap();
    sync.sync_offset().await.unwrap();

    let mut offsets = vec![sync.offset().await];
    let mut published = Vec::new();

    for (i, operation) in operations.into_iter().enumerate() {
        match operation {
            Operation::Publish => {
                let key = format!("k{i}");
                cache.put(CACHE, key.clone(), "v");
                if let Ok(offset) = log.publish(&InvalidationMessage::evict(CACHE, key.clone())).await
                {
                    published.push((offset, key));
                }
            }
            Operation::Pull => {
                let _ = sync.pull_message().await;
            }
            Operation::Reset => {
                let _ = sync.reset_offset().await;
            }
            Operation::Truncate { keep } => {
                if let Ok(head) = log.head().await {
                    let _ = log.truncate_before(head.saturating_sub(keep)).await;
                }
            }
            Operation::DropSubscribers => log.drop_subscribers().await,
            Operation::Reconnect => {
                let _ = sync.reconnection().await;
            }
            Operation::StoreDown => log.set_available(false),
            Operation::StoreUp => log.set_available(true),
            Operation::Yield => tokio::task::yield_now().await,
        }
        offsets.push(sync.offset().await);
    }

    log.set_available(true);
    sync.pull_message().await.unwrap();
    offsets.push(sync.offset().await);

    Run {
        offsets,
        published,
        base: log.base().await.unwrap(),
        head: log.head().await.unwrap(),
        final_offset: sync.offset().await,
        cache,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn offset_never_regresses(operations in prop::collection::vec(operation_strategy(), 1..60)) {
        let runtime = Runtime::new().unwrap();
        let run = runtime.block_on(execute(operations));

        for pair in run.offsets.windows(2) {
            prop_assert!(pair[0] <= pair[1], "offset moved backward: {:?}", run.offsets);
        }
        prop_assert_eq!(run.final_offset, run.head);
    }

    #[test]
    fn retained_messages_are_applied(operations in prop::collection::vec(operation_strategy(), 1..60)) {
        let runtime = Runtime::new().unwrap();
        let run = runtime.block_on(execute(operations));

        for (offset, key) in run.published.iter().filter(|(offset, _)| *offset >= run.base) {
            prop_assert_eq!(
                run.cache.get(CACHE, key),
                None,
                "message at offset {} was never applied",
                offset
            );
        }
    }
}
