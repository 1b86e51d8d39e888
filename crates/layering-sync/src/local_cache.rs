//! Process-local first-level caches.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::sync::CacheManager;

/// Named in-memory caches that receive invalidations.
#[derive(Debug, Default)]
pub struct LocalCacheManager {
    caches: DashMap<String, DashMap<String, String>>,
}

impl LocalCacheManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, cache_name: &str, key: impl Into<String>, value: impl Into<String>) {
        self.caches
            .entry(cache_name.to_string())
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn get(&self, cache_name: &str, key: &str) -> Option<String> {
        self.caches
            .get(cache_name)
            .and_then(|cache| cache.get(key).map(|v| v.value().clone()))
    }

    /// Entries in one cache; zero if it does not exist.
    pub fn len(&self, cache_name: &str) -> usize {
        self.caches.get(cache_name).map_or(0, |cache| cache.len())
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }
}

impl CacheManager for LocalCacheManager {
    fn evict(&self, cache_name: &str, key: &str) {
        if let Some(cache) = self.caches.get(cache_name) {
            cache.remove(key);
        }
        trace!(cache = cache_name, key, "evicted local cache entry");
    }

    fn clear(&self, cache_name: &str) {
        if let Some(cache) = self.caches.get(cache_name) {
            cache.clear();
        }
        trace!(cache = cache_name, "cleared local cache");
    }
}
