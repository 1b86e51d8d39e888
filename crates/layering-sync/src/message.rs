//! Invalidation messages exchanged through the shared log.

use serde::{Deserialize, Serialize};

use crate::sync::CacheManager;

/// A change another node made that local caches must reflect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationMessage {
    /// One key was written or deleted.
    Evict { cache_name: String, key: String },
    /// A whole cache was cleared.
    Clear { cache_name: String },
}

impl InvalidationMessage {
    pub fn evict(cache_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Evict {
            cache_name: cache_name.into(),
            key: key.into(),
        }
    }

    pub fn clear(cache_name: impl Into<String>) -> Self {
        Self::Clear {
            cache_name: cache_name.into(),
        }
    }

    pub fn cache_name(&self) -> &str {
        match self {
            Self::Evict { cache_name, .. } | Self::Clear { cache_name } => cache_name,
        }
    }

    /// Apply to the local cache.
    pub fn apply(&self, manager: &dyn CacheManager) {
        match self {
            Self::Evict { cache_name, key } => manager.evict(cache_name, key),
            Self::Clear { cache_name } => manager.clear(cache_name),
        }
    }
}
