//! Result cache. Entries are keyed `type-value` and hold one timestamped
//! slice per source section, so sources with different freshness windows
//! share a single entry.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use intelwire::EncodedResult;
use lru::LruCache;
use parking_lot::Mutex;

/// One source's contribution to a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResult {
    /// Seconds since the epoch when the source answered.
    pub ts: u64,
    pub result: EncodedResult,
}

/// Per-source slices for one `type-value` key.
pub type CacheEntry = HashMap<String, CachedResult>;

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, key: &str, entry: CacheEntry);
}

/// In-process LRU cache.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> MemoryCache {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        MemoryCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    async fn set(&self, key: &str, entry: CacheEntry) {
        self.entries.lock().put(key.to_string(), entry);
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
