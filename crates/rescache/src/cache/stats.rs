use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the coordinator, pipes and eviction manager.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    store_errors: AtomicU64,
    evictions: AtomicU64,
    aborted_fetches: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_aborted_fetch(&self) {
        self.aborted_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: u64, total_bytes: u64) -> CacheStats {
        CacheStats {
            entry_count,
            total_bytes,
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            coalesced_count: self.coalesced.load(Ordering::Relaxed),
            store_error_count: self.store_errors.load(Ordering::Relaxed),
            eviction_count: self.evictions.load(Ordering::Relaxed),
            aborted_fetch_count: self.aborted_fetches.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the cache, for external metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Requests that attached to an already running fetch
    pub coalesced_count: u64,
    /// Failed cache writes and commits
    pub store_error_count: u64,
    pub eviction_count: u64,
    pub aborted_fetch_count: u64,
}
