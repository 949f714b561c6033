//! # Eviction Manager
//!
//! Keeps the store within its configured byte and entry bounds by removing
//! the least recently touched entries first.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::entry::{CacheEntry, RecencyComparator};
use crate::cache::stats::CacheCounters;
use crate::cache::store::{ReliableResourceStore, RemoveOutcome};
use crate::config::CacheConfig;

/// Result of one eviction pass
#[derive(Debug, Default, Clone)]
pub struct EvictionReport {
    pub evicted: Vec<CacheEntry>,
    /// Keys skipped because an open reader pinned them
    pub skipped: Vec<String>,
    pub bytes_freed: u64,
}

impl EvictionReport {
    pub fn evicted_keys(&self) -> Vec<&str> {
        self.evicted.iter().map(|e| e.key.as_str()).collect()
    }
}

#[derive(Debug)]
pub struct EvictionManager {
    store: Arc<ReliableResourceStore>,
    counters: Arc<CacheCounters>,
    max_bytes: u64,
    max_entries: u64,
}

impl EvictionManager {
    pub fn new(
        store: Arc<ReliableResourceStore>,
        config: &CacheConfig,
        counters: Arc<CacheCounters>,
    ) -> Self {
        Self {
            store,
            counters,
            max_bytes: config.max_cache_bytes,
            max_entries: config.max_cache_entries,
        }
    }

    pub fn over_limit(&self) -> bool {
        (self.max_bytes > 0 && self.store.total_size_bytes() > self.max_bytes)
            || (self.max_entries > 0 && self.store.entry_count() > self.max_entries)
    }

    /// Run one eviction pass.
    pub async fn enforce(&self) -> EvictionReport {
        let mut report = EvictionReport::default();
        if !self.over_limit() {
            return report;
        }

        let mut candidates = self.store.entries();
        RecencyComparator::sort(&mut candidates);

        for candidate in candidates {
            if !self.over_limit() {
                break;
            }
            match self.store.remove_if_unpinned(&candidate.key).await {
                RemoveOutcome::Removed(entry) => {
                    debug!(
                        key = %entry.key,
                        size = entry.size_bytes,
                        last_touched = entry.last_touched_millis,
                        "Evicted cache entry"
                    );
                    report.bytes_freed += entry.size().unwrap_or(0);
                    report.evicted.push(entry);
                }
                RemoveOutcome::Pinned => {
                    warn!(key = %candidate.key, "Skipping eviction of entry with an open reader");
                    report.skipped.push(candidate.key);
                }
                RemoveOutcome::Missing => {
                    debug!(key = %candidate.key, "Entry already removed, nothing to evict");
                }
            }
        }

        if !report.evicted.is_empty() {
            self.counters.record_evictions(report.evicted.len() as u64);
            info!(
                evicted = report.evicted.len(),
                bytes_freed = report.bytes_freed,
                total_bytes = self.store.total_size_bytes(),
                entries = self.store.entry_count(),
                "Eviction pass finished"
            );
        }
        if self.over_limit() {
            warn!(
                total_bytes = self.store.total_size_bytes(),
                entries = self.store.entry_count(),
                "Cache still over its limits after eviction"
            );
        }
        report
    }

    /// Start the background eviction task.
    ///
    /// The task runs a pass for every trigger and exits once every
    /// [`EvictionTrigger`] has been dropped.
    pub fn spawn(self: Arc<Self>) -> (EvictionTrigger, JoinHandle<()>) {
        // One pending trigger is enough; further ones coalesce into it
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                self.enforce().await;
            }
            debug!("Eviction task stopped");
        });
        (EvictionTrigger { tx }, handle)
    }
}

/// Wakes the background eviction task after the store grew.
#[derive(Debug, Clone)]
pub struct EvictionTrigger {
    tx: mpsc::Sender<()>,
}

impl EvictionTrigger {
    pub fn notify(&self) {
        // A full channel already has a pass pending
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<ReliableResourceStore>,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(
            ReliableResourceStore::open_with(dir.path(), clock.clone(), None)
                .await
                .unwrap(),
        );
        Fixture {
            _dir: dir,
            store,
            clock,
        }
    }

    async fn insert(f: &Fixture, key: &str, size: usize, at: u64) -> CacheEntry {
        f.clock.set(at);
        let mut handle = f.store.begin_write(key, None, None).await.unwrap();
        handle.write_chunk(&vec![7u8; size]).await.unwrap();
        f.store.commit_write(handle, size as u64).await.unwrap()
    }

    fn manager(f: &Fixture, max_bytes: u64, max_entries: u64) -> EvictionManager {
        let config = CacheConfig {
            max_cache_bytes: max_bytes,
            max_cache_entries: max_entries,
            ..CacheConfig::default()
        };
        EvictionManager::new(f.store.clone(), &config, Arc::new(CacheCounters::default()))
    }

    #[tokio::test]
    async fn evicts_oldest_until_under_byte_limit() {
        let f = fixture().await;
        let evictor = manager(&f, 1000, 0);

        let a = insert(&f, "A", 500, 1).await;
        insert(&f, "B", 300, 2).await;
        insert(&f, "C", 100, 3).await;
        assert!(evictor.enforce().await.evicted.is_empty());

        insert(&f, "D", 300, 4).await;
        let report = evictor.enforce().await;
        assert_eq!(report.evicted_keys(), ["A"]);
        assert_eq!(report.bytes_freed, 500);
        assert_eq!(f.store.total_size_bytes(), 700);
        assert!(!a.file_path.exists());

        let mut remaining: Vec<_> = f.store.entries().into_iter().map(|e| e.key).collect();
        remaining.sort();
        assert_eq!(remaining, ["B", "C", "D"]);
        for entry in f.store.entries() {
            assert!(entry.file_path.exists());
        }
    }

    #[tokio::test]
    async fn touches_change_eviction_order() {
        let f = fixture().await;
        let evictor = manager(&f, 0, 2);

        insert(&f, "A", 10, 1).await;
        insert(&f, "B", 10, 2).await;
        f.clock.set(10);
        f.store.lookup("A").await.unwrap();
        insert(&f, "C", 10, 11).await;

        let report = evictor.enforce().await;
        assert_eq!(report.evicted_keys(), ["B"]);
    }

    #[tokio::test]
    async fn equal_timestamps_evict_in_key_order() {
        let f = fixture().await;
        let evictor = manager(&f, 0, 1);

        insert(&f, "zeta", 1, 5).await;
        insert(&f, "alpha", 1, 5).await;
        insert(&f, "mid", 1, 5).await;

        let report = evictor.enforce().await;
        assert_eq!(report.evicted_keys(), ["alpha", "mid"]);
    }

    #[tokio::test]
    async fn pinned_entries_are_skipped() {
        let f = fixture().await;
        let evictor = manager(&f, 15, 0);

        insert(&f, "A", 10, 1).await;
        insert(&f, "B", 10, 2).await;
        let reader = f.store.open_reader("A").await.unwrap();

        let report = evictor.enforce().await;
        assert_eq!(report.skipped, ["A"]);
        assert_eq!(report.evicted_keys(), ["B"]);
        drop(reader);
    }

    #[tokio::test]
    async fn background_task_runs_on_trigger() {
        let f = fixture().await;
        let evictor = Arc::new(manager(&f, 10, 0));

        insert(&f, "A", 10, 1).await;
        insert(&f, "B", 10, 2).await;

        let (trigger, handle) = evictor.spawn();
        trigger.notify();
        trigger.notify();
        drop(trigger);
        handle.await.unwrap();

        assert_eq!(f.store.entry_count(), 1);
        assert!(f.store.lookup("B").await.is_some());
    }
}
