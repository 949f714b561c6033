//! # Download Coordinator
//!
//! Entry point of the engine. Serves resources from the cache when it can,
//! joins an in-flight download when one exists, and otherwise starts a new
//! download pipe. At most one upstream fetch per key runs at a time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheCounters, CacheKey, CacheStats, EvictionManager, EvictionReport, EvictionTrigger,
    ReliableResourceStore,
};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::handle::ResourceHandle;
use crate::pipe::{DownloadPipe, PipeOutcome};
use crate::source::{SourceOpener, SourceRegistry};

/// Bound on cache/in-flight round trips for a single resolve
const MAX_RESOLVE_ATTEMPTS: usize = 3;

type InFlight = Arc<Mutex<HashMap<String, Arc<DownloadPipe>>>>;

enum Joined {
    Leader(Arc<DownloadPipe>),
    Existing(Arc<DownloadPipe>),
    /// A pipe committed between the cache check and the table lock
    Committed,
}

pub struct DownloadCoordinator {
    config: Arc<CacheConfig>,
    store: Arc<ReliableResourceStore>,
    counters: Arc<CacheCounters>,
    evictor: Arc<EvictionManager>,
    trigger: Arc<Mutex<Option<EvictionTrigger>>>,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
    in_flight: InFlight,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("cache_directory", &self.store.directory())
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

impl DownloadCoordinator {
    /// Open the cache described by `config` and start the eviction task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        config.validate()?;
        let store = Arc::new(
            ReliableResourceStore::open_with(
                config.cache_directory.clone(),
                clock,
                config.entry_ttl_millis,
            )
            .await?,
        );
        let counters = Arc::new(CacheCounters::default());
        let evictor = Arc::new(EvictionManager::new(
            store.clone(),
            &config,
            counters.clone(),
        ));
        let (trigger, eviction_task) = evictor.clone().spawn();
        // Limits may have shrunk since the store was last used
        trigger.notify();

        info!(
            directory = %config.cache_directory.display(),
            entries = store.entry_count(),
            total_bytes = store.total_size_bytes(),
            "Cache opened"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            counters,
            evictor,
            trigger: Arc::new(Mutex::new(Some(trigger))),
            eviction_task: Mutex::new(Some(eviction_task)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ReliableResourceStore> {
        &self.store
    }

    /// Resolve `key`, opening it with `opener` on a cache miss.
    ///
    /// The opener receives `key` as the resource identifier.
    pub async fn resolve(
        &self,
        key: &str,
        opener: Arc<dyn SourceOpener>,
    ) -> CacheResult<ResourceHandle> {
        self.resolve_with(key, key, opener).await
    }

    /// Resolve a resource of a registered source under its composite key.
    pub async fn resolve_from(
        &self,
        registry: &SourceRegistry,
        source_id: &str,
        resource_id: &str,
    ) -> CacheResult<ResourceHandle> {
        let opener = registry.get(source_id).ok_or_else(|| {
            CacheError::SourceUnavailable(format!("no source registered as {source_id}"))
        })?;
        let key = CacheKey::new(source_id, resource_id).to_string();
        self.resolve_with(&key, resource_id, opener).await
    }

    async fn resolve_with(
        &self,
        key: &str,
        resource_id: &str,
        opener: Arc<dyn SourceOpener>,
    ) -> CacheResult<ResourceHandle> {
        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            if let Some(reader) = self.store.open_reader(key).await {
                self.counters.record_hit();
                debug!(key, "Cache hit");
                return Ok(ResourceHandle::from_cache(
                    reader,
                    self.config.chunk_size_bytes,
                ));
            }

            let joined = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(key) {
                    Some(pipe) => Joined::Existing(pipe.clone()),
                    None if self.store.contains(key) => Joined::Committed,
                    None => {
                        let pipe = Arc::new(DownloadPipe::new(
                            key,
                            self.config.clone(),
                            self.counters.clone(),
                        ));
                        in_flight.insert(key.to_string(), pipe.clone());
                        Joined::Leader(pipe)
                    }
                }
            };

            match joined {
                Joined::Leader(pipe) => {
                    self.counters.record_miss();
                    debug!(key, resource_id, "Cache miss, starting download");
                    let rx = pipe.attach();
                    self.start(pipe, resource_id.to_string(), opener);
                    return match rx {
                        Some(rx) => ResourceHandle::from_pipe(rx).await,
                        None => Err(CacheError::Internal(format!(
                            "fresh pipe for {key} refused its first consumer"
                        ))),
                    };
                }
                Joined::Existing(pipe) => {
                    self.counters.record_coalesced();
                    if let Some(rx) = pipe.attach() {
                        debug!(key, "Joined in-flight download");
                        return ResourceHandle::from_pipe(rx).await;
                    }
                    debug!(key, attempt, "Download already streaming, waiting for it");
                    match pipe.wait_outcome().await {
                        PipeOutcome::Failed(e) => return Err(e),
                        PipeOutcome::Completed { .. } | PipeOutcome::Aborted => continue,
                    }
                }
                Joined::Committed => continue,
            }
        }

        warn!(key, attempts = MAX_RESOLVE_ATTEMPTS, "Giving up on resolve");
        Err(CacheError::SourceUnavailable(format!(
            "{key}: no usable result after {MAX_RESOLVE_ATTEMPTS} attempts"
        )))
    }

    fn start(&self, pipe: Arc<DownloadPipe>, resource_id: String, opener: Arc<dyn SourceOpener>) {
        let in_flight = self.in_flight.clone();
        let trigger = self.trigger.clone();
        let store = self.store.clone();
        let key = pipe.key().to_string();
        let registered = pipe.clone();

        tokio::spawn(async move {
            let release = move || {
                let mut in_flight = in_flight.lock();
                if in_flight
                    .get(&key)
                    .is_some_and(|p| Arc::ptr_eq(p, &registered))
                {
                    in_flight.remove(&key);
                }
            };
            let outcome = pipe.run(opener, resource_id, store, release).await;
            if let PipeOutcome::Completed { entry: Some(_) } = outcome {
                if let Some(trigger) = trigger.lock().as_ref() {
                    trigger.notify();
                }
            }
        });
    }

    /// Remove the cached entry for `key`.
    ///
    /// An in-flight download of the same key keeps serving its consumers
    /// but will not be cached. Returns whether an entry was removed or a
    /// download was newly marked.
    pub async fn invalidate(&self, key: &str) -> bool {
        let pipe = self.in_flight.lock().get(key).cloned();
        // Mark before removing so a commit racing this call is undone
        let discarded = pipe.is_some_and(|pipe| pipe.discard());
        let removed = self.store.remove(key).await;
        if removed || discarded {
            info!(key, removed, discarded, "Invalidated cache entry");
        } else {
            debug!(key, "Nothing to invalidate");
        }
        removed || discarded
    }

    pub fn stats(&self) -> CacheStats {
        self.counters
            .snapshot(self.store.entry_count(), self.store.total_size_bytes())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Run an eviction pass now rather than waiting for the next commit.
    pub async fn enforce_eviction(&self) -> EvictionReport {
        self.evictor.enforce().await
    }

    /// Stop the eviction task and persist last-touched times.
    ///
    /// Downloads still in flight run to completion.
    pub async fn shutdown(&self) -> CacheResult<()> {
        drop(self.trigger.lock().take());
        let task = self.eviction_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Eviction task ended abnormally");
            }
        }
        let synced = self.store.sync_metadata().await?;
        info!(synced, "Cache coordinator shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::handle::HandleOrigin;
    use crate::source::{FileSourceOpener, OpenedResource};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use futures::channel::mpsc as fmpsc;
    use futures::future::join_all;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    /// Serves fixed bytes, optionally after a delay
    struct StaticOpener {
        data: Bytes,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl StaticOpener {
        fn new(data: &'static [u8]) -> Arc<Self> {
            Self::delayed(data, Duration::ZERO)
        }

        fn delayed(data: &'static [u8], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                data: Bytes::from_static(data),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceOpener for StaticOpener {
        async fn open(&self, _resource_id: &str) -> CacheResult<OpenedResource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(OpenedResource::from_bytes(self.data.clone())
                .with_mime_type("application/octet-stream")
                .with_resource_name("payload.bin"))
        }
    }

    struct FailingOpener {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceOpener for FailingOpener {
        async fn open(&self, resource_id: &str) -> CacheResult<OpenedResource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::ResourceNotFound(resource_id.to_string()))
        }
    }

    /// Upstream fed chunk by chunk from the test body
    struct GatedOpener {
        calls: AtomicUsize,
        size_hint: Option<u64>,
        rx: Mutex<Option<fmpsc::UnboundedReceiver<CacheResult<Bytes>>>>,
    }

    impl GatedOpener {
        fn new(size_hint: Option<u64>) -> (Arc<Self>, fmpsc::UnboundedSender<CacheResult<Bytes>>) {
            let (tx, rx) = fmpsc::unbounded();
            let opener = Arc::new(Self {
                calls: AtomicUsize::new(0),
                size_hint,
                rx: Mutex::new(Some(rx)),
            });
            (opener, tx)
        }
    }

    #[async_trait]
    impl SourceOpener for GatedOpener {
        async fn open(&self, _resource_id: &str) -> CacheResult<OpenedResource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let rx = self
                .rx
                .lock()
                .take()
                .ok_or_else(|| CacheError::SourceUnavailable("already opened".into()))?;
            let mut opened = OpenedResource::new(rx);
            opened.size_hint = self.size_hint;
            Ok(opened)
        }
    }

    fn config(dir: &TempDir) -> CacheConfig {
        CacheConfig::builder()
            .with_cache_directory(dir.path().join("cache"))
            .build()
    }

    async fn wait_idle(coordinator: &DownloadCoordinator) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.in_flight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn data_files(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".data") || n.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_fetch_once() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(DownloadCoordinator::new(config(&dir)).await.unwrap());
        let opener = StaticOpener::delayed(b"shared payload", Duration::from_millis(50));

        let requests = (0..10).map(|_| {
            let coordinator = coordinator.clone();
            let opener = opener.clone();
            async move {
                let handle = coordinator.resolve("k", opener).await?;
                handle.bytes().await
            }
        });
        let results = join_all(requests).await;

        for result in results {
            assert_eq!(result.unwrap(), Bytes::from_static(b"shared payload"));
        }
        assert_eq!(opener.calls(), 1);
        let stats = coordinator.stats();
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn cached_resource_served_without_opener() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();

        let first = coordinator
            .resolve("k", StaticOpener::new(b"cached bytes"))
            .await
            .unwrap();
        assert_eq!(first.origin(), HandleOrigin::Upstream);
        let original = first.bytes().await.unwrap();

        let failing = Arc::new(FailingOpener {
            calls: AtomicUsize::new(0),
        });
        let second = coordinator.resolve("k", failing.clone()).await.unwrap();
        assert!(second.is_cached());
        assert_eq!(second.info().resource_name.as_deref(), Some("payload.bin"));
        assert_eq!(second.info().size, Some(12));
        assert_eq!(second.bytes().await.unwrap(), original);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 0);

        let stats = coordinator.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
    }

    #[tokio::test]
    async fn interrupted_upstream_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        let (opener, tx) = GatedOpener::new(None);

        let handle = coordinator.resolve("k", opener).await.unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"half"))).unwrap();
        tx.unbounded_send(Err(CacheError::SourceUnavailable("reset".into())))
            .unwrap();

        let err = handle.bytes().await.unwrap_err();
        assert!(matches!(err, CacheError::SourceUnavailable(_)));
        wait_idle(&coordinator).await;

        assert!(coordinator.store().lookup("k").await.is_none());
        assert!(data_files(coordinator.store().directory()).is_empty());
        assert_eq!(coordinator.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn failed_open_is_not_remembered() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        let failing = Arc::new(FailingOpener {
            calls: AtomicUsize::new(0),
        });

        let err = coordinator.resolve("k", failing.clone()).await.unwrap_err();
        assert!(err.is_not_found());
        wait_idle(&coordinator).await;

        let handle = coordinator
            .resolve("k", StaticOpener::new(b"now present"))
            .await
            .unwrap();
        assert_eq!(handle.bytes().await.unwrap(), Bytes::from_static(b"now present"));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lru_eviction_removes_just_the_oldest() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let coordinator = DownloadCoordinator::with_clock(
            CacheConfig::builder()
                .with_cache_directory(dir.path().join("cache"))
                .with_max_cache_bytes(1000)
                .build(),
            clock.clone(),
        )
        .await
        .unwrap();

        static A: [u8; 500] = [1; 500];
        static B: [u8; 300] = [2; 300];
        static C: [u8; 100] = [3; 100];
        static D: [u8; 300] = [4; 300];
        let inserts = [
            (1, "A", &A[..]),
            (2, "B", &B[..]),
            (3, "C", &C[..]),
            (4, "D", &D[..]),
        ];
        for (t, key, data) in inserts {
            if key == "D" {
                coordinator.enforce_eviction().await;
                assert_eq!(coordinator.stats().entry_count, 3);
                assert_eq!(coordinator.stats().total_bytes, 900);
            }
            clock.set(t);
            let handle = coordinator.resolve(key, StaticOpener::new(data)).await.unwrap();
            handle.bytes().await.unwrap();
            wait_idle(&coordinator).await;
        }
        let a_path = coordinator
            .store()
            .entries()
            .into_iter()
            .find(|e| e.key == "A")
            .map(|e| e.file_path);

        coordinator.enforce_eviction().await;

        let mut keys: Vec<String> = coordinator
            .store()
            .entries()
            .into_iter()
            .map(|e| e.key)
            .collect();
        keys.sort();
        assert_eq!(keys, ["B", "C", "D"]);
        assert_eq!(coordinator.stats().total_bytes, 700);
        if let Some(path) = a_path {
            assert!(!path.exists());
        }
        for entry in coordinator.store().entries() {
            assert!(entry.file_path.exists());
        }
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_disturb_others() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        let (opener, tx) = GatedOpener::new(Some(6));

        let leader = coordinator.resolve("k", opener.clone()).await.unwrap();
        let follower = coordinator.resolve("k", opener.clone()).await.unwrap();
        follower.cancel();

        tx.unbounded_send(Ok(Bytes::from_static(b"abc"))).unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"def"))).unwrap();
        drop(tx);

        assert_eq!(leader.bytes().await.unwrap(), Bytes::from_static(b"abcdef"));
        wait_idle(&coordinator).await;
        assert!(coordinator.store().lookup("k").await.is_some());
        assert_eq!(opener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().coalesced_count, 1);
    }

    #[tokio::test]
    async fn orphaned_fetch_continues_by_default() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        let (opener, tx) = GatedOpener::new(None);

        let handle = coordinator.resolve("k", opener).await.unwrap();
        drop(handle);
        tx.unbounded_send(Ok(Bytes::from_static(b"still cached")))
            .unwrap();
        drop(tx);

        wait_idle(&coordinator).await;
        let entry = coordinator.store().lookup("k").await.unwrap();
        assert_eq!(entry.size(), Some(12));
    }

    #[tokio::test]
    async fn orphaned_fetch_aborts_when_configured() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(
            CacheConfig::builder()
                .with_cache_directory(dir.path().join("cache"))
                .with_abort_fetch_if_orphaned(true)
                .build(),
        )
        .await
        .unwrap();
        let (opener, tx) = GatedOpener::new(None);

        let handle = coordinator.resolve("k", opener).await.unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"first"))).unwrap();
        drop(handle);
        tx.unbounded_send(Ok(Bytes::from_static(b"second"))).unwrap();

        wait_idle(&coordinator).await;
        assert!(coordinator.store().lookup("k").await.is_none());
        assert!(data_files(coordinator.store().directory()).is_empty());
        assert_eq!(coordinator.stats().aborted_fetch_count, 1);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        let opener = StaticOpener::new(b"payload");

        coordinator
            .resolve("k", opener.clone())
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        wait_idle(&coordinator).await;

        assert!(coordinator.invalidate("k").await);
        assert!(!coordinator.invalidate("k").await);
        assert!(!coordinator.invalidate("never-cached").await);
        assert!(coordinator.store().lookup("k").await.is_none());

        coordinator
            .resolve("k", opener.clone())
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(opener.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_during_download_skips_the_commit() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        let (opener, tx) = GatedOpener::new(None);

        let handle = coordinator.resolve("k", opener).await.unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"abc"))).unwrap();
        assert!(coordinator.invalidate("k").await);
        assert!(!coordinator.invalidate("k").await);
        tx.unbounded_send(Ok(Bytes::from_static(b"def"))).unwrap();
        drop(tx);

        assert_eq!(handle.bytes().await.unwrap(), Bytes::from_static(b"abcdef"));
        wait_idle(&coordinator).await;
        assert!(coordinator.store().lookup("k").await.is_none());
        assert!(data_files(coordinator.store().directory()).is_empty());
        assert_eq!(coordinator.stats().store_error_count, 0);
    }

    #[tokio::test]
    async fn huge_size_hint_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        let (opener, tx) = GatedOpener::new(Some(u64::MAX));

        let handle = coordinator.resolve("k", opener).await.unwrap();
        assert_eq!(handle.info().size, Some(u64::MAX));
        tx.unbounded_send(Ok(Bytes::from_static(b"tiny"))).unwrap();
        drop(tx);

        let err = handle.bytes().await.unwrap_err();
        assert!(matches!(err, CacheError::SourceUnavailable(_)));
        wait_idle(&coordinator).await;
        assert!(coordinator.store().lookup("k").await.is_none());
    }

    #[tokio::test]
    async fn disk_failure_before_upstream_drained_fails_the_reader() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        coordinator.store().fail_writes_beyond(3);
        let (opener, tx) = GatedOpener::new(None);

        let handle = coordinator.resolve("k", opener).await.unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"abc"))).unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"def"))).unwrap();

        let err = handle.bytes().await.unwrap_err();
        assert!(matches!(err, CacheError::StoreIo { .. }));
        drop(tx);
        wait_idle(&coordinator).await;
        assert!(coordinator.store().lookup("k").await.is_none());
        assert!(data_files(coordinator.store().directory()).is_empty());
        assert_eq!(coordinator.stats().store_error_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_consumer_is_dropped_and_others_finish() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(
            CacheConfig::builder()
                .with_cache_directory(dir.path().join("cache"))
                .with_chunk_size(1)
                .with_consumer_buffer_chunks(1)
                .with_slow_consumer_timeout(Duration::from_millis(50))
                .build(),
        )
        .await
        .unwrap();
        let (opener, tx) = GatedOpener::new(Some(16));

        let fast = coordinator.resolve("k", opener.clone()).await.unwrap();
        let slow = coordinator.resolve("k", opener.clone()).await.unwrap();
        let reader = tokio::spawn(fast.bytes());

        tx.unbounded_send(Ok(Bytes::from_static(b"0123456789abcdef")))
            .unwrap();
        drop(tx);

        assert_eq!(
            reader.await.unwrap().unwrap(),
            Bytes::from_static(b"0123456789abcdef")
        );
        let err = slow.bytes().await.unwrap_err();
        assert!(matches!(err, CacheError::SlowConsumerDropped));

        wait_idle(&coordinator).await;
        assert!(coordinator.store().lookup("k").await.is_some());
    }

    #[tokio::test]
    async fn commit_failure_still_delivers() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        let (opener, tx) = GatedOpener::new(None);

        let handle = coordinator.resolve("k", opener).await.unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"abc"))).unwrap();
        std::fs::remove_dir_all(coordinator.store().directory()).unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"def"))).unwrap();
        drop(tx);

        assert_eq!(handle.bytes().await.unwrap(), Bytes::from_static(b"abcdef"));
        wait_idle(&coordinator).await;
        assert!(coordinator.store().lookup("k").await.is_none());
        assert_eq!(coordinator.stats().store_error_count, 1);
    }

    #[tokio::test]
    async fn unwritable_store_fails_the_resolve() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();
        std::fs::remove_dir_all(coordinator.store().directory()).unwrap();

        let err = coordinator
            .resolve("k", StaticOpener::new(b"payload"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::StoreIo { .. }));
        assert_eq!(coordinator.stats().store_error_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_follower_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(DownloadCoordinator::new(config(&dir)).await.unwrap());
        let (opener, tx) = GatedOpener::new(None);

        let mut leader = coordinator.resolve("k", opener.clone()).await.unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"head-"))).unwrap();
        assert_eq!(
            leader.next().await.unwrap().unwrap(),
            Bytes::from_static(b"head-")
        );

        let follower = {
            let coordinator = coordinator.clone();
            let opener = opener.clone();
            tokio::spawn(async move { coordinator.resolve("k", opener).await })
        };
        tx.unbounded_send(Ok(Bytes::from_static(b"tail"))).unwrap();
        drop(tx);

        let mut rest = Vec::new();
        while let Some(chunk) = leader.next().await {
            rest.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(rest, b"tail");

        let follower = follower.await.unwrap().unwrap();
        assert!(follower.is_cached());
        assert_eq!(follower.bytes().await.unwrap(), Bytes::from_static(b"head-tail"));
        assert_eq!(opener.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_from_registry_uses_composite_key() {
        let dir = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        std::fs::write(files.path().join("report.txt"), b"quarterly").unwrap();

        let registry = SourceRegistry::new();
        registry.register_source("local", Arc::new(FileSourceOpener::new(files.path())));
        let coordinator = DownloadCoordinator::new(config(&dir)).await.unwrap();

        let handle = coordinator
            .resolve_from(&registry, "local", "report.txt")
            .await
            .unwrap();
        assert_eq!(handle.key(), "local:report.txt");
        assert_eq!(handle.bytes().await.unwrap(), Bytes::from_static(b"quarterly"));
        wait_idle(&coordinator).await;
        assert!(coordinator.store().lookup("local:report.txt").await.is_some());

        let err = coordinator
            .resolve_from(&registry, "remote", "report.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::SourceUnavailable(_)));

        let err = coordinator
            .resolve_from(&registry, "local", "missing.txt")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn shutdown_persists_touch_times() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(10));
        let coordinator = DownloadCoordinator::with_clock(config(&dir), clock.clone())
            .await
            .unwrap();
        coordinator
            .resolve("k", StaticOpener::new(b"payload"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        wait_idle(&coordinator).await;

        clock.set(500);
        coordinator.resolve("k", StaticOpener::new(b"unused")).await.unwrap();
        coordinator.shutdown().await.unwrap();
        drop(coordinator);

        let reopened = ReliableResourceStore::open_with(
            dir.path().join("cache"),
            Arc::new(ManualClock::new(0)),
            None,
        )
        .await
        .unwrap();
        let entry = reopened.entries().pop().unwrap();
        assert_eq!(entry.last_touched_millis, 500);
    }

    #[tokio::test]
    async fn stream_consumes_in_order() {
        let dir = TempDir::new().unwrap();
        let coordinator = DownloadCoordinator::new(CacheConfig {
            chunk_size_bytes: 2,
            ..config(&dir)
        })
        .await
        .unwrap();
        let opener = Arc::new(ChunkSource);
        let handle = coordinator.resolve("k", opener).await.unwrap();
        let chunks: Vec<Bytes> = handle.map(|c| c.unwrap()).collect().await;
        assert_eq!(
            chunks,
            [
                Bytes::from_static(b"ab"),
                Bytes::from_static(b"cd"),
                Bytes::from_static(b"e")
            ]
        );
    }

    struct ChunkSource;

    #[async_trait]
    impl SourceOpener for ChunkSource {
        async fn open(&self, _resource_id: &str) -> CacheResult<OpenedResource> {
            let chunks: Vec<CacheResult<Bytes>> = vec![
                Ok(Bytes::from_static(b"abcd")),
                Ok(Bytes::from_static(b"e")),
            ];
            Ok(OpenedResource::new(stream::iter(chunks)).with_size_hint(5))
        }
    }
}
