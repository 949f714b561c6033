//! # Download Pipe
//!
//! One upstream read fanned out to any number of consumers plus the cache
//! writer. Every consumer is its own failure domain: a slow or vanished
//! consumer is detached while delivery to the others and to disk goes on.
//!
//! ```text
//! OPEN -> (READING <-> DELIVERING) -> COMPLETED | FAILED | ABORTED
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::{CacheCounters, CacheEntry, ReliableResourceStore};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::handle::ResourceInfo;
use crate::source::{OpenedResource, SourceOpener};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Open,
    Reading,
    Delivering,
    Completed,
    Failed,
    Aborted,
}

impl PipeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipeState::Completed | PipeState::Failed | PipeState::Aborted
        )
    }
}

/// Final result of a pipe, published to anyone waiting on it
#[derive(Debug, Clone)]
pub enum PipeOutcome {
    /// Upstream was fully drained. `entry` is `None` when the cache write
    /// failed even though every consumer received the whole resource.
    Completed { entry: Option<CacheEntry> },
    Failed(CacheError),
    Aborted,
}

/// Messages sent down a consumer channel
#[derive(Debug)]
pub(crate) enum PipeEvent {
    Started(ResourceInfo),
    Chunk(Bytes),
    End,
    Error(CacheError),
}

#[derive(Debug)]
struct Consumer {
    id: u64,
    tx: mpsc::Sender<PipeEvent>,
}

#[derive(Debug)]
struct PipeInner {
    state: PipeState,
    consumers: Vec<Consumer>,
    info: Option<ResourceInfo>,
    delivered_any: bool,
}

enum Finish {
    Completed(Option<CacheEntry>),
    Failed(CacheError),
    Aborted,
}

pub struct DownloadPipe {
    key: String,
    config: Arc<CacheConfig>,
    counters: Arc<CacheCounters>,
    inner: Mutex<PipeInner>,
    next_consumer_id: AtomicU64,
    cancel_requested: AtomicBool,
    discard_requested: AtomicBool,
    outcome_tx: watch::Sender<Option<PipeOutcome>>,
}

impl std::fmt::Debug for DownloadPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadPipe")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

impl DownloadPipe {
    pub fn new(
        key: impl Into<String>,
        config: Arc<CacheConfig>,
        counters: Arc<CacheCounters>,
    ) -> Self {
        let (outcome_tx, _) = watch::channel(None);
        Self {
            key: key.into(),
            config,
            counters,
            inner: Mutex::new(PipeInner {
                state: PipeState::Open,
                consumers: Vec::new(),
                info: None,
                delivered_any: false,
            }),
            next_consumer_id: AtomicU64::new(0),
            cancel_requested: AtomicBool::new(false),
            discard_requested: AtomicBool::new(false),
            outcome_tx,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> PipeState {
        self.inner.lock().state
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    /// Request an abort; takes effect before the next upstream read.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// Keep serving attached consumers but do not cache the result.
    ///
    /// Returns `false` if the download was already marked.
    pub fn discard(&self) -> bool {
        !self.discard_requested.swap(true, Ordering::SeqCst)
    }

    /// Attach a new consumer.
    ///
    /// Only possible until the first chunk has been delivered, so every
    /// consumer observes the complete byte sequence. Returns `None` after
    /// that point; such a caller should wait for the outcome instead.
    pub(crate) fn attach(&self) -> Option<mpsc::Receiver<PipeEvent>> {
        let mut inner = self.inner.lock();
        if inner.delivered_any || inner.state.is_terminal() {
            return None;
        }
        // Room for the start and terminal markers on top of the data buffer
        let (tx, rx) = mpsc::channel(self.config.consumer_buffer_chunks + 2);
        if let Some(info) = &inner.info {
            let _ = tx.try_send(PipeEvent::Started(info.clone()));
        }
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        inner.consumers.push(Consumer { id, tx });
        debug!(key = %self.key, consumer = id, "Consumer attached");
        Some(rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PipeOutcome>> {
        self.outcome_tx.subscribe()
    }

    /// Wait until the pipe reaches a terminal state.
    pub async fn wait_outcome(&self) -> PipeOutcome {
        let mut rx = self.subscribe();
        let outcome = match rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(PipeOutcome::Aborted),
            // The pipe task went away without publishing
            Err(_) => PipeOutcome::Aborted,
        };
        outcome
    }

    /// Drive the pipe to completion.
    ///
    /// `release` runs once the pipe is settled but before consumers learn
    /// about it; the coordinator uses it to leave the in-flight table so a
    /// consumer retrying after a failure starts a fresh fetch.
    pub async fn run(
        self: Arc<Self>,
        opener: Arc<dyn SourceOpener>,
        resource_id: String,
        store: Arc<ReliableResourceStore>,
        release: impl FnOnce() + Send + 'static,
    ) -> PipeOutcome {
        let finish = self.pump(opener.as_ref(), &resource_id, &store).await;
        self.settle(finish, release).await
    }

    async fn pump(
        &self,
        opener: &dyn SourceOpener,
        resource_id: &str,
        store: &ReliableResourceStore,
    ) -> Finish {
        self.set_state(PipeState::Reading);
        let opened = match opener.open(resource_id).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(key = %self.key, resource_id, error = %e, "Failed to open upstream source");
                return Finish::Failed(e);
            }
        };
        let OpenedResource {
            mut stream,
            size_hint,
            mime_type,
            resource_name,
            metacard_ref,
        } = opened;

        let mut writer = match store
            .begin_write(&self.key, resource_name.clone(), mime_type.clone())
            .await
        {
            Ok(writer) => writer,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to start cache write");
                self.counters.record_store_error();
                return Finish::Failed(e);
            }
        };
        if let Some(r) = &metacard_ref {
            writer.set_metacard_ref(r.clone());
        }

        self.announce(ResourceInfo {
            key: self.key.clone(),
            size: size_hint,
            mime_type,
            resource_name,
            metacard_ref,
        });

        let chunk_size = self.config.chunk_size_bytes.max(1);
        let mut total: u64 = 0;
        loop {
            if self.should_abort() {
                store.abort_write(&mut writer).await;
                return Finish::Aborted;
            }
            self.set_state(PipeState::Reading);
            let mut chunk = match stream.next().await {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!(key = %self.key, error = %e, received = total, "Upstream read failed");
                    store.abort_write(&mut writer).await;
                    return Finish::Failed(e);
                }
            };

            while !chunk.is_empty() {
                let piece = chunk.split_to(chunk.len().min(chunk_size));
                total += piece.len() as u64;
                if let Err(e) = writer.write_chunk(&piece).await {
                    // Upstream is not drained yet, so consumers fail too
                    warn!(key = %self.key, error = %e, "Cache write failed");
                    self.counters.record_store_error();
                    store.abort_write(&mut writer).await;
                    return Finish::Failed(e);
                }
                self.deliver(piece).await;
            }
        }

        if let Some(expected) = size_hint {
            if expected != total {
                warn!(key = %self.key, expected, received = total, "Upstream ended early");
                store.abort_write(&mut writer).await;
                return Finish::Failed(CacheError::SourceUnavailable(format!(
                    "{}: expected {expected} bytes, received {total}",
                    self.key
                )));
            }
        }

        if self.discard_requested.load(Ordering::SeqCst) {
            debug!(key = %self.key, "Invalidated while downloading, not caching");
            store.abort_write(&mut writer).await;
            return Finish::Completed(None);
        }

        match store.commit_write(writer, total).await {
            // A discard racing the commit may have missed the new entry
            Ok(_) if self.discard_requested.load(Ordering::SeqCst) => {
                store.remove(&self.key).await;
                Finish::Completed(None)
            }
            Ok(entry) => Finish::Completed(Some(entry)),
            Err(e) => {
                // Consumers already hold the full resource
                warn!(key = %self.key, error = %e, "Cache commit failed, resource delivered uncached");
                self.counters.record_store_error();
                Finish::Completed(None)
            }
        }
    }

    fn set_state(&self, state: PipeState) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = state;
        }
    }

    fn announce(&self, info: ResourceInfo) {
        let mut inner = self.inner.lock();
        for consumer in &inner.consumers {
            let _ = consumer.tx.try_send(PipeEvent::Started(info.clone()));
        }
        inner.info = Some(info);
    }

    /// Drop consumers whose handle went away and decide whether the fetch
    /// should stop.
    fn should_abort(&self) -> bool {
        if self.cancel_requested.load(Ordering::Acquire) {
            return true;
        }
        let mut inner = self.inner.lock();
        let before = inner.consumers.len();
        inner.consumers.retain(|c| !c.tx.is_closed());
        if !inner.consumers.is_empty() {
            return false;
        }
        if before > 0 {
            debug!(key = %self.key, "Last consumer detached");
        }
        // A pipe nobody ever attached to is not orphaned
        let attached_before = self.next_consumer_id.load(Ordering::Relaxed) > 0;
        attached_before && self.config.abort_fetch_if_orphaned
    }

    async fn deliver(&self, chunk: Bytes) {
        let consumers: Vec<(u64, mpsc::Sender<PipeEvent>)> = {
            let mut inner = self.inner.lock();
            inner.state = PipeState::Delivering;
            inner.delivered_any = true;
            inner
                .consumers
                .iter()
                .map(|c| (c.id, c.tx.clone()))
                .collect()
        };
        if consumers.is_empty() {
            return;
        }

        let timeout = self.config.slow_consumer_timeout();
        let sends = consumers.into_iter().map(|(id, tx)| {
            let chunk = chunk.clone();
            async move { (id, tx.send_timeout(PipeEvent::Chunk(chunk), timeout).await) }
        });

        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(key = %self.key, consumer = id, ?timeout, "Dropping slow consumer");
                    self.detach(id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(key = %self.key, consumer = id, "Consumer disconnected");
                    self.detach(id);
                }
            }
        }
    }

    /// Remove a consumer. Closing its channel without a terminal event is
    /// what tells the handle its delivery was truncated.
    fn detach(&self, id: u64) {
        self.inner.lock().consumers.retain(|c| c.id != id);
    }

    async fn settle(&self, finish: Finish, release: impl FnOnce()) -> PipeOutcome {
        let (state, outcome, event) = match finish {
            Finish::Completed(entry) => (
                PipeState::Completed,
                PipeOutcome::Completed { entry },
                PipeEvent::End,
            ),
            Finish::Failed(e) => (
                PipeState::Failed,
                PipeOutcome::Failed(e.clone()),
                PipeEvent::Error(e),
            ),
            Finish::Aborted => {
                self.counters.record_aborted_fetch();
                (
                    PipeState::Aborted,
                    PipeOutcome::Aborted,
                    PipeEvent::Error(CacheError::Cancelled),
                )
            }
        };

        let consumers = {
            let mut inner = self.inner.lock();
            inner.state = state;
            std::mem::take(&mut inner.consumers)
        };
        release();

        let timeout = self.config.slow_consumer_timeout();
        let sends = consumers.into_iter().map(|c| {
            let event = clone_terminal(&event);
            async move {
                if c.tx.send_timeout(event, timeout).await.is_err() {
                    debug!(consumer = c.id, "Consumer gone before terminal event");
                }
            }
        });
        join_all(sends).await;

        match &outcome {
            PipeOutcome::Completed { entry: Some(entry) } => {
                info!(key = %self.key, size = entry.size_bytes, "Download completed and cached")
            }
            PipeOutcome::Completed { entry: None } => {
                info!(key = %self.key, "Download completed without caching")
            }
            PipeOutcome::Failed(e) => warn!(key = %self.key, error = %e, "Download failed"),
            PipeOutcome::Aborted => info!(key = %self.key, "Download aborted"),
        }
        self.outcome_tx.send_replace(Some(outcome.clone()));
        outcome
    }
}

fn clone_terminal(event: &PipeEvent) -> PipeEvent {
    match event {
        PipeEvent::Error(e) => PipeEvent::Error(e.clone()),
        _ => PipeEvent::End,
    }
}
