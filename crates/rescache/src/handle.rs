//! # Resource Handles
//!
//! What a caller gets back from the coordinator: resource metadata plus a
//! chunk stream, served either from a committed cache file or live from a
//! download pipe.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::bytes_stream::BytesStreamReader;
use crate::cache::{CacheEntry, CachedReader, ReaderPin};
use crate::error::{CacheError, CacheResult};
use crate::pipe::PipeEvent;

/// Upper bound on what `bytes()` reserves from an untrusted size hint
const MAX_PREALLOC_BYTES: usize = 8 * 1024 * 1024;

/// Metadata describing a resolved resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub key: String,
    /// Size in bytes, when known up front
    pub size: Option<u64>,
    pub mime_type: Option<String>,
    pub resource_name: Option<String>,
    pub metacard_ref: Option<String>,
}

impl From<&CacheEntry> for ResourceInfo {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            size: entry.size(),
            mime_type: entry.mime_type.clone(),
            resource_name: entry.resource_name.clone(),
            metacard_ref: entry.metacard_ref.clone(),
        }
    }
}

/// Where a handle's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOrigin {
    Cache,
    Upstream,
}

enum Body {
    Cached {
        stream: ReaderStream<File>,
        _pin: ReaderPin,
    },
    Piped {
        rx: mpsc::Receiver<PipeEvent>,
        finished: bool,
    },
}

/// A readable resource.
///
/// Yields the resource's bytes in order. A piped handle that is detached
/// for falling behind yields [`CacheError::SlowConsumerDropped`] once its
/// buffered chunks run out. Dropping the handle detaches it.
pub struct ResourceHandle {
    info: ResourceInfo,
    origin: HandleOrigin,
    body: Body,
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("info", &self.info)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl ResourceHandle {
    pub(crate) fn from_cache(reader: CachedReader, chunk_size: usize) -> Self {
        let (entry, file, pin) = reader.into_parts();
        Self {
            info: ResourceInfo::from(&entry),
            origin: HandleOrigin::Cache,
            body: Body::Cached {
                stream: ReaderStream::with_capacity(file, chunk_size.max(1)),
                _pin: pin,
            },
        }
    }

    /// Wait for the pipe to open the upstream source.
    ///
    /// Fails with the pipe's error when the source could not be opened.
    pub(crate) async fn from_pipe(mut rx: mpsc::Receiver<PipeEvent>) -> CacheResult<Self> {
        loop {
            match rx.recv().await {
                Some(PipeEvent::Started(info)) => {
                    return Ok(Self {
                        info,
                        origin: HandleOrigin::Upstream,
                        body: Body::Piped {
                            rx,
                            finished: false,
                        },
                    });
                }
                Some(PipeEvent::Error(e)) => return Err(e),
                // Nothing else precedes the start marker
                Some(PipeEvent::Chunk(_)) | Some(PipeEvent::End) => continue,
                None => return Err(CacheError::Cancelled),
            }
        }
    }

    pub fn info(&self) -> &ResourceInfo {
        &self.info
    }

    pub fn key(&self) -> &str {
        &self.info.key
    }

    pub fn origin(&self) -> HandleOrigin {
        self.origin
    }

    pub fn is_cached(&self) -> bool {
        self.origin == HandleOrigin::Cache
    }

    /// Detach from the resource. Other consumers of the same download are
    /// unaffected.
    pub fn cancel(mut self) {
        if let Body::Piped { rx, .. } = &mut self.body {
            rx.close();
        }
    }

    /// Read the whole resource into memory.
    pub async fn bytes(self) -> CacheResult<Bytes> {
        let capacity = self
            .info
            .size
            .and_then(|size| usize::try_from(size).ok())
            .map_or(0, |size| size.min(MAX_PREALLOC_BYTES));
        let mut buf = BytesMut::with_capacity(capacity);
        let mut stream = self;
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    pub fn into_async_read(self) -> BytesStreamReader {
        BytesStreamReader::new(self)
    }
}

impl Stream for ResourceHandle {
    type Item = CacheResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match &mut this.body {
            Body::Cached { stream, .. } => match Pin::new(stream).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(CacheError::store(
                    format!("reading cached {}", this.info.key),
                    e,
                )))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            Body::Piped { rx, finished } => loop {
                if *finished {
                    return Poll::Ready(None);
                }
                match rx.poll_recv(cx) {
                    Poll::Ready(Some(PipeEvent::Chunk(chunk))) => return Poll::Ready(Some(Ok(chunk))),
                    Poll::Ready(Some(PipeEvent::Started(_))) => continue,
                    Poll::Ready(Some(PipeEvent::End)) => {
                        *finished = true;
                        return Poll::Ready(None);
                    }
                    Poll::Ready(Some(PipeEvent::Error(e))) => {
                        *finished = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                    // Closed without a terminal event: the pipe dropped us
                    Poll::Ready(None) => {
                        *finished = true;
                        return Poll::Ready(Some(Err(CacheError::SlowConsumerDropped)));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            },
        }
    }
}
