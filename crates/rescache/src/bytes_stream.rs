use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use futures::Stream;
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

use crate::error::CacheResult;

type ChunkStream = Pin<Box<dyn Stream<Item = CacheResult<Bytes>> + Send>>;

/// Exposes a chunk stream as `AsyncRead` and `AsyncBufRead`.
///
/// Stream errors come out as `io::Error` wrapping the original
/// [`CacheError`](crate::CacheError).
pub struct BytesStreamReader {
    stream: ChunkStream,
    pending: Bytes,
    done: bool,
}

impl BytesStreamReader {
    pub fn new(stream: impl Stream<Item = CacheResult<Bytes>> + Send + 'static) -> Self {
        Self {
            stream: Box::pin(stream),
            pending: Bytes::new(),
            done: false,
        }
    }

    /// Make sure `pending` holds data unless the stream is exhausted.
    fn poll_refill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.has_remaining() && !self.done {
            match ready!(self.stream.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => {
                    self.done = true;
                    return Poll::Ready(Err(e.into()));
                }
                None => self.done = true,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for BytesStreamReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_refill(cx))?;
        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncBufRead for BytesStreamReader {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        ready!(this.poll_refill(cx))?;
        Poll::Ready(Ok(&this.pending[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        this.pending.advance(amt.min(this.pending.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use futures::stream;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};

    #[tokio::test]
    async fn reads_across_chunks() {
        let chunks: Vec<CacheResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"world")),
        ];
        let mut reader = BytesStreamReader::new(stream::iter(chunks));
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn lines_span_chunk_boundaries() {
        let chunks: Vec<CacheResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"first li")),
            Ok(Bytes::from_static(b"ne\nsecond")),
            Ok(Bytes::from_static(b" line\n")),
        ];
        let mut lines = BytesStreamReader::new(stream::iter(chunks)).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("first line"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("second line"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn surfaces_stream_errors() {
        let chunks: Vec<CacheResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(CacheError::SlowConsumerDropped),
        ];
        let mut reader = BytesStreamReader::new(stream::iter(chunks));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(matches!(
            err.get_ref().and_then(|e| e.downcast_ref::<CacheError>()),
            Some(CacheError::SlowConsumerDropped)
        ));
        assert_eq!(out, b"abc");
    }
}
