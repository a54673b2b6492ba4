//! Body re-chunking for streaming pass-through.
//!
//! Upstream SSE responses are relayed in frames of at most 1 KiB so each
//! write reaches the client promptly instead of sitting in a large buffer.
//! Byte order is preserved; an upstream read error terminates the stream.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::Stream;
use pin_project_lite::pin_project;

/// Frame size for streaming copies.
pub const STREAM_CHUNK_SIZE: usize = 1024;

pin_project! {
    /// Splits an inner byte stream into frames of at most `chunk_size`.
    pub struct ChunkedStream<S> {
        #[pin]
        inner: S,
        pending: VecDeque<Bytes>,
        chunk_size: usize,
        done: bool,
    }
}

impl<S> ChunkedStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    pub fn new(inner: S) -> Self {
        Self::with_chunk_size(inner, STREAM_CHUNK_SIZE)
    }

    pub fn with_chunk_size(inner: S, chunk_size: usize) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }
}

impl<S> Stream for ChunkedStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let mut offset = 0;
                    while offset < chunk.len() {
                        let end = (offset + *this.chunk_size).min(chunk.len());
                        this.pending.push_back(chunk.slice(offset..end));
                        offset = end;
                    }
                    // An empty chunk yields nothing; poll again.
                }
                Poll::Ready(Some(Err(err))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
