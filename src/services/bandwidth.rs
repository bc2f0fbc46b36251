//! Byte counting stream adapter.
//!
//! [`BandwidthTracker`] passes chunks through untouched while counting them,
//! optionally fails the stream once a byte limit is crossed, and reports a
//! single [`TransferSummary`] when the stream ends, errors, or is dropped.

use bytes::Bytes;
use futures::Stream;
use std::{
    error::Error,
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

/// Raised inside the stream when more than `limit` bytes arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitExceeded {
    pub limit: u64,
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer exceeded {} bytes", self.limit)
    }
}

impl Error for LimitExceeded {}

/// True when `err` was produced by a tracker's byte limit.
pub fn is_limit_exceeded(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<LimitExceeded>())
}

/// Outcome reported once per tracked stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    /// The underlying stream reached its end without error.
    pub finished: bool,
}

type CloseHook = Box<dyn FnOnce(TransferSummary) + Send>;

pub struct BandwidthTracker<S> {
    inner: S,
    bytes: u64,
    limit: Option<u64>,
    done: bool,
    finished: bool,
    on_close: Option<CloseHook>,
}

impl<S> BandwidthTracker<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            bytes: 0,
            limit: None,
            done: false,
            finished: false,
            on_close: None,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(TransferSummary) + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }

    fn close(&mut self) {
        self.done = true;
        if let Some(hook) = self.on_close.take() {
            hook(TransferSummary {
                bytes: self.bytes,
                finished: self.finished,
            });
        }
    }
}

impl<S> Stream for BandwidthTracker<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes += chunk.len() as u64;
                if let Some(limit) = this.limit.filter(|limit| this.bytes > *limit) {
                    this.close();
                    return Poll::Ready(Some(Err(io::Error::other(LimitExceeded { limit }))));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.close();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.close();
                Poll::Ready(None)
            }
        }
    }
}

impl<S> Drop for BandwidthTracker<S> {
    fn drop(&mut self) {
        self.close();
    }
}
