//! Transport: a single bidirectional message channel between the host and one worker.
//!
//! Three variants share one trait: [`subprocess::SubprocessTransport`] (the primary path),
//! [`http::HttpTransport`], and [`embedded::EmbeddedTransport`]. Each owns the physical
//! channel's correlation needed to let several `send` calls share it concurrently — the
//! `id` field a caller embeds in `message` is how a transport backed by a shared stream
//! (subprocess stdio) knows which in-flight `send` a given response line belongs to. See
//! `DESIGN.md` for why this sits here rather than purely in `protocol.rs`.

pub mod embedded;
pub mod http;
pub mod subprocess;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Starting,
    Ready,
    Disposed,
}

/// A cooperative cancellation signal for one in-flight `send`. Cheap to clone; firing it from
/// any clone cancels every clone's waiters.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::cancel`] has been called (on this token or any of its clones).
    /// Resolves immediately if already cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A bidirectional message channel to one worker.
///
/// `send` embeds whatever correlation the caller's `message` already carries (the `id` field
/// of a `tywrap/1` request line); implementations backed by a shared duplex stream use it to
/// route the matching response back to the right caller even when several `send` calls are
/// in flight at once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Idempotent on success; concurrent callers share the same start.
    async fn init(&self) -> Result<(), BridgeError>;

    async fn send(
        &self,
        message: Vec<u8>,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<Vec<u8>, BridgeError>;

    /// Idempotent. Aborts every in-flight `send`.
    async fn dispose(&self);

    fn state(&self) -> TransportState;

    /// Tail of worker stderr, for attaching to timeout/crash errors. Empty for transports with
    /// no stderr channel (HTTP, embedded).
    fn stderr_tail(&self) -> String {
        String::new()
    }
}

/// Bounded append-only ring buffer over the last bytes of a worker's stderr (spec §4.3,
/// "bounded ring buffer (last ~8 KiB)"). Shared between the subprocess transport's stderr
/// reader task and the pool's crash-recovery error formatting.
pub struct StderrRing {
    buf: StdMutex<VecDeque<u8>>,
    capacity: usize,
}

impl StderrRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: StdMutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push_line(&self, line: &str) {
        let mut buf = self.buf.lock().expect("stderr ring poisoned");
        for byte in line.bytes().chain(std::iter::once(b'\n')) {
            if buf.len() == self.capacity {
                buf.pop_front();
            }
            buf.push_back(byte);
        }
    }

    pub fn tail_text(&self) -> String {
        let buf = self.buf.lock().expect("stderr ring poisoned");
        String::from_utf8_lossy(&buf.iter().copied().collect::<Vec<_>>()).into_owned()
    }
}

impl Default for StderrRing {
    fn default() -> Self {
        Self::new(8 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::task::yield_now().await;
        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn stderr_ring_bounds_capacity() {
        let ring = StderrRing::new(8);
        ring.push_line("hello");
        ring.push_line("world");
        assert!(ring.tail_text().len() <= 8);
        assert!(ring.tail_text().ends_with("rld\n") || ring.tail_text().ends_with("\n"));
    }
}
