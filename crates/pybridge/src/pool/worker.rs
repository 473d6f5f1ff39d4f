//! One pooled worker: a [`Protocol`] over a [`Transport`], plus the pool-facing bookkeeping
//! (lifecycle state, concurrency counter, recycling counters, owned instance handles).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::protocol::Protocol;
use crate::transport::{Transport, TransportState};

pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Draining,
    Dead,
}

/// Smoothing factor for the weighted-scheduling latency EMA (see `SPEC_FULL.md`'s
/// "Supplemented features": spec leaves the moving average's shape unspecified).
const LATENCY_EMA_ALPHA: f64 = 0.2;

pub struct Worker {
    pub id: WorkerId,
    pub protocol: Protocol,
    transport: Arc<dyn Transport>,
    state: Mutex<WorkerState>,
    inflight: AtomicUsize,
    requests_served: AtomicU64,
    started_at: Instant,
    last_active: Mutex<Instant>,
    handles: Mutex<HashSet<String>>,
    avg_latency_ms: Mutex<f64>,
}

impl Worker {
    pub fn new(id: WorkerId, protocol: Protocol, transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id,
            protocol,
            transport,
            state: Mutex::new(WorkerState::Starting),
            inflight: AtomicUsize::new(0),
            requests_served: AtomicU64::new(0),
            started_at: now,
            last_active: Mutex::new(now),
            handles: Mutex::new(HashSet::new()),
            avg_latency_ms: Mutex::new(0.0),
        }
    }

    pub async fn mark_ready(&self) {
        *self.state.lock().await = WorkerState::Ready;
    }

    pub async fn mark_draining(&self) {
        *self.state.lock().await = WorkerState::Draining;
    }

    pub async fn mark_dead(&self) {
        *self.state.lock().await = WorkerState::Dead;
    }

    pub async fn state(&self) -> WorkerState {
        if self.transport.state() == TransportState::Disposed {
            return WorkerState::Dead;
        }
        *self.state.lock().await
    }

    pub async fn is_available(&self, max_concurrent: usize) -> bool {
        matches!(self.state().await, WorkerState::Ready) && self.inflight() < max_concurrent
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn idle_time(&self) -> Duration {
        self.last_active.lock().await.elapsed()
    }

    pub async fn begin_request(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        *self.last_active.lock().await = Instant::now();
    }

    pub async fn end_request(&self, elapsed: Duration) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        self.requests_served.fetch_add(1, Ordering::SeqCst);
        *self.last_active.lock().await = Instant::now();

        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut avg = self.avg_latency_ms.lock().await;
        *avg = if *avg == 0.0 {
            sample
        } else {
            *avg * (1.0 - LATENCY_EMA_ALPHA) + sample * LATENCY_EMA_ALPHA
        };
    }

    pub async fn avg_latency_ms(&self) -> f64 {
        *self.avg_latency_ms.lock().await
    }

    pub async fn bind_handle(&self, handle: String) {
        self.handles.lock().await.insert(handle);
    }

    pub async fn unbind_handle(&self, handle: &str) {
        self.handles.lock().await.remove(handle);
    }

    pub async fn owns_handle(&self, handle: &str) -> bool {
        self.handles.lock().await.contains(handle)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn dispose(&self) {
        self.mark_dead().await;
        self.transport.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecOptions, SafeCodec};
    use crate::transport::embedded::{EmbeddedDispatcher, EmbeddedLoader, EmbeddedTransport};
    use crate::error::BridgeError;
    use async_trait::async_trait;

    struct NoopDispatcher;
    #[async_trait]
    impl EmbeddedDispatcher for NoopDispatcher {
        async fn dispatch(&self, request: Vec<u8>) -> Result<Vec<u8>, BridgeError> {
            Ok(request)
        }
    }
    struct NoopLoader;
    #[async_trait]
    impl EmbeddedLoader for NoopLoader {
        async fn load(&self) -> Result<Arc<dyn EmbeddedDispatcher>, BridgeError> {
            Ok(Arc::new(NoopDispatcher))
        }
    }

    fn make_worker(id: WorkerId) -> Worker {
        let transport: Arc<dyn Transport> = Arc::new(EmbeddedTransport::new(Arc::new(NoopLoader)));
        let protocol = Protocol::new(
            transport.clone(),
            SafeCodec::new(CodecOptions::default()),
            Duration::from_secs(1),
        );
        Worker::new(id, protocol, transport)
    }

    #[tokio::test]
    async fn tracks_inflight_and_served_counts() {
        let worker = make_worker(1);
        worker.mark_ready().await;
        worker.begin_request().await;
        assert_eq!(worker.inflight(), 1);
        worker.end_request(Duration::from_millis(10)).await;
        assert_eq!(worker.inflight(), 0);
        assert_eq!(worker.requests_served(), 1);
    }

    #[tokio::test]
    async fn latency_ema_converges_toward_samples() {
        let worker = make_worker(1);
        worker.end_request(Duration::from_millis(100)).await;
        worker.end_request(Duration::from_millis(100)).await;
        let avg = worker.avg_latency_ms().await;
        assert!((avg - 100.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn handle_binding_roundtrips() {
        let worker = make_worker(1);
        worker.bind_handle("h1".into()).await;
        assert!(worker.owns_handle("h1").await);
        worker.unbind_handle("h1").await;
        assert!(!worker.owns_handle("h1").await);
    }

    #[tokio::test]
    async fn dead_transport_reports_dead_state() {
        let worker = make_worker(1);
        worker.mark_ready().await;
        worker.transport().dispose().await;
        assert_eq!(worker.state().await, WorkerState::Dead);
    }
}
