//! Worker-picking strategies (spec §4.5). Pickers take a snapshot of the live worker list and
//! never mutate it — the pool coordinator owns the set, per spec §5's shared-resource policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancing {
    RoundRobin,
    #[default]
    LeastLoaded,
    Weighted,
}

pub struct Scheduler {
    strategy: LoadBalancing,
    cursor: AtomicUsize,
}

impl Scheduler {
    pub fn new(strategy: LoadBalancing) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Picks an available worker (state `ready` and under `max_concurrent` inflight requests)
    /// from a snapshot, or `None` if every live worker is saturated.
    pub async fn pick(&self, workers: &[Arc<Worker>], max_concurrent: usize) -> Option<Arc<Worker>> {
        let mut eligible = Vec::with_capacity(workers.len());
        for worker in workers {
            if worker.is_available(max_concurrent).await {
                eligible.push(worker.clone());
            }
        }
        if eligible.is_empty() {
            return None;
        }

        match self.strategy {
            LoadBalancing::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % eligible.len();
                Some(eligible[idx].clone())
            }
            LoadBalancing::LeastLoaded => {
                let mut best = eligible[0].clone();
                let mut best_load = best.inflight();
                for candidate in &eligible[1..] {
                    let load = candidate.inflight();
                    if load < best_load {
                        best = candidate.clone();
                        best_load = load;
                    }
                }
                Some(best)
            }
            LoadBalancing::Weighted => {
                let mut best = eligible[0].clone();
                let mut best_avg = best.avg_latency_ms().await;
                for candidate in &eligible[1..] {
                    let avg = candidate.avg_latency_ms().await;
                    if avg < best_avg {
                        best = candidate.clone();
                        best_avg = avg;
                    }
                }
                Some(best)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecOptions, SafeCodec};
    use crate::error::BridgeError;
    use crate::protocol::Protocol;
    use crate::transport::embedded::{EmbeddedDispatcher, EmbeddedLoader, EmbeddedTransport};
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::time::Duration;

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

    async fn make_ready_worker(id: u64) -> Arc<Worker> {
        let transport: Arc<dyn Transport> = Arc::new(EmbeddedTransport::new(Arc::new(NoopLoader)));
        let protocol = Protocol::new(
            transport.clone(),
            SafeCodec::new(CodecOptions::default()),
            Duration::from_secs(1),
        );
        let worker = Arc::new(Worker::new(id, protocol, transport));
        worker.mark_ready().await;
        worker
    }

    #[tokio::test]
    async fn round_robin_cycles_through_workers() {
        let scheduler = Scheduler::new(LoadBalancing::RoundRobin);
        let workers = vec![make_ready_worker(1).await, make_ready_worker(2).await];
        let first = scheduler.pick(&workers, 1).await.unwrap();
        let second = scheduler.pick(&workers, 1).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn least_loaded_prefers_idle_worker() {
        let scheduler = Scheduler::new(LoadBalancing::LeastLoaded);
        let busy = make_ready_worker(1).await;
        busy.begin_request().await;
        let idle = make_ready_worker(2).await;
        let workers = vec![busy.clone(), idle.clone()];
        let picked = scheduler.pick(&workers, 5).await.unwrap();
        assert_eq!(picked.id, idle.id);
    }

    #[tokio::test]
    async fn returns_none_when_all_saturated() {
        let scheduler = Scheduler::new(LoadBalancing::LeastLoaded);
        let worker = make_ready_worker(1).await;
        worker.begin_request().await;
        let workers = vec![worker];
        assert!(scheduler.pick(&workers, 1).await.is_none());
    }
}
