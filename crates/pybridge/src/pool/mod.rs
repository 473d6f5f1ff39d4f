//! WorkerPool: N subprocess transports behind a scheduler (spec §4.5).
//!
//! Owns the live worker set, the instance-handle→worker routing table, spawn/quarantine/replace,
//! and graceful drain. Grounded on the teacher's `mcp/pool.rs` (`AppServerPool`): a
//! `Vec<Arc<Worker>>` behind a lock, a background reaper for idle/over-served workers, and
//! crash recovery that fails in-flight requests before the worker is dropped from the set.

pub mod scheduler;
pub mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::codec::Method;
use crate::error::BridgeError;
use crate::transport::CancelToken;

pub use scheduler::{LoadBalancing, Scheduler};
pub use worker::{Worker, WorkerId, WorkerState};

/// Builds a fresh worker (spawn + transport init + warm-up) on demand. Implemented by
/// `builder::SubprocessWorkerSpawner` for the primary subprocess path.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, id: WorkerId) -> Result<Arc<Worker>, BridgeError>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_processes: usize,
    pub max_processes: usize,
    pub max_idle_time: Duration,
    pub max_requests_per_process: u64,
    pub max_concurrent_per_process: usize,
    pub default_timeout: Duration,
    pub load_balancing: LoadBalancing,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_processes: 1,
            max_processes: 4,
            max_idle_time: Duration::from_secs(60),
            max_requests_per_process: 1000,
            max_concurrent_per_process: 1,
            default_timeout: Duration::from_secs(30),
            load_balancing: LoadBalancing::default(),
        }
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    scheduler: Scheduler,
    workers: RwLock<Vec<Arc<Worker>>>,
    next_worker_id: AtomicU64,
    /// Instance-handle affinity table (spec §4.5): a handle is routed only to the worker that
    /// minted it, for the lifetime of that worker. Never rebinds a handle to a different worker.
    handle_owner: Mutex<HashMap<String, WorkerId>>,
    availability: Notify,
    disposed: std::sync::atomic::AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, spawner: Arc<dyn WorkerSpawner>) -> Arc<Self> {
        let scheduler = Scheduler::new(config.load_balancing);
        Arc::new(Self {
            config,
            spawner,
            scheduler,
            workers: RwLock::new(Vec::new()),
            next_worker_id: AtomicU64::new(1),
            handle_owner: Mutex::new(HashMap::new()),
            availability: Notify::new(),
            disposed: std::sync::atomic::AtomicBool::new(false),
            maintenance: Mutex::new(None),
        })
    }

    /// Spawns workers until `minProcesses` are live, then starts the background reaper. Call
    /// once after construction.
    pub async fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        self.ensure_min().await?;
        let handle = tokio::spawn(maintenance_loop(Arc::clone(self)));
        *self.maintenance.lock().await = Some(handle);
        Ok(())
    }

    async fn ensure_min(&self) -> Result<(), BridgeError> {
        loop {
            let live = self.workers.read().await.len();
            if live >= self.config.min_processes {
                return Ok(());
            }
            self.spawn_one().await?;
        }
    }

    async fn spawn_one(&self) -> Result<Arc<Worker>, BridgeError> {
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let worker = self.spawner.spawn(id).await?;
        info!(worker_id = id, "worker spawned and warmed up");
        self.workers.write().await.push(worker.clone());
        self.availability.notify_waiters();
        Ok(worker)
    }

    /// Picks an available worker, spawning a new one (up to `maxProcesses`) if none is free, or
    /// waiting for the next availability signal (queued FIFO by wake order) if the pool is
    /// already at capacity.
    async fn acquire(&self) -> Result<Arc<Worker>, BridgeError> {
        loop {
            if self.disposed.load(Ordering::SeqCst) {
                return Err(BridgeError::Disposed);
            }

            let snapshot = self.workers.read().await.clone();
            if let Some(worker) = self
                .scheduler
                .pick(&snapshot, self.config.max_concurrent_per_process)
                .await
            {
                return Ok(worker);
            }

            if snapshot.len() < self.config.max_processes {
                match self.spawn_one().await {
                    Ok(worker) => return Ok(worker),
                    Err(err) => return Err(err),
                }
            }

            // Pool is saturated: wait for the next completion/removal before retrying, per
            // spec's "queue the request and serve on next availability (FIFO)". The Notify's
            // own wake order approximates FIFO for waiters already parked.
            let notified = self.availability.notified();
            notified.await;
        }
    }

    /// `call`/`instantiate`: no handle affinity, any available worker will do.
    pub async fn call(&self, method: Method, params: Json, timeout: Option<Duration>) -> Result<Json, BridgeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        let worker = self.acquire().await?;
        let result = self.run_on_worker(&worker, method, params, timeout).await;
        if let Err(err) = &result {
            if err.is_fatal_to_worker() {
                self.quarantine(worker.id).await;
            }
        }
        result
    }

    /// `instantiate`: runs the call, then binds the returned handle to the worker that served
    /// it. The worker is never swapped out from under the handle afterward.
    pub async fn instantiate(
        &self,
        module: &str,
        class_name: &str,
        args: Json,
        kwargs: Option<Json>,
    ) -> Result<String, BridgeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        let worker = self.acquire().await?;
        let params = build_params(module, Some(class_name), args, kwargs, None);
        let result = self
            .run_on_worker(&worker, Method::Instantiate, params, None)
            .await;
        match result {
            Ok(value) => {
                let handle = value
                    .as_str()
                    .ok_or_else(|| BridgeError::protocol("instantiate result was not a handle string"))?
                    .to_string();
                worker.bind_handle(handle.clone()).await;
                self.handle_owner.lock().await.insert(handle.clone(), worker.id);
                Ok(handle)
            }
            Err(err) => {
                if err.is_fatal_to_worker() {
                    self.quarantine(worker.id).await;
                }
                Err(err)
            }
        }
    }

    /// `call_method`/`dispose_instance`: must route to the worker that owns `handle` (spec
    /// §4.5 handle affinity). A handle whose worker has died never resolves again.
    pub async fn call_on_handle(
        &self,
        handle: &str,
        method_name: &str,
        args: Json,
        kwargs: Option<Json>,
        timeout: Option<Duration>,
    ) -> Result<Json, BridgeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        let worker = self.worker_for_handle(handle).await?;
        let params = build_params("", None, args, kwargs, Some((handle, method_name)));
        let result = self
            .run_on_worker(&worker, Method::CallMethod, params, timeout)
            .await;
        if let Err(err) = &result {
            if err.is_fatal_to_worker() {
                self.quarantine(worker.id).await;
            }
        }
        result
    }

    /// Idempotent: disposing an unknown or already-disposed handle is a no-op (spec §4.5/E7).
    pub async fn dispose_instance(&self, handle: &str) -> Result<(), BridgeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        let owner_id = self.handle_owner.lock().await.remove(handle);
        let Some(owner_id) = owner_id else {
            return Ok(());
        };
        let Some(worker) = self.find_worker(owner_id).await else {
            return Ok(());
        };
        worker.unbind_handle(handle).await;

        let params = serde_json::json!({ "handle": handle });
        let result = worker
            .protocol
            .call(Method::DisposeInstance, params, self.config.default_timeout.into(), CancelToken::new())
            .await;
        if let Err(err) = result {
            if err.is_fatal_to_worker() {
                self.quarantine(worker.id).await;
            }
            // dispose_instance is best-effort once the handle is already forgotten locally;
            // a worker that's gone has already forgotten the instance too.
        }
        Ok(())
    }

    async fn worker_for_handle(&self, handle: &str) -> Result<Arc<Worker>, BridgeError> {
        let owner_id = *self
            .handle_owner
            .lock()
            .await
            .get(handle)
            .ok_or_else(|| BridgeError::instance_handle("Unknown instance handle"))?;
        let worker = self
            .find_worker(owner_id)
            .await
            .ok_or_else(|| BridgeError::instance_handle("Unknown instance handle"))?;
        if worker.state().await == WorkerState::Dead {
            self.handle_owner.lock().await.remove(handle);
            return Err(BridgeError::instance_handle("Unknown instance handle"));
        }
        Ok(worker)
    }

    async fn find_worker(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.workers.read().await.iter().find(|w| w.id == id).cloned()
    }

    async fn run_on_worker(
        &self,
        worker: &Arc<Worker>,
        method: Method,
        params: Json,
        timeout: Option<Duration>,
    ) -> Result<Json, BridgeError> {
        worker.begin_request().await;
        let started = std::time::Instant::now();
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let result = worker
            .protocol
            .call(method, params, Some(timeout), CancelToken::new())
            .await;
        worker.end_request(started.elapsed()).await;
        self.availability.notify_waiters();

        if worker.requests_served() >= self.config.max_requests_per_process {
            self.retire_if_drained(worker.id).await;
        }

        result
    }

    /// Marks a worker dead, fails nothing further (in-flight requests already failed via the
    /// transport's own crash path — see `subprocess::reader_task`), removes it from the live
    /// set and its handle bindings, and replenishes `minProcesses` if needed.
    async fn quarantine(&self, id: WorkerId) {
        let removed = {
            let mut workers = self.workers.write().await;
            if let Some(pos) = workers.iter().position(|w| w.id == id) {
                Some(workers.remove(pos))
            } else {
                None
            }
        };
        let Some(worker) = removed else { return };
        warn!(worker_id = id, "quarantining worker after fatal protocol error");
        worker.dispose().await;

        let mut owner = self.handle_owner.lock().await;
        owner.retain(|_, owner_id| *owner_id != id);
        drop(owner);

        self.availability.notify_waiters();
        if !self.disposed.load(Ordering::SeqCst) {
            let _ = self.ensure_min().await;
        }
    }

    /// Marks a worker draining once it crosses `maxRequestsPerProcess`, then retires it once
    /// in-flight work has drained to zero (spec §4.5).
    async fn retire_if_drained(&self, id: WorkerId) {
        let Some(worker) = self.find_worker(id).await else { return };
        worker.mark_draining().await;
        if worker.inflight() > 0 {
            return;
        }
        self.quarantine(id).await;
    }

    /// Background reaper: retires idle-too-long workers above `minProcesses` and workers
    /// observed dead. Runs for the pool's lifetime; aborted on [`Self::dispose`].
    async fn reap(&self) {
        let snapshot = self.workers.read().await.clone();
        for worker in snapshot {
            if worker.state().await == WorkerState::Dead {
                self.quarantine(worker.id).await;
                continue;
            }
            let live = self.workers.read().await.len();
            if live > self.config.min_processes
                && worker.inflight() == 0
                && worker.idle_time().await >= self.config.max_idle_time
            {
                info!(worker_id = worker.id, "retiring idle worker");
                self.quarantine(worker.id).await;
            }
        }
    }

    /// Graceful shutdown (spec §5): stop admitting new requests, drain in-flight work up to a
    /// grace period, then forcefully dispose every worker.
    pub async fn dispose(&self, grace_period: Duration) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
        }

        let workers = self.workers.read().await.clone();
        let deadline = tokio::time::Instant::now() + grace_period;
        for worker in &workers {
            worker.mark_draining().await;
        }
        while tokio::time::Instant::now() < deadline {
            let all_drained = {
                let mut drained = true;
                for worker in &workers {
                    if worker.inflight() > 0 {
                        drained = false;
                        break;
                    }
                }
                drained
            };
            if all_drained {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for worker in &workers {
            worker.dispose().await;
        }
        self.workers.write().await.clear();
        self.handle_owner.lock().await.clear();
        self.availability.notify_waiters();
    }

    pub async fn live_worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Used by `Bridge::getBridgeInfo`: any live worker will do, spawning one if the pool is
    /// currently empty.
    pub async fn any_worker(&self) -> Result<Arc<Worker>, BridgeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        if let Some(worker) = self.workers.read().await.first().cloned() {
            return Ok(worker);
        }
        self.spawn_one().await
    }
}

async fn maintenance_loop(pool: Arc<WorkerPool>) {
    let tick = std::cmp::max(pool.config.max_idle_time / 4, Duration::from_secs(1));
    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        pool.reap().await;
    }
}

fn build_params(
    module: &str,
    class_name: Option<&str>,
    args: Json,
    kwargs: Option<Json>,
    handle_and_method: Option<(&str, &str)>,
) -> Json {
    let mut map = serde_json::Map::new();
    if let Some((handle, method_name)) = handle_and_method {
        map.insert("handle".into(), Json::String(handle.to_string()));
        map.insert("methodName".into(), Json::String(method_name.to_string()));
    } else {
        map.insert("module".into(), Json::String(module.to_string()));
        if let Some(class_name) = class_name {
            map.insert("className".into(), Json::String(class_name.to_string()));
        }
    }
    map.insert("args".into(), args);
    if let Some(kwargs) = kwargs {
        map.insert("kwargs".into(), kwargs);
    }
    Json::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecOptions, SafeCodec};
    use crate::protocol::Protocol;
    use crate::transport::embedded::{EmbeddedDispatcher, EmbeddedLoader, EmbeddedTransport};
    use crate::transport::Transport;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    /// An embedded worker that answers `call`/`instantiate`/`call_method`/`dispose_instance`
    /// with a deterministic echo, so pool-level routing can be tested without a real subprocess.
    struct EchoDispatcher;

    #[async_trait]
    impl EmbeddedDispatcher for EchoDispatcher {
        async fn dispatch(&self, request: Vec<u8>) -> Result<Vec<u8>, BridgeError> {
            let req: Json = serde_json::from_slice(&request).unwrap();
            let id = req["id"].clone();
            let result = match req["method"].as_str().unwrap() {
                "instantiate" => Json::String(format!("handle-{}", id.as_u64().unwrap())),
                _ => Json::String("ok".into()),
            };
            Ok(serde_json::to_vec(&serde_json::json!({"id": id, "result": result})).unwrap())
        }
    }

    struct EmbeddedSpawner {
        counter: StdAtomicU64,
    }

    #[async_trait]
    impl WorkerSpawner for EmbeddedSpawner {
        async fn spawn(&self, id: WorkerId) -> Result<Arc<Worker>, BridgeError> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            struct Loader;
            #[async_trait]
            impl EmbeddedLoader for Loader {
                async fn load(&self) -> Result<Arc<dyn EmbeddedDispatcher>, BridgeError> {
                    Ok(Arc::new(EchoDispatcher))
                }
            }
            let transport: Arc<dyn Transport> = Arc::new(EmbeddedTransport::new(Arc::new(Loader)));
            transport.init().await?;
            let protocol = Protocol::new(
                transport.clone(),
                SafeCodec::new(CodecOptions::default()),
                Duration::from_secs(1),
            );
            let worker = Arc::new(Worker::new(id, protocol, transport));
            worker.mark_ready().await;
            Ok(worker)
        }
    }

    fn make_pool(min: usize, max: usize) -> Arc<WorkerPool> {
        let config = PoolConfig {
            min_processes: min,
            max_processes: max,
            ..PoolConfig::default()
        };
        WorkerPool::new(
            config,
            Arc::new(EmbeddedSpawner {
                counter: StdAtomicU64::new(0),
            }),
        )
    }

    #[tokio::test]
    async fn start_spawns_min_processes() {
        let pool = make_pool(2, 4);
        pool.start().await.unwrap();
        assert_eq!(pool.live_worker_count().await, 2);
    }

    #[tokio::test]
    async fn call_routes_through_some_worker() {
        let pool = make_pool(1, 2);
        pool.start().await.unwrap();
        let result = pool
            .call(Method::Call, serde_json::json!({"module": "m", "functionName": "f", "args": []}), None)
            .await
            .unwrap();
        assert_eq!(result, Json::String("ok".into()));
    }

    #[tokio::test]
    async fn instantiate_binds_handle_to_its_worker_and_call_method_routes_back() {
        let pool = make_pool(2, 2);
        pool.start().await.unwrap();
        let handle = pool
            .instantiate("builtins", "list", Json::Array(vec![]), None)
            .await
            .unwrap();
        let result = pool
            .call_on_handle(&handle, "append", serde_json::json!([1]), None, None)
            .await
            .unwrap();
        assert_eq!(result, Json::String("ok".into()));
    }

    #[tokio::test]
    async fn dispose_instance_is_idempotent() {
        let pool = make_pool(1, 1);
        pool.start().await.unwrap();
        let handle = pool
            .instantiate("builtins", "list", Json::Array(vec![]), None)
            .await
            .unwrap();
        pool.dispose_instance(&handle).await.unwrap();
        pool.dispose_instance(&handle).await.unwrap();

        let err = pool
            .call_on_handle(&handle, "append", serde_json::json!([1]), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InstanceHandle(_)));
    }

    #[tokio::test]
    async fn call_on_unknown_handle_is_instance_handle_error() {
        let pool = make_pool(1, 1);
        pool.start().await.unwrap();
        let err = pool
            .call_on_handle("bogus", "append", Json::Array(vec![]), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InstanceHandle(_)));
    }

    #[tokio::test]
    async fn dispose_drains_and_clears_workers() {
        let pool = make_pool(2, 2);
        pool.start().await.unwrap();
        pool.dispose(Duration::from_millis(100)).await;
        assert_eq!(pool.live_worker_count().await, 0);
    }
}
