//! Bridge façade (spec §4.6): the single host-facing object. Owns the pool, validates inputs
//! before any codec work, and becomes permanently [`BridgeError::Disposed`] after `dispose`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;

use crate::codec::{Method, SafeCodec, Value};
use crate::error::BridgeError;
use crate::pool::WorkerPool;
use crate::protocol::BridgeInfo;

/// Grace period [`Bridge::dispose`] gives in-flight requests to drain before forcing workers
/// down (spec §5).
const DEFAULT_DISPOSE_GRACE: Duration = Duration::from_secs(5);

/// Single host-facing object exposing `call`/`instantiate`/`callMethod`/`disposeInstance`/
/// `getBridgeInfo`/`dispose`. Construct one with [`crate::builder::BridgeBuilder`].
pub struct Bridge {
    pool: Arc<WorkerPool>,
    codec: SafeCodec,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Bridge {
    pub(crate) fn from_pool(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            codec: SafeCodec::default(),
            disposed: AtomicBool::new(false),
        }
    }

    fn check_disposed(&self) -> Result<(), BridgeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        Ok(())
    }

    /// `call(module, functionName, args, kwargs?) → T`.
    pub async fn call(
        &self,
        module: &str,
        function_name: &str,
        args: Vec<Value>,
        kwargs: Option<Vec<(String, Value)>>,
    ) -> Result<Json, BridgeError> {
        self.check_disposed()?;
        validate_name(module, "Missing module")?;
        validate_name(function_name, "Missing functionName")?;

        let encoded_args = self.encode_args(args)?;
        let encoded_kwargs = self.encode_kwargs(kwargs)?;

        let mut params = serde_json::Map::new();
        params.insert("module".into(), Json::String(module.to_string()));
        params.insert("functionName".into(), Json::String(function_name.to_string()));
        params.insert("args".into(), encoded_args);
        if let Some(kwargs) = encoded_kwargs {
            params.insert("kwargs".into(), kwargs);
        }
        self.pool.call(Method::Call, Json::Object(params), None).await
    }

    /// `instantiate(module, className, args, kwargs?) → Handle`.
    pub async fn instantiate(
        &self,
        module: &str,
        class_name: &str,
        args: Vec<Value>,
        kwargs: Option<Vec<(String, Value)>>,
    ) -> Result<String, BridgeError> {
        self.check_disposed()?;
        validate_name(module, "Missing module")?;
        validate_name(class_name, "Missing className")?;

        let encoded_args = self.encode_args(args)?;
        let encoded_kwargs = self.encode_kwargs(kwargs)?;
        self.pool
            .instantiate(module, class_name, encoded_args, encoded_kwargs)
            .await
    }

    /// `callMethod(handle, name, args, kwargs?) → T`.
    pub async fn call_method(
        &self,
        handle: &str,
        method_name: &str,
        args: Vec<Value>,
        kwargs: Option<Vec<(String, Value)>>,
    ) -> Result<Json, BridgeError> {
        self.check_disposed()?;
        validate_name(method_name, "Missing methodName")?;

        let encoded_args = self.encode_args(args)?;
        let encoded_kwargs = self.encode_kwargs(kwargs)?;
        self.pool
            .call_on_handle(handle, method_name, encoded_args, encoded_kwargs, None)
            .await
    }

    /// `disposeInstance(handle) → void`. Idempotent (spec E7/§4.5).
    pub async fn dispose_instance(&self, handle: &str) -> Result<(), BridgeError> {
        self.check_disposed()?;
        self.pool.dispose_instance(handle).await
    }

    /// `getBridgeInfo() → Info`, cached by [`crate::protocol::Protocol`] until `refresh`.
    pub async fn get_bridge_info(&self, refresh: bool) -> Result<BridgeInfo, BridgeError> {
        self.check_disposed()?;
        let worker = self.pool.any_worker().await?;
        worker.protocol.bridge_info(refresh).await
    }

    /// Stops admitting new requests, drains in-flight work up to a grace period, then forces
    /// every worker down. Idempotent (spec E8/§5).
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.dispose(DEFAULT_DISPOSE_GRACE).await;
    }

    fn encode_args(&self, args: Vec<Value>) -> Result<Json, BridgeError> {
        let mut encoded = Vec::with_capacity(args.len());
        for (idx, arg) in args.into_iter().enumerate() {
            let json = self
                .codec
                .encode_value(&arg)
                .map_err(|mut err| {
                    err.path = format!("args[{idx}]{}", err.path.strip_prefix('$').unwrap_or(""));
                    BridgeError::from(err)
                })?;
            encoded.push(json);
        }
        Ok(Json::Array(encoded))
    }

    fn encode_kwargs(&self, kwargs: Option<Vec<(String, Value)>>) -> Result<Option<Json>, BridgeError> {
        let Some(kwargs) = kwargs else {
            return Ok(None);
        };
        let mut map = serde_json::Map::with_capacity(kwargs.len());
        for (key, value) in kwargs {
            let json = self
                .codec
                .encode_value(&value)
                .map_err(|mut err| {
                    err.path = format!("kwargs.{key}{}", err.path.strip_prefix('$').unwrap_or(""));
                    BridgeError::from(err)
                })?;
            map.insert(key, json);
        }
        Ok(Some(Json::Object(map)))
    }
}

/// Bridge façade input guardrail (spec §4.6): applied before any codec work for every
/// module/function/class/method name the host supplies.
fn validate_name(value: &str, message: &str) -> Result<(), BridgeError> {
    if value.trim().is_empty() {
        return Err(BridgeError::protocol(message));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::worker::{Worker, WorkerId};
    use crate::pool::{PoolConfig, WorkerSpawner};
    use crate::protocol::Protocol;
    use crate::transport::embedded::{EmbeddedDispatcher, EmbeddedLoader, EmbeddedTransport};
    use crate::transport::Transport;
    use async_trait::async_trait;

    struct EchoDispatcher;
    #[async_trait]
    impl EmbeddedDispatcher for EchoDispatcher {
        async fn dispatch(&self, request: Vec<u8>) -> Result<Vec<u8>, BridgeError> {
            let req: Json = serde_json::from_slice(&request).unwrap();
            let id = req["id"].clone();
            let method = req["method"].as_str().unwrap();
            let result = if method == "call"
                && req["params"]["functionName"].as_str() == Some("sqrt")
                && req["params"]["args"][0].as_f64() == Some(-1.0)
            {
                return Ok(serde_json::to_vec(&serde_json::json!({
                    "id": id,
                    "error": {"type": "ValueError", "message": "math domain error"}
                }))
                .unwrap());
            } else if method == "call" {
                serde_json::json!(4)
            } else {
                Json::String("ok".into())
            };
            Ok(serde_json::to_vec(&serde_json::json!({"id": id, "result": result})).unwrap())
        }
    }

    struct EmbeddedSpawner;
    #[async_trait]
    impl WorkerSpawner for EmbeddedSpawner {
        async fn spawn(&self, id: WorkerId) -> Result<Arc<Worker>, BridgeError> {
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
                SafeCodec::new(Default::default()),
                Duration::from_secs(1),
            );
            let worker = Arc::new(Worker::new(id, protocol, transport));
            worker.mark_ready().await;
            Ok(worker)
        }
    }

    async fn make_bridge() -> Bridge {
        let pool = WorkerPool::new(PoolConfig::default(), Arc::new(EmbeddedSpawner));
        pool.start().await.unwrap();
        Bridge::from_pool(pool)
    }

    #[tokio::test]
    async fn call_returns_decoded_result() {
        let bridge = make_bridge().await;
        let result = bridge
            .call("math", "sqrt", vec![Value::Int(16)], None)
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(4));
    }

    #[tokio::test]
    async fn call_surfaces_execution_error_for_remote_exception() {
        let bridge = make_bridge().await;
        let err = bridge
            .call("math", "sqrt", vec![Value::Float(-1.0)], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ValueError"));
    }

    #[tokio::test]
    async fn call_rejects_missing_module() {
        let bridge = make_bridge().await;
        let err = bridge.call("", "sqrt", vec![], None).await.unwrap_err();
        assert!(err.to_string().contains("Missing module"));
    }

    #[tokio::test]
    async fn call_rejects_missing_function_name() {
        let bridge = make_bridge().await;
        let err = bridge.call("math", "", vec![], None).await.unwrap_err();
        assert!(err.to_string().contains("Missing functionName"));
    }

    #[tokio::test]
    async fn instance_lifecycle_round_trips() {
        let bridge = make_bridge().await;
        let handle = bridge
            .instantiate("builtins", "list", vec![], None)
            .await
            .unwrap();
        bridge.dispose_instance(&handle).await.unwrap();
        let err = bridge
            .call_method(&handle, "append", vec![Value::Int(1)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InstanceHandle(_)));
        // disposing twice is a no-op
        bridge.dispose_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn dispose_rejects_further_calls() {
        let bridge = make_bridge().await;
        bridge.dispose().await;
        bridge.dispose().await; // idempotent
        let err = bridge.call("math", "sqrt", vec![], None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Disposed));
    }
}
