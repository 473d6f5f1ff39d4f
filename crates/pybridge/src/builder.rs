//! `BridgeConfig`/`BridgeBuilder`: the host-facing construction surface (spec §6).
//!
//! Mirrors the teacher's `ClaudeClientBuilder`/`CodexClientBuilder` pair: a plain `Default`-able
//! config struct (also `serde::Deserialize` so a host already loading TOML/JSON config can feed
//! pool sizing straight in) plus a fluent builder that resolves the worker executable and wires
//! up the pool before handing back a ready [`crate::bridge::Bridge`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;
use tracing::warn;

use crate::bridge::Bridge;
use crate::codec::{CodecOptions, Method, SafeCodec};
use crate::env::{ProcessEnvInputs, ResolvedProcessEnv};
use crate::error::BridgeError;
use crate::pool::worker::{Worker, WorkerId};
use crate::pool::{LoadBalancing, PoolConfig, WorkerPool, WorkerSpawner};
use crate::protocol::Protocol;
use crate::transport::subprocess::{SubprocessSpec, SubprocessTransport};
use crate::transport::{CancelToken, Transport};

/// One `warmupCommands[]` entry (spec §4.5): a `call` issued on each worker right after `init`
/// succeeds, before it is marked ready for host traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupCommand {
    pub module: String,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<Json>,
}

impl WarmupCommand {
    pub fn new(module: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function_name: function_name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Json>) -> Self {
        self.args = args;
        self
    }

    /// Rejects the legacy `{method, params}` warm-up shape at construction time with a clear
    /// error, per spec §4.5, rather than letting it fail silently or with a generic parse error.
    fn from_json(value: &Json) -> Result<Self, String> {
        if value.get("method").is_some() || value.get("params").is_some() {
            return Err(
                "warmupCommands entry uses the legacy { method, params } shape; use \
                 { module, functionName, args } instead"
                    .to_string(),
            );
        }
        let module = value
            .get("module")
            .and_then(Json::as_str)
            .ok_or("warmupCommands entry missing \"module\"")?
            .to_string();
        let function_name = value
            .get("functionName")
            .and_then(Json::as_str)
            .ok_or("warmupCommands entry missing \"functionName\"")?
            .to_string();
        let args = value
            .get("args")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            module,
            function_name,
            args,
        })
    }
}

fn deserialize_warmup_commands<'de, D>(deserializer: D) -> Result<Vec<WarmupCommand>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Json> = Vec::deserialize(deserializer)?;
    raw.iter()
        .map(|item| WarmupCommand::from_json(item).map_err(serde::de::Error::custom))
        .collect()
}

/// Host-side bridge construction options (spec §6). `Default` matches spec defaults where one
/// is stated; otherwise see `SPEC_FULL.md`'s "Supplemented features" / `DESIGN.md` for the
/// chosen value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub min_processes: usize,
    pub max_processes: usize,
    pub max_idle_time_ms: u64,
    pub max_requests_per_process: u64,
    pub max_concurrent_per_process: usize,
    pub timeout_ms: u64,
    /// Forwarded to the worker as `TYWRAP_JSON_FALLBACK=1` (see `DESIGN.md`'s Open Question
    /// resolution): asks the worker to prefer inline JSON array encoding over Arrow even when
    /// Arrow is available, for hosts that haven't registered an Arrow decoder.
    pub enable_json_fallback: bool,
    pub python_path: Option<PathBuf>,
    pub virtual_env: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub script_path: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_warmup_commands")]
    pub warmup_commands: Vec<WarmupCommand>,
    pub load_balancing: LoadBalancing,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            min_processes: 1,
            max_processes: 4,
            max_idle_time_ms: 60_000,
            max_requests_per_process: 1_000,
            max_concurrent_per_process: 1,
            timeout_ms: 30_000,
            enable_json_fallback: false,
            python_path: None,
            virtual_env: None,
            cwd: None,
            env: BTreeMap::new(),
            script_path: None,
            warmup_commands: Vec::new(),
            load_balancing: LoadBalancing::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BridgeBuilder {
    config: BridgeConfig,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_processes(mut self, value: usize) -> Self {
        self.config.min_processes = value;
        self
    }

    pub fn max_processes(mut self, value: usize) -> Self {
        self.config.max_processes = value;
        self
    }

    pub fn max_idle_time(mut self, value: Duration) -> Self {
        self.config.max_idle_time_ms = value.as_millis() as u64;
        self
    }

    pub fn max_requests_per_process(mut self, value: u64) -> Self {
        self.config.max_requests_per_process = value;
        self
    }

    pub fn max_concurrent_per_process(mut self, value: usize) -> Self {
        self.config.max_concurrent_per_process = value;
        self
    }

    pub fn timeout(mut self, value: Duration) -> Self {
        self.config.timeout_ms = value.as_millis() as u64;
        self
    }

    pub fn enable_json_fallback(mut self, value: bool) -> Self {
        self.config.enable_json_fallback = value;
        self
    }

    pub fn python_path(mut self, value: impl Into<PathBuf>) -> Self {
        self.config.python_path = Some(value.into());
        self
    }

    pub fn virtual_env(mut self, value: impl Into<PathBuf>) -> Self {
        self.config.virtual_env = Some(value.into());
        self
    }

    pub fn cwd(mut self, value: impl Into<PathBuf>) -> Self {
        self.config.cwd = Some(value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    pub fn script_path(mut self, value: impl Into<PathBuf>) -> Self {
        self.config.script_path = Some(value.into());
        self
    }

    pub fn warmup_command(mut self, command: WarmupCommand) -> Self {
        self.config.warmup_commands.push(command);
        self
    }

    pub fn load_balancing(mut self, strategy: LoadBalancing) -> Self {
        self.config.load_balancing = strategy;
        self
    }

    /// Applies a config loaded by the host (e.g. from TOML/JSON) wholesale, overriding any
    /// fluent calls made so far.
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolves the worker executable, wires a [`SubprocessWorkerSpawner`], starts the pool up
    /// to `minProcesses`, and returns a ready [`Bridge`].
    pub async fn build(self) -> Result<Bridge, BridgeError> {
        let config = self.config;
        if config.min_processes > config.max_processes {
            return Err(BridgeError::Config(format!(
                "minProcesses ({}) must be <= maxProcesses ({})",
                config.min_processes, config.max_processes
            )));
        }
        if config.min_processes == 0 {
            warn!("minProcesses is 0: the pool starts with no warm workers");
        }

        let env_inputs = ProcessEnvInputs {
            python_path: config.python_path.clone(),
            virtual_env: config.virtual_env.clone(),
            cwd: config.cwd.clone(),
            env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let mut resolved = ResolvedProcessEnv::resolve(&env_inputs);
        if config.enable_json_fallback {
            resolved
                .env
                .push(("TYWRAP_JSON_FALLBACK".to_string(), "1".to_string()));
        }

        let mut spec = SubprocessSpec::new(resolved.executable.clone());
        spec.cwd = resolved.cwd.clone();
        spec.env = resolved.env.clone();
        if let Some(script_path) = &config.script_path {
            spec.args.push(script_path.display().to_string());
        }

        let codec = SafeCodec::new(CodecOptions::default());
        let default_timeout = Duration::from_millis(config.timeout_ms);

        let spawner = Arc::new(SubprocessWorkerSpawner {
            spec,
            codec: codec.clone(),
            default_timeout,
            warmup_commands: config.warmup_commands.clone(),
        });

        let pool_config = PoolConfig {
            min_processes: config.min_processes,
            max_processes: config.max_processes,
            max_idle_time: Duration::from_millis(config.max_idle_time_ms),
            max_requests_per_process: config.max_requests_per_process,
            max_concurrent_per_process: config.max_concurrent_per_process,
            default_timeout,
            load_balancing: config.load_balancing,
        };

        let pool = WorkerPool::new(pool_config, spawner);
        pool.start().await?;

        Ok(Bridge::from_pool(pool))
    }
}

/// Spawns a fresh [`SubprocessTransport`] per worker and runs `warmupCommands` on it before
/// the pool marks the worker ready for host traffic.
struct SubprocessWorkerSpawner {
    spec: SubprocessSpec,
    codec: SafeCodec,
    default_timeout: Duration,
    warmup_commands: Vec<WarmupCommand>,
}

#[async_trait]
impl WorkerSpawner for SubprocessWorkerSpawner {
    async fn spawn(&self, id: WorkerId) -> Result<Arc<Worker>, BridgeError> {
        let transport: Arc<dyn Transport> = Arc::new(SubprocessTransport::new(self.spec.clone()));
        transport.init().await?;

        let protocol = Protocol::new(transport.clone(), self.codec.clone(), self.default_timeout);
        let worker = Arc::new(Worker::new(id, protocol, transport));

        for command in &self.warmup_commands {
            let params = serde_json::json!({
                "module": command.module,
                "functionName": command.function_name,
                "args": command.args,
            });
            worker
                .protocol
                .call(Method::Call, params, Some(self.default_timeout), CancelToken::new())
                .await?;
        }

        worker.mark_ready().await;
        Ok(worker)
    }
}
