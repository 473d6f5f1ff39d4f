//! Protocol: the correlation-id multiplexer layered over one [`Transport`].
//!
//! Assigns monotonically increasing ids, builds wire messages, decodes responses through
//! [`SafeCodec`], and caches `getBridgeInfo`. The lower-level per-physical-stream routing
//! (matching a stdout line back to the `send` call that's waiting on its id) lives in the
//! subprocess transport itself, since it is the only thing that can safely own reads off a
//! shared pipe; see `DESIGN.md` for why the spec's C3/C4 boundary is drawn there rather than
//! here. This layer owns id *assignment*, deadline application, envelope-level wire violations
//! (missing/duplicate id, both result+error), and response-to-call correlation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::Mutex;

use crate::codec::{DecodeError, Message, Method, SafeCodec};
use crate::error::{BridgeError, CodecError};
use crate::transport::{CancelToken, Transport};

/// Cached result of `getBridgeInfo` (spec §4.4/§6). Valid until an explicit `refresh` request;
/// no time-based expiry (see `SPEC_FULL.md`'s "Supplemented features").
#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub protocol: String,
    pub protocol_version: u32,
    pub bridge: String,
    pub python_version: String,
    pub pid: i64,
    pub arrow_available: bool,
}

pub struct Protocol {
    transport: Arc<dyn Transport>,
    codec: SafeCodec,
    next_id: AtomicU64,
    default_timeout: Duration,
    bridge_info: Mutex<Option<BridgeInfo>>,
}

impl Protocol {
    pub fn new(transport: Arc<dyn Transport>, codec: SafeCodec, default_timeout: Duration) -> Self {
        Self {
            transport,
            codec,
            next_id: AtomicU64::new(1),
            default_timeout,
            bridge_info: Mutex::new(None),
        }
    }

    pub async fn init(&self) -> Result<(), BridgeError> {
        self.transport.init().await
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Issues one request and returns its decoded `result`. Resolves or rejects exactly like
    /// the Response data model in spec §3: on success, `result`; on failure, a classified
    /// [`BridgeError`].
    pub async fn call(
        &self,
        method: Method,
        params: Json,
        timeout: Option<Duration>,
        cancel: CancelToken,
    ) -> Result<Json, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message::new(id, method, params);
        let bytes = self
            .codec
            .encode_request(&message)
            .map_err(classify_codec_error)?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let response_bytes = self.transport.send(bytes, timeout, cancel).await?;

        let decoded = self
            .codec
            .decode_response(&response_bytes)
            .map_err(classify_decode_error)?;

        if decoded.id != id {
            return Err(BridgeError::protocol_fatal(format!(
                "Unexpected response id {} (expected {id})",
                decoded.id
            )));
        }

        Ok(decoded.result)
    }

    /// `getBridgeInfo(refresh?)`: side-channel request targeting the worker's internal
    /// diagnostic function, cached until `refresh = true`.
    pub async fn bridge_info(&self, refresh: bool) -> Result<BridgeInfo, BridgeError> {
        if !refresh {
            if let Some(info) = self.bridge_info.lock().await.clone() {
                return Ok(info);
            }
        }

        let params = serde_json::json!({
            "module": "__tywrap__",
            "functionName": "bridge_info",
            "args": Json::Array(Vec::new()),
        });
        let result = self
            .call(Method::Call, params, None, CancelToken::new())
            .await?;
        let info = parse_bridge_info(&result)?;
        *self.bridge_info.lock().await = Some(info.clone());
        Ok(info)
    }

    pub async fn dispose(&self) {
        self.transport.dispose().await;
    }
}

/// Distinguishes envelope-shape wire violations (ProtocolError) from value-tree/size-limit
/// violations (CodecError) out of a single `SafeCodec` parse pass. See the module doc comment.
fn classify_codec_error(err: CodecError) -> BridgeError {
    match err.path.as_str() {
        // A missing/non-numeric id means the stream can no longer be correlated reliably —
        // spec §9's design note calls this out as a quarantine-worthy violation.
        "$.id" => BridgeError::protocol_fatal(err.message),
        "$" | "$.protocol" | "$.error" => BridgeError::protocol(err.message),
        _ => BridgeError::from(err),
    }
}

/// A decoded worker-side error envelope is a remote exception (`BridgeError::Execution`), not a
/// wire violation — everything else from [`SafeCodec::decode_response`] still goes through
/// [`classify_codec_error`]. See `DESIGN.md`'s resolution of the execution-vs-protocol boundary.
fn classify_decode_error(err: DecodeError) -> BridgeError {
    match err {
        DecodeError::Execution(payload) => BridgeError::Execution {
            type_name: payload.type_name,
            message: payload.message,
            traceback: payload.traceback,
        },
        DecodeError::Codec(err) => classify_codec_error(err),
    }
}

fn parse_bridge_info(value: &Json) -> Result<BridgeInfo, BridgeError> {
    let protocol = value
        .get("protocol")
        .and_then(Json::as_str)
        .ok_or_else(|| BridgeError::protocol("bridge info missing \"protocol\""))?
        .to_string();
    let protocol_version = value
        .get("protocolVersion")
        .and_then(Json::as_u64)
        .ok_or_else(|| BridgeError::protocol("bridge info missing \"protocolVersion\""))?
        as u32;
    let bridge = value
        .get("bridge")
        .and_then(Json::as_str)
        .ok_or_else(|| BridgeError::protocol("bridge info missing \"bridge\""))?
        .to_string();
    let python_version = value
        .get("pythonVersion")
        .and_then(Json::as_str)
        .ok_or_else(|| BridgeError::protocol("bridge info missing \"pythonVersion\""))?
        .to_string();
    let pid = value
        .get("pid")
        .and_then(Json::as_i64)
        .ok_or_else(|| BridgeError::protocol("bridge info missing \"pid\""))?;
    let arrow_available = value
        .get("arrowAvailable")
        .and_then(Json::as_bool)
        .unwrap_or(false);

    Ok(BridgeInfo {
        protocol,
        protocol_version,
        bridge,
        python_version,
        pid,
        arrow_available,
    })
}
