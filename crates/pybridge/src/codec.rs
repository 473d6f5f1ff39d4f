//! SafeCodec: the only layer that understands *values* crossing the host/worker boundary.
//!
//! Encoding walks a host-native [`Value`] tree once and either produces a wire-safe JSON
//! payload or rejects with a [`CodecError`] carrying a JSON-pointer-like path. Decoding parses
//! worker responses, enforces size limits, and recursively resolves tagged [`Envelope`] values
//! (binary, ndarray/dataframe/series, tensors, sparse matrices, estimators).

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value as Json};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::CodecError;

/// Wire protocol discriminator. See spec §3/§6.
pub const PROTOCOL_VERSION: &str = "tywrap/1";

/// Current envelope codec version understood by this crate.
pub const CODEC_VERSION: u32 = 1;

/// Default cap on serialized request/response size (10 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// How [`SafeCodec::encode_request`] treats binary data in the value tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BytesHandling {
    /// Binary values are rejected outright.
    Reject,
    /// Binary values are wrapped as a `bytes` envelope (`{"__tywrap_bytes__": true, "b64": ...}`).
    #[default]
    Base64,
    /// Binary values are emitted as-is. Migration-only; the resulting JSON is typically
    /// meaningless to a JSON-only reader.
    Passthrough,
}

/// Options governing [`SafeCodec`] behavior. Defaults match spec §4.1.
#[derive(Debug, Clone)]
pub struct CodecOptions {
    pub reject_special_floats: bool,
    pub bytes_handling: BytesHandling,
    pub max_payload_bytes: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            reject_special_floats: true,
            bytes_handling: BytesHandling::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Host-native value tree that crosses the bridge boundary.
///
/// `Map` keys are always `String` because Rust's type system rules out the
/// non-string-key case spec.md worries about (symbolic/compound object keys);
/// see DESIGN.md for this Open Question's resolution. There is likewise no
/// way to construct a cyclic `Value` without interior mutability, so the
/// circular-reference check from spec §4.1 has no runtime counterpart here.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
    Envelope(Envelope),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Encoding used by an array-shaped envelope payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Arrow,
    NdArray,
}

/// Tagged envelope identifying a value that needs post-decode interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Bytes {
        codec_version: u32,
        b64: String,
    },
    NdArray(ArrayEnvelope),
    DataFrame(ArrayEnvelope),
    Series(ArrayEnvelope),
    Tensor {
        codec_version: u32,
        data: Box<Value>,
        shape: Vec<u64>,
        dtype: Option<String>,
        device: Option<String>,
    },
    Sparse(SparseEnvelope),
    Estimator {
        codec_version: u32,
        class_name: String,
        module: String,
        version: String,
        params: Json,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayEnvelope {
    pub codec_version: u32,
    pub encoding: Encoding,
    /// Inline JSON payload, present when `encoding == Json`.
    pub data: Option<Json>,
    /// Base64 payload, present when `encoding` is `Arrow` or `NdArray`.
    pub b64: Option<String>,
    pub shape: Option<Vec<u64>>,
    pub dtype: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseFormat {
    Csr,
    Csc,
    Coo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SparseEnvelope {
    pub codec_version: u32,
    pub format: SparseFormat,
    pub shape: (u64, u64),
    pub data: Option<Json>,
    pub indices: Option<Json>,
    pub indptr: Option<Json>,
    pub row: Option<Json>,
    pub col: Option<Json>,
}

/// Registered hook for decoding Arrow-encoded envelope payloads synchronously.
pub trait ArrowDecoder: Send + Sync {
    fn decode(&self, tag: &str, envelope: &ArrayEnvelope) -> Result<Json, CodecError>;
}

/// Registered hook for decoding Arrow-encoded envelope payloads asynchronously.
#[async_trait]
pub trait AsyncArrowDecoder: Send + Sync {
    async fn decode(&self, tag: &str, envelope: &ArrayEnvelope) -> Result<Json, CodecError>;
}

static SYNC_ARROW_DECODER: OnceLock<AsyncMutex<Option<Arc<dyn ArrowDecoder>>>> = OnceLock::new();
static ASYNC_ARROW_DECODER: OnceLock<AsyncMutex<Option<Arc<dyn AsyncArrowDecoder>>>> =
    OnceLock::new();

fn sync_slot() -> &'static AsyncMutex<Option<Arc<dyn ArrowDecoder>>> {
    SYNC_ARROW_DECODER.get_or_init(|| AsyncMutex::new(None))
}

fn async_slot() -> &'static AsyncMutex<Option<Arc<dyn AsyncArrowDecoder>>> {
    ASYNC_ARROW_DECODER.get_or_init(|| AsyncMutex::new(None))
}

/// Registers the process-wide synchronous Arrow decoder. Must be called before any call that
/// might return an Arrow-encoded envelope (spec §9).
pub async fn register_arrow_decoder(decoder: Arc<dyn ArrowDecoder>) {
    *sync_slot().lock().await = Some(decoder);
}

/// Registers the process-wide asynchronous Arrow decoder.
pub async fn register_async_arrow_decoder(decoder: Arc<dyn AsyncArrowDecoder>) {
    *async_slot().lock().await = Some(decoder);
}

pub async fn clear_arrow_decoder() {
    *sync_slot().lock().await = None;
    *async_slot().lock().await = None;
}

pub async fn has_arrow_decoder() -> bool {
    sync_slot().lock().await.is_some() || async_slot().lock().await.is_some()
}

/// Method carried by a [`Message`]. See spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Call,
    Instantiate,
    CallMethod,
    DisposeInstance,
}

/// A host-to-worker request line (spec §3/§6).
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: u64,
    pub protocol: &'static str,
    pub method: Method,
    pub params: Json,
}

impl Message {
    pub fn new(id: u64, method: Method, params: Json) -> Self {
        Self {
            id,
            protocol: PROTOCOL_VERSION,
            method,
            params,
        }
    }
}

/// Error object carried by a worker response (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub type_name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Raw shape of a worker-to-host response line before envelope decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct RawResponse {
    pub id: Option<Json>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub result: Option<Json>,
    #[serde(default)]
    pub error: Option<Json>,
}

/// Successfully decoded response, post envelope resolution.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub id: u64,
    pub result: Json,
}

/// Outcome of [`SafeCodec::decode_response`]/`decode_response_async` other than success.
///
/// A well-formed error envelope (spec §3: `{type, message, traceback?}`) is a worker-side
/// exception, not a wire violation — it carries the remote exception class through as
/// [`DecodeError::Execution`] so [`crate::protocol::Protocol`] can surface it as
/// `BridgeError::Execution` (spec §4.1/§7) instead of collapsing it into a `ProtocolError`.
/// Anything else wrong with the bytes (size, JSON, framing-adjacent id/protocol checks,
/// malformed error object, envelope decode failures) is [`DecodeError::Codec`].
#[derive(Debug, Clone)]
pub enum DecodeError {
    Codec(CodecError),
    Execution(ErrorPayload),
}

impl From<CodecError> for DecodeError {
    fn from(err: CodecError) -> Self {
        DecodeError::Codec(err)
    }
}

/// Stateless encoder/decoder for values crossing the bridge boundary.
#[derive(Debug, Clone, Default)]
pub struct SafeCodec {
    pub options: CodecOptions,
}

impl SafeCodec {
    pub fn new(options: CodecOptions) -> Self {
        Self { options }
    }

    /// Encodes a full request [`Message`] to wire bytes, validating the `params` value tree.
    pub fn encode_request(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let bytes = serde_json::to_vec(message)
            .map_err(|err| CodecError::new("$", format!("failed to serialize message: {err}")))?;
        if bytes.len() > self.options.max_payload_bytes {
            return Err(CodecError::new(
                "$",
                format!(
                    "serialized request ({} bytes) exceeds maxPayloadBytes ({})",
                    bytes.len(),
                    self.options.max_payload_bytes
                ),
            ));
        }
        Ok(bytes)
    }

    /// Validates and converts a host [`Value`] into wire JSON, honoring `CodecOptions`.
    /// This is the entry point callers should run `args`/`kwargs` through before building a
    /// [`Message`]; `encode_request` only re-checks total payload size.
    pub fn encode_value(&self, value: &Value) -> Result<Json, CodecError> {
        self.encode_value_at(value, "$")
    }

    fn encode_value_at(&self, value: &Value, path: &str) -> Result<Json, CodecError> {
        match value {
            Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Int(i) => Ok(Json::Number((*i).into())),
            Value::Float(f) => {
                if !f.is_finite() && self.options.reject_special_floats {
                    return Err(CodecError::new(
                        path,
                        format!("non-finite float {f} is not representable in JSON"),
                    ));
                }
                match Number::from_f64(*f) {
                    Some(num) => Ok(Json::Number(num)),
                    None => Ok(Json::Null),
                }
            }
            Value::Str(s) => Ok(Json::String(s.clone())),
            Value::Bytes(raw) => self.encode_bytes(raw, path),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    out.push(self.encode_value_at(item, &format!("{path}[{idx}]"))?);
                }
                Ok(Json::Array(out))
            }
            Value::Map(entries) => {
                let mut map = JsonMap::with_capacity(entries.len());
                for (key, val) in entries {
                    let child_path = format!("{path}.{key}");
                    map.insert(key.clone(), self.encode_value_at(val, &child_path)?);
                }
                Ok(Json::Object(map))
            }
            Value::Envelope(envelope) => self.encode_envelope(envelope, path),
        }
    }

    fn encode_bytes(&self, raw: &[u8], path: &str) -> Result<Json, CodecError> {
        match self.options.bytes_handling {
            BytesHandling::Reject => Err(CodecError::new(
                path,
                "binary data is not permitted (bytesHandling = reject)",
            )),
            BytesHandling::Base64 => {
                let mut map = JsonMap::with_capacity(2);
                map.insert("__tywrap_bytes__".into(), Json::Bool(true));
                map.insert("b64".into(), Json::String(BASE64.encode(raw)));
                Ok(Json::Object(map))
            }
            BytesHandling::Passthrough => Ok(Json::String(
                String::from_utf8_lossy(raw).into_owned(),
            )),
        }
    }

    fn encode_envelope(&self, envelope: &Envelope, path: &str) -> Result<Json, CodecError> {
        let json = match envelope {
            Envelope::Bytes { codec_version, b64 } => serde_json::json!({
                "__tywrap_bytes__": true,
                "codecVersion": codec_version,
                "b64": b64,
            }),
            Envelope::NdArray(arr) => tagged_array_json("ndarray", arr),
            Envelope::DataFrame(arr) => tagged_array_json("dataframe", arr),
            Envelope::Series(arr) => tagged_array_json("series", arr),
            Envelope::Tensor {
                codec_version,
                data,
                shape,
                dtype,
                device,
            } => serde_json::json!({
                "__tywrap_type__": "torch.tensor",
                "codecVersion": codec_version,
                "encoding": "ndarray",
                "data": self.encode_value_at(data, &format!("{path}.data"))?,
                "shape": shape,
                "dtype": dtype,
                "device": device,
            }),
            Envelope::Sparse(sparse) => tagged_sparse_json(sparse),
            Envelope::Estimator {
                codec_version,
                class_name,
                module,
                version,
                params,
            } => serde_json::json!({
                "__tywrap_type__": "sklearn.estimator",
                "codecVersion": codec_version,
                "className": class_name,
                "module": module,
                "version": version,
                "params": params,
            }),
        };
        Ok(json)
    }

    /// Parses and decodes a worker response line, resolving envelopes synchronously.
    pub fn decode_response(&self, bytes: &[u8]) -> Result<DecodedResponse, DecodeError> {
        if bytes.len() > self.options.max_payload_bytes {
            return Err(CodecError::new(
                "$",
                format!(
                    "response ({} bytes) exceeds maxPayloadBytes ({})",
                    bytes.len(),
                    self.options.max_payload_bytes
                ),
            )
            .into());
        }

        let raw: RawResponse = serde_json::from_slice(bytes)
            .map_err(|err| CodecError::new("$", format!("invalid JSON: {err}")))?;

        let id = parse_response_id(&raw)?;

        if let Some(protocol) = &raw.protocol {
            if protocol != PROTOCOL_VERSION {
                return Err(CodecError::new(
                    "$.protocol",
                    format!("unexpected protocol `{protocol}`, expected `{PROTOCOL_VERSION}`"),
                )
                .into());
            }
        }

        match (raw.result, raw.error) {
            (Some(_), Some(_)) => Err(CodecError::new(
                "$",
                "response carries both `result` and `error`",
            )
            .into()),
            (None, Some(error_json)) => {
                let error: ErrorPayload = serde_json::from_value(error_json).map_err(|err| {
                    CodecError::new("$.error", format!("malformed error object: {err}"))
                })?;
                Err(DecodeError::Execution(error))
            }
            (Some(result), None) => {
                let decoded = decode_value_sync(result, "$.result")?;
                Ok(DecodedResponse { id, result: decoded })
            }
            (None, None) => Ok(DecodedResponse {
                id,
                result: Json::Null,
            }),
        }
    }

    /// Like [`Self::decode_response`] but resolves Arrow envelopes through the registered
    /// async decoder when one is present, falling back to the sync decoder otherwise. Must
    /// agree with [`Self::decode_response`] on any input containing no Arrow envelopes.
    pub async fn decode_response_async(&self, bytes: &[u8]) -> Result<DecodedResponse, DecodeError> {
        if bytes.len() > self.options.max_payload_bytes {
            return Err(CodecError::new(
                "$",
                format!(
                    "response ({} bytes) exceeds maxPayloadBytes ({})",
                    bytes.len(),
                    self.options.max_payload_bytes
                ),
            )
            .into());
        }

        let raw: RawResponse = serde_json::from_slice(bytes)
            .map_err(|err| CodecError::new("$", format!("invalid JSON: {err}")))?;
        let id = parse_response_id(&raw)?;

        if let Some(protocol) = &raw.protocol {
            if protocol != PROTOCOL_VERSION {
                return Err(CodecError::new(
                    "$.protocol",
                    format!("unexpected protocol `{protocol}`, expected `{PROTOCOL_VERSION}`"),
                )
                .into());
            }
        }

        match (raw.result, raw.error) {
            (Some(_), Some(_)) => Err(CodecError::new(
                "$",
                "response carries both `result` and `error`",
            )
            .into()),
            (None, Some(error_json)) => {
                let error: ErrorPayload = serde_json::from_value(error_json).map_err(|err| {
                    CodecError::new("$.error", format!("malformed error object: {err}"))
                })?;
                Err(DecodeError::Execution(error))
            }
            (Some(result), None) => {
                let decoded = decode_value_async(result, "$.result").await?;
                Ok(DecodedResponse { id, result: decoded })
            }
            (None, None) => Ok(DecodedResponse {
                id,
                result: Json::Null,
            }),
        }
    }
}

fn parse_response_id(raw: &RawResponse) -> Result<u64, CodecError> {
    match &raw.id {
        Some(Json::Number(num)) if num.is_u64() => Ok(num.as_u64().unwrap()),
        Some(_) => Err(CodecError::new("$.id", "response `id` is not a non-negative integer")),
        None => Err(CodecError::new("$.id", "response missing \"id\"")),
    }
}

fn tagged_array_json(tag: &str, arr: &ArrayEnvelope) -> Json {
    let encoding = match arr.encoding {
        Encoding::Json => "json",
        Encoding::Arrow => "arrow",
        Encoding::NdArray => "ndarray",
    };
    let mut map = JsonMap::new();
    map.insert("__tywrap_type__".into(), Json::String(tag.into()));
    map.insert("codecVersion".into(), Json::Number(arr.codec_version.into()));
    map.insert("encoding".into(), Json::String(encoding.into()));
    if let Some(data) = &arr.data {
        map.insert("data".into(), data.clone());
    }
    if let Some(b64) = &arr.b64 {
        map.insert("b64".into(), Json::String(b64.clone()));
    }
    if let Some(shape) = &arr.shape {
        map.insert("shape".into(), serde_json::json!(shape));
    }
    if let Some(dtype) = &arr.dtype {
        map.insert("dtype".into(), Json::String(dtype.clone()));
    }
    Json::Object(map)
}

fn tagged_sparse_json(sparse: &SparseEnvelope) -> Json {
    let format = match sparse.format {
        SparseFormat::Csr => "csr",
        SparseFormat::Csc => "csc",
        SparseFormat::Coo => "coo",
    };
    let mut map = JsonMap::new();
    map.insert("__tywrap_type__".into(), Json::String("scipy.sparse".into()));
    map.insert("codecVersion".into(), Json::Number(sparse.codec_version.into()));
    map.insert("format".into(), Json::String(format.into()));
    map.insert(
        "shape".into(),
        serde_json::json!([sparse.shape.0, sparse.shape.1]),
    );
    for (key, val) in [
        ("data", &sparse.data),
        ("indices", &sparse.indices),
        ("indptr", &sparse.indptr),
        ("row", &sparse.row),
        ("col", &sparse.col),
    ] {
        if let Some(v) = val {
            map.insert(key.into(), v.clone());
        }
    }
    Json::Object(map)
}

fn envelope_tag(value: &Json) -> Option<&str> {
    value.get("__tywrap_type__").and_then(Json::as_str)
}

fn is_bytes_envelope(value: &Json) -> bool {
    matches!(value.get("__tywrap_bytes__"), Some(Json::Bool(true)))
}

fn read_codec_version(value: &Json, tag: &str) -> Result<u32, CodecError> {
    match value.get("codecVersion") {
        Some(Json::Number(num)) => {
            let version = num.as_u64().unwrap_or_default() as u32;
            if version != CODEC_VERSION {
                return Err(CodecError::new(
                    "$",
                    format!("Unsupported {tag} envelope codecVersion: {version}"),
                ));
            }
            Ok(version)
        }
        _ => Ok(CODEC_VERSION),
    }
}

fn read_encoding(value: &Json) -> Encoding {
    match value.get("encoding").and_then(Json::as_str) {
        Some("arrow") => Encoding::Arrow,
        Some("ndarray") => Encoding::NdArray,
        _ => Encoding::Json,
    }
}

fn array_envelope_from_json(value: &Json, tag: &str) -> Result<ArrayEnvelope, CodecError> {
    let codec_version = read_codec_version(value, tag)?;
    let encoding = read_encoding(value);
    let shape = value.get("shape").and_then(Json::as_array).map(|arr| {
        arr.iter()
            .filter_map(Json::as_u64)
            .collect::<Vec<_>>()
    });
    let dtype = value
        .get("dtype")
        .and_then(Json::as_str)
        .map(|s| s.to_string());
    Ok(ArrayEnvelope {
        codec_version,
        encoding,
        data: value.get("data").cloned(),
        b64: value.get("b64").and_then(Json::as_str).map(String::from),
        shape,
        dtype,
    })
}

fn decode_array_envelope_sync(value: Json, tag: &str, path: &str) -> Result<Json, CodecError> {
    let arr = array_envelope_from_json(&value, tag)?;
    match arr.encoding {
        Encoding::Json => Ok(arr.data.unwrap_or(Json::Null)),
        Encoding::Arrow | Encoding::NdArray => {
            let slot = sync_slot();
            let decoder = slot
                .try_lock()
                .ok()
                .and_then(|guard| guard.clone())
                .ok_or_else(|| {
                    CodecError::new(path, "no Arrow decoder registered for this environment")
                })?;
            decoder.decode(tag, &arr)
        }
    }
}

/// Recursively resolves tagged envelopes in a decoded response value.
fn decode_value_sync(value: Json, path: &str) -> Result<Json, CodecError> {
    match value {
        Json::Object(ref map) if is_bytes_envelope(&value) => {
            read_codec_version(&value, "bytes")?;
            let b64 = map
                .get("b64")
                .and_then(Json::as_str)
                .ok_or_else(|| CodecError::new(path, "bytes envelope missing `b64`"))?;
            let raw = BASE64
                .decode(b64)
                .map_err(|err| CodecError::new(path, format!("invalid base64: {err}")))?;
            Ok(Json::Array(raw.into_iter().map(|b| Json::Number(b.into())).collect()))
        }
        Json::Object(_) => {
            let Some(tag) = envelope_tag(&value).map(String::from) else {
                return decode_plain_object_sync(value, path);
            };
            match tag.as_str() {
                "ndarray" | "dataframe" | "series" => decode_array_envelope_sync(value, &tag, path),
                "torch.tensor" => decode_tensor_sync(value, path),
                "scipy.sparse" => decode_sparse_sync(value, path).map(sparse_to_json),
                "sklearn.estimator" => decode_estimator_sync(value, path).map(estimator_to_json),
                other => Err(CodecError::new(path, format!("unknown envelope type `{other}`"))),
            }
        }
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (idx, item) in items.into_iter().enumerate() {
                out.push(decode_value_sync(item, &format!("{path}[{idx}]"))?);
            }
            Ok(Json::Array(out))
        }
        other => Ok(other),
    }
}

fn decode_plain_object_sync(value: Json, path: &str) -> Result<Json, CodecError> {
    let Json::Object(map) = value else {
        unreachable!("caller guarantees Object");
    };
    let mut out = JsonMap::with_capacity(map.len());
    for (key, val) in map {
        let child_path = format!("{path}.{key}");
        out.insert(key, decode_value_sync(val, &child_path)?);
    }
    Ok(Json::Object(out))
}

fn decode_tensor_sync(value: Json, path: &str) -> Result<Json, CodecError> {
    read_codec_version(&value, "torch.tensor")?;
    let shape: Vec<u64> = value
        .get("shape")
        .and_then(Json::as_array)
        .map(|arr| arr.iter().filter_map(Json::as_u64).collect())
        .unwrap_or_default();
    let dtype = value.get("dtype").cloned().unwrap_or(Json::Null);
    let device = value.get("device").cloned().unwrap_or(Json::Null);
    let nested = value
        .get("data")
        .cloned()
        .ok_or_else(|| CodecError::new(path, "torch.tensor envelope missing `data`"))?;
    let data = decode_value_sync(nested, &format!("{path}.data"))?;
    Ok(serde_json::json!({ "data": data, "shape": shape, "dtype": dtype, "device": device }))
}

fn decode_sparse_sync(value: Json, path: &str) -> Result<SparseEnvelope, CodecError> {
    let codec_version = read_codec_version(&value, "scipy.sparse")?;
    let format = match value.get("format").and_then(Json::as_str) {
        Some("csr") => SparseFormat::Csr,
        Some("csc") => SparseFormat::Csc,
        Some("coo") => SparseFormat::Coo,
        other => {
            return Err(CodecError::new(
                path,
                format!("unknown sparse format `{other:?}`"),
            ))
        }
    };
    let shape_arr = value
        .get("shape")
        .and_then(Json::as_array)
        .ok_or_else(|| CodecError::new(path, "scipy.sparse envelope missing `shape`"))?;
    if shape_arr.len() != 2 {
        return Err(CodecError::new(path, "scipy.sparse `shape` must be a 2-tuple"));
    }
    let shape = (
        shape_arr[0].as_u64().unwrap_or_default(),
        shape_arr[1].as_u64().unwrap_or_default(),
    );

    let indices = value.get("indices").cloned();
    let indptr = value.get("indptr").cloned();
    let row = value.get("row").cloned();
    let col = value.get("col").cloned();

    match format {
        SparseFormat::Csr | SparseFormat::Csc => {
            if indices.is_none() || indptr.is_none() {
                return Err(CodecError::new(
                    path,
                    "csr/csc sparse envelope requires `indices` and `indptr`",
                ));
            }
        }
        SparseFormat::Coo => {
            if row.is_none() || col.is_none() {
                return Err(CodecError::new(
                    path,
                    "coo sparse envelope requires `row` and `col`",
                ));
            }
        }
    }

    Ok(SparseEnvelope {
        codec_version,
        format,
        shape,
        data: value.get("data").cloned(),
        indices,
        indptr,
        row,
        col,
    })
}

fn sparse_to_json(sparse: SparseEnvelope) -> Json {
    serde_json::json!({
        "format": match sparse.format {
            SparseFormat::Csr => "csr",
            SparseFormat::Csc => "csc",
            SparseFormat::Coo => "coo",
        },
        "shape": [sparse.shape.0, sparse.shape.1],
        "data": sparse.data,
        "indices": sparse.indices,
        "indptr": sparse.indptr,
        "row": sparse.row,
        "col": sparse.col,
    })
}

fn decode_estimator_sync(value: Json, path: &str) -> Result<(String, String, String, Json), CodecError> {
    read_codec_version(&value, "sklearn.estimator")?;
    let class_name = value
        .get("className")
        .and_then(Json::as_str)
        .ok_or_else(|| CodecError::new(path, "sklearn.estimator missing `className`"))?
        .to_string();
    let module = value
        .get("module")
        .and_then(Json::as_str)
        .ok_or_else(|| CodecError::new(path, "sklearn.estimator missing `module`"))?
        .to_string();
    let version = value
        .get("version")
        .and_then(Json::as_str)
        .ok_or_else(|| CodecError::new(path, "sklearn.estimator missing `version`"))?
        .to_string();
    let params = value
        .get("params")
        .cloned()
        .ok_or_else(|| CodecError::new(path, "sklearn.estimator missing `params`"))?;
    if !params.is_object() {
        return Err(CodecError::new(path, "sklearn.estimator `params` must be an object"));
    }
    Ok((class_name, module, version, params))
}

fn estimator_to_json((class_name, module, version, params): (String, String, String, Json)) -> Json {
    serde_json::json!({ "className": class_name, "module": module, "version": version, "params": params })
}

fn decode_value_async<'a>(
    value: Json,
    path: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Json, CodecError>> + Send + 'a>> {
    Box::pin(async move {
        match value {
            Json::Object(_) if is_bytes_envelope(&value) => decode_value_sync(value, path),
            Json::Object(_) => {
                let Some(tag) = envelope_tag(&value).map(String::from) else {
                    let Json::Object(map) = value else {
                        unreachable!();
                    };
                    let mut out = JsonMap::with_capacity(map.len());
                    for (key, val) in map {
                        let child_path = format!("{path}.{key}");
                        out.insert(key, decode_value_async(val, &child_path).await?);
                    }
                    return Ok(Json::Object(out));
                };
                match tag.as_str() {
                    "ndarray" | "dataframe" | "series" => {
                        decode_array_envelope_async(value, &tag, path).await
                    }
                    "torch.tensor" => decode_tensor_async(value, path).await,
                    _ => decode_value_sync(value, path),
                }
            }
            Json::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (idx, item) in items.into_iter().enumerate() {
                    out.push(decode_value_async(item, &format!("{path}[{idx}]")).await?);
                }
                Ok(Json::Array(out))
            }
            other => Ok(other),
        }
    })
}

async fn decode_array_envelope_async(value: Json, tag: &str, path: &str) -> Result<Json, CodecError> {
    let arr = array_envelope_from_json(&value, tag)?;
    match arr.encoding {
        Encoding::Json => Ok(arr.data.unwrap_or(Json::Null)),
        Encoding::Arrow | Encoding::NdArray => {
            if let Some(decoder) = async_slot().lock().await.clone() {
                return decoder.decode(tag, &arr).await;
            }
            if let Some(decoder) = sync_slot().lock().await.clone() {
                return decoder.decode(tag, &arr);
            }
            Err(CodecError::new(
                path,
                "no Arrow decoder registered for this environment",
            ))
        }
    }
}

async fn decode_tensor_async(value: Json, path: &str) -> Result<Json, CodecError> {
    read_codec_version(&value, "torch.tensor")?;
    let shape: Vec<u64> = value
        .get("shape")
        .and_then(Json::as_array)
        .map(|arr| arr.iter().filter_map(Json::as_u64).collect())
        .unwrap_or_default();
    let dtype = value.get("dtype").cloned().unwrap_or(Json::Null);
    let device = value.get("device").cloned().unwrap_or(Json::Null);
    let nested = value
        .get("data")
        .cloned()
        .ok_or_else(|| CodecError::new(path, "torch.tensor envelope missing `data`"))?;
    let data = decode_value_async(nested, &format!("{path}.data")).await?;
    Ok(serde_json::json!({ "data": data, "shape": shape, "dtype": dtype, "device": device }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_plain_values() {
        let codec = SafeCodec::default();
        let value = Value::Map(vec![
            ("a".into(), Value::Int(1)),
            ("b".into(), Value::List(vec![Value::Str("x".into()), Value::Bool(true)])),
        ]);
        let json = codec.encode_value(&value).unwrap();
        assert_eq!(json, serde_json::json!({"a": 1, "b": ["x", true]}));
    }

    #[test]
    fn rejects_non_finite_floats_by_default() {
        let codec = SafeCodec::default();
        let err = codec.encode_value(&Value::Float(f64::NAN)).unwrap_err();
        assert!(err.message.contains("non-finite"));
    }

    #[test]
    fn allows_non_finite_floats_when_disabled() {
        let mut options = CodecOptions::default();
        options.reject_special_floats = false;
        let codec = SafeCodec::new(options);
        let json = codec.encode_value(&Value::Float(f64::INFINITY)).unwrap();
        assert_eq!(json, Json::Null);
    }

    #[test]
    fn encodes_bytes_as_base64_envelope_by_default() {
        let codec = SafeCodec::default();
        let json = codec.encode_value(&Value::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(json["__tywrap_bytes__"], Json::Bool(true));
        assert_eq!(json["b64"], Json::String(BASE64.encode([1, 2, 3])));
    }

    #[test]
    fn rejects_bytes_when_configured() {
        let codec = SafeCodec::new(CodecOptions {
            bytes_handling: BytesHandling::Reject,
            ..Default::default()
        });
        let err = codec.encode_value(&Value::Bytes(vec![1])).unwrap_err();
        assert_eq!(err.path, "$");
    }

    #[test]
    fn enforces_max_payload_bytes() {
        let codec = SafeCodec::new(CodecOptions {
            max_payload_bytes: 8,
            ..Default::default()
        });
        let message = Message::new(1, Method::Call, serde_json::json!({"x": "too long for eight"}));
        let err = codec.encode_request(&message).unwrap_err();
        assert!(err.message.contains("maxPayloadBytes"));
    }

    #[test]
    fn decodes_bytes_envelope_back_to_byte_array() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({
            "id": 7,
            "result": {"__tywrap_bytes__": true, "codecVersion": 1, "b64": BASE64.encode([9,8,7])}
        });
        let decoded = codec
            .decode_response(&serde_json::to_vec(&response).unwrap())
            .unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.result, serde_json::json!([9, 8, 7]));
    }

    #[test]
    fn decodes_inline_json_ndarray_without_decoder() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({
            "id": 1,
            "result": {
                "__tywrap_type__": "ndarray",
                "codecVersion": 1,
                "encoding": "json",
                "data": [1, 2, 3],
                "shape": [3],
                "dtype": "int64",
            }
        });
        let decoded = codec
            .decode_response(&serde_json::to_vec(&response).unwrap())
            .unwrap();
        assert_eq!(decoded.result, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn arrow_encoding_without_registered_decoder_errors() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({
            "id": 1,
            "result": {
                "__tywrap_type__": "ndarray",
                "codecVersion": 1,
                "encoding": "arrow",
                "b64": "AAAA",
            }
        });
        let err = expect_codec_error(codec.decode_response(&serde_json::to_vec(&response).unwrap()));
        assert!(err.message.contains("Arrow decoder"));
    }

    #[test]
    fn rejects_unsupported_envelope_codec_version() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({
            "id": 1,
            "result": {
                "__tywrap_type__": "ndarray",
                "codecVersion": 99,
                "encoding": "json",
                "data": [],
            }
        });
        let err = expect_codec_error(codec.decode_response(&serde_json::to_vec(&response).unwrap()));
        assert!(err.message.contains("Unsupported ndarray envelope codecVersion: 99"));
    }

    #[test]
    fn rejects_response_with_both_result_and_error() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({
            "id": 1,
            "result": 1,
            "error": {"type": "ValueError", "message": "bad"},
        });
        let err = expect_codec_error(codec.decode_response(&serde_json::to_vec(&response).unwrap()));
        assert!(err.message.contains("both"));
    }

    #[test]
    fn rejects_response_missing_id() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({"result": 1});
        let err = expect_codec_error(codec.decode_response(&serde_json::to_vec(&response).unwrap()));
        assert!(err.message.contains("missing \"id\""));
    }

    #[test]
    fn accepts_missing_protocol_field_for_backward_compat() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({"id": 3, "result": "ok"});
        let decoded = codec
            .decode_response(&serde_json::to_vec(&response).unwrap())
            .unwrap();
        assert_eq!(decoded.id, 3);
    }

    #[test]
    fn rejects_wrong_protocol_field() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({"id": 3, "protocol": "tywrap/2", "result": "ok"});
        let err = expect_codec_error(codec.decode_response(&serde_json::to_vec(&response).unwrap()));
        assert!(err.message.contains("tywrap/2"));
    }

    #[test]
    fn sparse_csr_requires_indices_and_indptr() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({
            "id": 1,
            "result": {
                "__tywrap_type__": "scipy.sparse",
                "codecVersion": 1,
                "format": "csr",
                "shape": [2, 2],
                "data": [1, 2],
            }
        });
        let err = expect_codec_error(codec.decode_response(&serde_json::to_vec(&response).unwrap()));
        assert!(err.message.contains("indices"));
    }

    #[test]
    fn error_envelope_decodes_as_execution_not_codec() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({
            "id": 1,
            "error": {"type": "ValueError", "message": "bad"},
        });
        let err = codec
            .decode_response(&serde_json::to_vec(&response).unwrap())
            .unwrap_err();
        match err {
            DecodeError::Execution(payload) => {
                assert_eq!(payload.type_name, "ValueError");
                assert_eq!(payload.message, "bad");
            }
            DecodeError::Codec(err) => panic!("expected Execution, got Codec({err:?})"),
        }
    }

    #[test]
    fn malformed_error_object_decodes_as_codec_error() {
        let codec = SafeCodec::default();
        let response = serde_json::json!({
            "id": 1,
            "error": {"message": "bad"},
        });
        let err = expect_codec_error(codec.decode_response(&serde_json::to_vec(&response).unwrap()));
        assert!(err.message.contains("malformed error object"));
    }

    fn expect_codec_error(result: Result<DecodedResponse, DecodeError>) -> CodecError {
        match result {
            Ok(_) => panic!("expected an error"),
            Err(DecodeError::Codec(err)) => err,
            Err(DecodeError::Execution(payload)) => {
                panic!("expected Codec error, got Execution({payload:?})")
            }
        }
    }
}
