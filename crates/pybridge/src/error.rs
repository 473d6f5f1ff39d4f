use std::time::Duration;

use thiserror::Error;

/// Closed set of error kinds raised by the bridge.
///
/// Every failure surfaced to a host caller belongs to exactly one of these
/// variants (spec §4.8). Lower layers (`CodecError`, `FramerError`) convert
/// into this type at the point where they cross into Protocol/Bridge code.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("codec error at `{path}`: {message}")]
    Codec { path: String, message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String, worker_fatal: bool },

    #[error("{type_name}: {message}")]
    Execution {
        type_name: String,
        message: String,
        traceback: Option<String>,
    },

    #[error("timed out after {timeout:?}. Recent stderr: {stderr}")]
    Timeout { timeout: Duration, stderr: String },

    #[error("bridge has been disposed")]
    Disposed,

    #[error("instance handle error: {0}")]
    InstanceHandle(String),

    #[error("invalid bridge configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// A protocol violation that does not, by itself, mean the worker's stream is poisoned
    /// (e.g. an oversize line: the framer resets its buffer and recovers at the next
    /// delimiter). See spec §9's design note on oversize vs id-less/duplicate-id handling.
    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
            worker_fatal: false,
        }
    }

    /// A protocol violation that means the worker's stream can no longer be trusted (id-less
    /// response, duplicate id, process exit) — the pool should quarantine the worker.
    pub fn protocol_fatal(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
            worker_fatal: true,
        }
    }

    pub fn instance_handle(message: impl Into<String>) -> Self {
        BridgeError::InstanceHandle(message.into())
    }

    pub fn execution(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Execution {
            type_name: type_name.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// `true` for errors that indicate the underlying worker is no longer usable
    /// and should be quarantined by the pool.
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(self, BridgeError::Protocol { worker_fatal: true, .. })
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        BridgeError::Codec {
            path: err.path,
            message: err.message,
        }
    }
}

impl From<FramerError> for BridgeError {
    fn from(err: FramerError) -> Self {
        match err {
            FramerError::LineTooLong { max_line_length } => {
                BridgeError::protocol(format!("Response line exceeded {max_line_length} bytes"))
            }
        }
    }
}

/// Error raised by [`crate::codec::SafeCodec`]; always carries a JSON-pointer-like path.
#[derive(Debug, Error, Clone)]
#[error("{message} (at {path})")]
pub struct CodecError {
    pub path: String,
    pub message: String,
}

impl CodecError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error raised by [`crate::framer::Framer`].
#[derive(Debug, Error, Clone, Copy)]
pub enum FramerError {
    #[error("Response line exceeded {max_line_length} bytes")]
    LineTooLong { max_line_length: usize },
}
