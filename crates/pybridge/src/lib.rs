#![forbid(unsafe_code)]
//! Host-side runtime bridge to a pooled Python worker subprocess.
//!
//! A [`Bridge`] owns a [`pool::WorkerPool`] of long-lived worker subprocesses that speak a
//! line-delimited JSON request/response protocol over stdio (or HTTP/embedded variants, see
//! [`transport`]), multiplexed by correlation id ([`protocol::Protocol`]), with a
//! safety-oriented value codec ([`codec::SafeCodec`]) at the boundary.
//!
//! ```no_run
//! # async fn run() -> Result<(), pybridge::BridgeError> {
//! use pybridge::{BridgeBuilder, Value};
//!
//! let bridge = BridgeBuilder::new()
//!     .min_processes(1)
//!     .max_processes(4)
//!     .build()
//!     .await?;
//!
//! let result = bridge.call("math", "sqrt", vec![Value::Int(16)], None).await?;
//! assert_eq!(result, serde_json::json!(4));
//!
//! bridge.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod builder;
pub mod codec;
pub mod env;
pub mod error;
pub mod framer;
pub mod pool;
pub mod protocol;
pub mod transport;

pub use bridge::Bridge;
pub use builder::{BridgeBuilder, BridgeConfig, WarmupCommand};
pub use codec::{
    ArrayEnvelope, ArrowDecoder, AsyncArrowDecoder, BytesHandling, CodecOptions, DecodeError,
    Encoding, Envelope, SafeCodec, SparseEnvelope, SparseFormat, Value,
};
pub use error::{BridgeError, CodecError, FramerError};
pub use pool::{LoadBalancing, PoolConfig, WorkerPool};
pub use protocol::BridgeInfo;
