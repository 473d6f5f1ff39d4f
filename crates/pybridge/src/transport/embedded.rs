//! Embedded (in-process) transport: dispatches straight into a host-supplied async callable
//! instead of a subprocess or network hop. Useful when the "worker" is really another
//! in-process language runtime (e.g. an embedded interpreter) rather than a separate process.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::BridgeError;

use super::{CancelToken, Transport, TransportState};

/// Loads (once) the callable the embedded runtime installs in its globals.
#[async_trait]
pub trait EmbeddedLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn EmbeddedDispatcher>, BridgeError>;
}

/// The dispatch callable itself: request bytes in, response bytes out.
#[async_trait]
pub trait EmbeddedDispatcher: Send + Sync {
    async fn dispatch(&self, request: Vec<u8>) -> Result<Vec<u8>, BridgeError>;
}

const STATE_STARTING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_DISPOSED: u8 = 2;

pub struct EmbeddedTransport {
    loader: Arc<dyn EmbeddedLoader>,
    dispatcher: Mutex<Option<Arc<dyn EmbeddedDispatcher>>>,
    state: AtomicU8,
}

impl EmbeddedTransport {
    pub fn new(loader: Arc<dyn EmbeddedLoader>) -> Self {
        Self {
            loader,
            dispatcher: Mutex::new(None),
            state: AtomicU8::new(STATE_STARTING),
        }
    }
}

#[async_trait]
impl Transport for EmbeddedTransport {
    async fn init(&self) -> Result<(), BridgeError> {
        let mut guard = self.dispatcher.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let dispatcher = self.loader.load().await?;
        *guard = Some(dispatcher);
        self.state.store(STATE_READY, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        message: Vec<u8>,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<Vec<u8>, BridgeError> {
        if self.state() == TransportState::Disposed {
            return Err(BridgeError::Disposed);
        }

        validate_outgoing_message(&message)?;

        let dispatcher = {
            let guard = self.dispatcher.lock().await;
            guard
                .clone()
                .ok_or_else(|| BridgeError::protocol("embedded runtime not initialized"))?
        };

        tokio::select! {
            result = dispatcher.dispatch(message) => result,
            _ = tokio::time::sleep(timeout) => {
                Err(BridgeError::Timeout { timeout, stderr: String::new() })
            }
            _ = cancel.cancelled() => {
                Err(BridgeError::Timeout { timeout, stderr: String::new() })
            }
        }
    }

    async fn dispose(&self) {
        // Per spec §4.3: let any in-flight dispatch complete naturally, just stop admitting
        // new sends. There is no child process or socket to tear down here.
        self.state.store(STATE_DISPOSED, Ordering::SeqCst);
    }

    fn state(&self) -> TransportState {
        match self.state.load(Ordering::SeqCst) {
            STATE_STARTING => TransportState::Starting,
            STATE_READY => TransportState::Ready,
            _ => TransportState::Disposed,
        }
    }
}

fn validate_outgoing_message(message: &[u8]) -> Result<(), BridgeError> {
    let value: serde_json::Value = serde_json::from_slice(message)
        .map_err(|err| BridgeError::protocol(format!("request is not valid JSON: {err}")))?;

    let has_numeric_id = value.get("id").and_then(serde_json::Value::as_u64).is_some();
    if !has_numeric_id {
        return Err(BridgeError::protocol("request missing numeric \"id\""));
    }

    let legal_method = matches!(
        value.get("method").and_then(serde_json::Value::as_str),
        Some("call") | Some("instantiate") | Some("call_method") | Some("dispose_instance")
    );
    if !legal_method {
        return Err(BridgeError::protocol("request has an unrecognized \"method\""));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoDispatcher;

    #[async_trait]
    impl EmbeddedDispatcher for EchoDispatcher {
        async fn dispatch(&self, request: Vec<u8>) -> Result<Vec<u8>, BridgeError> {
            Ok(request)
        }
    }

    struct StaticLoader;

    #[async_trait]
    impl EmbeddedLoader for StaticLoader {
        async fn load(&self) -> Result<Arc<dyn EmbeddedDispatcher>, BridgeError> {
            Ok(Arc::new(EchoDispatcher))
        }
    }

    #[tokio::test]
    async fn rejects_send_before_init() {
        let transport = EmbeddedTransport::new(Arc::new(StaticLoader));
        let message = serde_json::to_vec(&serde_json::json!({"id": 1, "method": "call"})).unwrap();
        let err = transport
            .send(message, Duration::from_secs(1), CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn dispatches_after_init() {
        let transport = EmbeddedTransport::new(Arc::new(StaticLoader));
        transport.init().await.unwrap();
        let message = serde_json::to_vec(&serde_json::json!({"id": 1, "method": "call"})).unwrap();
        let response = transport
            .send(message.clone(), Duration::from_secs(1), CancelToken::new())
            .await
            .unwrap();
        assert_eq!(response, message);
    }

    #[tokio::test]
    async fn rejects_send_after_dispose() {
        let transport = EmbeddedTransport::new(Arc::new(StaticLoader));
        transport.init().await.unwrap();
        transport.dispose().await;
        let message = serde_json::to_vec(&serde_json::json!({"id": 1, "method": "call"})).unwrap();
        let err = transport
            .send(message, Duration::from_secs(1), CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Disposed));
    }

    #[tokio::test]
    async fn rejects_message_without_legal_method() {
        let transport = EmbeddedTransport::new(Arc::new(StaticLoader));
        transport.init().await.unwrap();
        let message = serde_json::to_vec(&serde_json::json!({"id": 1, "method": "bogus"})).unwrap();
        let err = transport
            .send(message, Duration::from_secs(1), CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unrecognized"));
    }
}
