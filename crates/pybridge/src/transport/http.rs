//! HTTP POST transport: one request per `send`, no internal id correlation needed since a
//! single HTTP round trip already is a 1:1 request/response pair. Built on `reqwest`, sourced
//! from `estuary-flow`'s dependency stack since the teacher has no HTTP client.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BridgeError;

use super::{CancelToken, Transport, TransportState};

const STATE_STARTING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_DISPOSED: u8 = 2;

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    state: AtomicU8,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            state: AtomicU8::new(STATE_STARTING),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn init(&self) -> Result<(), BridgeError> {
        // A no-op, per spec §4.3: the transport is ready immediately.
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

        let request = self
            .client
            .post(&self.base_url)
            .header("content-type", "application/json")
            .timeout(timeout)
            .body(message);

        tokio::select! {
            response = request.send() => {
                let response = response.map_err(|err| {
                    if err.is_timeout() {
                        BridgeError::Timeout { timeout, stderr: String::new() }
                    } else {
                        BridgeError::protocol(format!("network error: {err}"))
                    }
                })?;

                let status = response.status();
                let body = response
                    .bytes()
                    .await
                    .map_err(|err| BridgeError::protocol(format!("network error: {err}")))?;

                if !status.is_success() {
                    return Err(BridgeError::execution(
                        "HttpError",
                        format!("HTTP {status}: {}", String::from_utf8_lossy(&body)),
                    ));
                }

                Ok(body.to_vec())
            }
            _ = cancel.cancelled() => {
                Err(BridgeError::Timeout { timeout, stderr: String::new() })
            }
        }
    }

    async fn dispose(&self) {
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
