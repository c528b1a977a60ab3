//! Batch sender
//!
//! Serializes a [`BatchPayload`] and POSTs it to the configured destination.
//! The sender performs exactly one attempt per call; retry policy belongs to
//! the caller (see [`crate::pipeline`]).

pub mod stack;
pub mod transport;

pub use stack::{
    compute_event_hash, BatchCommon, BatchPayload, JsonBatch, JsonEvent, JsonStack,
    SerializeError, Stack,
};
pub use transport::{BatchRequest, HttpTransport, ReqwestTransport, TransportError};

use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::clock::Clock;

/// Value of the `X-SDK-Name` header.
pub const SDK_NAME: &str = "eventpipe";

/// Value of the `X-SDK-Version` header.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Why a batch could not be delivered.
#[derive(Error, Debug)]
pub enum SendError {
    /// No destination URL has been set
    #[error("sender is not configured with a destination URL")]
    NotConfigured,

    #[error("failed to serialize batch: {0}")]
    Serialization(#[from] SerializeError),

    #[error("network error: {0}")]
    Network(#[from] TransportError),
}

impl SendError {
    /// Whether a later attempt with the same payload may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SendError::Network(e) => e.is_transient(),
            SendError::NotConfigured | SendError::Serialization(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SenderSettings {
    url: Option<String>,
    api_key: Option<String>,
}

/// Delivers serialized batches to one destination.
pub struct BatchSender {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    settings: RwLock<SenderSettings>,
}

impl BatchSender {
    pub fn new(transport: Arc<dyn HttpTransport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            settings: RwLock::new(SenderSettings::default()),
        }
    }

    pub fn set_url(&self, url: impl Into<String>) {
        let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
        settings.url = Some(url.into());
    }

    /// Replace the credential used for subsequent sends.
    ///
    /// A send already in progress keeps the credential it started with.
    pub fn set_api_key(&self, api_key: impl Into<String>) {
        let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
        settings.api_key = Some(api_key.into());
    }

    pub fn url(&self) -> Option<String> {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .url
            .clone()
    }

    /// Build the HTTP request for `batch` without sending it.
    pub fn build_request(&self, batch: &dyn BatchPayload) -> Result<BatchRequest, SendError> {
        let settings = self
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let url = settings.url.ok_or(SendError::NotConfigured)?;
        let body = batch.to_bytes()?;

        let headers = vec![
            ("X-API-Key".to_string(), settings.api_key.unwrap_or_default()),
            ("Content-Type".to_string(), batch.content_type().to_string()),
            ("X-SDK-Name".to_string(), SDK_NAME.to_string()),
            ("X-SDK-Version".to_string(), SDK_VERSION.to_string()),
            ("X-Sent-At".to_string(), self.clock.now().to_string()),
        ];

        Ok(BatchRequest { url, headers, body })
    }

    /// Send one batch. A single attempt; no retry.
    pub async fn send_batch(&self, batch: &dyn BatchPayload) -> Result<(), SendError> {
        let request = self.build_request(batch)?;
        let url = request.url.clone();
        let bytes = request.body.len();

        match self.transport.post(request).await {
            Ok(()) => {
                tracing::debug!(
                    url = %url,
                    events = batch.event_count(),
                    bytes,
                    "Batch delivered"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Batch send failed");
                Err(SendError::Network(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{ContextId, Event, Telemetry};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<BatchRequest>>,
        fail_with: Mutex<Option<TransportError>>,
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn post(&self, request: BatchRequest) -> std::result::Result<(), TransportError> {
            self.requests.lock().unwrap().push(request);
            match self.fail_with.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    struct BrokenPayload;

    impl BatchPayload for BrokenPayload {
        fn to_bytes(&self) -> Result<Vec<u8>, SerializeError> {
            Err(SerializeError::Other("boom".into()))
        }

        fn event_count(&self) -> usize {
            0
        }
    }

    fn payload() -> Box<dyn BatchPayload> {
        let common = BatchCommon::new(
            Uuid::new_v4(),
            ContextId::new(),
            Telemetry {
                events_in_batch: 1,
                batch_load: 1.0,
                events_dropped_since_last_batch: 0,
            },
        );
        JsonStack.make_batch(&common, &serde_json::json!({}), &[Event::new("tap", 10)])
    }

    fn sender(transport: Arc<RecordingTransport>) -> BatchSender {
        BatchSender::new(transport, Arc::new(ManualClock::new(1_700_000_000)))
    }

    #[tokio::test]
    async fn test_unconfigured_sender() {
        let transport = Arc::new(RecordingTransport::default());
        let sender = sender(transport.clone());

        let result = sender.send_batch(payload().as_ref()).await;
        assert!(matches!(result, Err(SendError::NotConfigured)));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_headers() {
        let transport = Arc::new(RecordingTransport::default());
        let sender = sender(transport.clone());
        sender.set_url("https://collector.example.com/v1/batch");
        sender.set_api_key("key-1");

        sender.send_batch(payload().as_ref()).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.url, "https://collector.example.com/v1/batch");
        assert_eq!(request.header("X-API-Key"), Some("key-1"));
        assert_eq!(request.header("Content-Type"), Some("application/json"));
        assert_eq!(request.header("X-SDK-Name"), Some(SDK_NAME));
        assert_eq!(request.header("X-SDK-Version"), Some(SDK_VERSION));
        assert_eq!(request.header("X-Sent-At"), Some("1700000000"));
    }

    #[tokio::test]
    async fn test_api_key_update_applies_to_next_send() {
        let transport = Arc::new(RecordingTransport::default());
        let sender = sender(transport.clone());
        sender.set_url("https://collector.example.com");
        sender.set_api_key("old");
        sender.send_batch(payload().as_ref()).await.unwrap();
        sender.set_api_key("new");
        sender.send_batch(payload().as_ref()).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].header("X-API-Key"), Some("old"));
        assert_eq!(requests[1].header("X-API-Key"), Some("new"));
    }

    #[tokio::test]
    async fn test_serialization_error() {
        let transport = Arc::new(RecordingTransport::default());
        let sender = sender(transport.clone());
        sender.set_url("https://collector.example.com");

        let result = sender.send_batch(&BrokenPayload).await;
        assert!(matches!(result, Err(SendError::Serialization(_))));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_error_is_not_retried() {
        let transport = Arc::new(RecordingTransport::default());
        *transport.fail_with.lock().unwrap() = Some(TransportError::Timeout);
        let sender = sender(transport.clone());
        sender.set_url("https://collector.example.com");

        let err = sender.send_batch(payload().as_ref()).await.unwrap_err();
        assert!(matches!(err, SendError::Network(TransportError::Timeout)));
        assert!(err.is_transient());
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
    }
}
