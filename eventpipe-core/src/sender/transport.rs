//! HTTP transport used by the batch sender

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use thiserror::Error;

use crate::error::{Error, Result};

/// Transport-level failure, classified so callers can decide on retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No route to the server (DNS, refused connection, no network)
    #[error("offline: {0}")]
    Offline(String),

    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success status
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Offline(_) | TransportError::Timeout => true,
            TransportError::Status { status, .. } => *status >= 500 || *status == 429,
            TransportError::Other(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Offline(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// A fully built batch upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl BatchRequest {
    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Performs the network call for a batch.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST the request; `Ok` means the server acknowledged it.
    async fn post(&self, request: BatchRequest) -> std::result::Result<(), TransportError>;
}

/// [`HttpTransport`] backed by `reqwest`.
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, request: BatchRequest) -> std::result::Result<(), TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Other(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Other(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
        }

        let response = self
            .http_client
            .post(&request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Offline("dns".into()).is_transient());
        assert!(TransportError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(TransportError::Status {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Status {
            status: 422,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Other("bad".into()).is_transient());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = BatchRequest {
            url: "https://example.com".into(),
            headers: vec![("X-API-Key".into(), "secret".into())],
            body: vec![],
        };
        assert_eq!(request.header("x-api-key"), Some("secret"));
        assert_eq!(request.header("missing"), None);
    }

    #[test]
    fn test_reqwest_transport_builds() {
        assert!(ReqwestTransport::new(Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let transport = ReqwestTransport::new(Duration::from_secs(2)).unwrap();
        let result = transport
            .post(BatchRequest {
                url: "http://127.0.0.1:9/events".into(),
                headers: vec![],
                body: b"{}".to_vec(),
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }
}
