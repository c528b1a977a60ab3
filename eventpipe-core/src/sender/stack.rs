//! Pluggable batch serialization
//!
//! A [`Stack`] decides how a run of events, their shared context snapshot and
//! the batch's common metadata turn into bytes on the wire. The sender only
//! sees the resulting [`BatchPayload`].

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ContextId, Event, Telemetry};

/// Failure to turn a batch into bytes.
#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// A batch ready to be written to the wire.
pub trait BatchPayload: Send + Sync {
    fn to_bytes(&self) -> Result<Vec<u8>, SerializeError>;

    /// MIME type of [`to_bytes`](Self::to_bytes) output.
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    /// Number of events carried, for logging and stats.
    fn event_count(&self) -> usize;
}

/// Builds payloads for one wire format.
pub trait Stack: Send + Sync {
    fn make_batch(
        &self,
        common: &BatchCommon,
        context: &serde_json::Value,
        events: &[Event],
    ) -> Box<dyn BatchPayload>;
}

/// Metadata shared by every event in a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCommon {
    /// Unique per batch
    pub batch_id: Uuid,
    /// Stable for the lifetime of the producing process
    pub instance_id: Uuid,
    pub context_id: ContextId,
    pub telemetry: Telemetry,
}

impl BatchCommon {
    pub fn new(instance_id: Uuid, context_id: ContextId, telemetry: Telemetry) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            instance_id,
            context_id,
            telemetry,
        }
    }
}

// ============================================
// JSON stack
// ============================================

/// Serializes batches as a single JSON document.
///
/// ```json
/// { "common": {...}, "context": {...}, "events": [{"name", "timestamp", "properties", "eventHash"}] }
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonStack;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonBatch {
    pub common: BatchCommon,
    pub context: serde_json::Value,
    pub events: Vec<JsonEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonEvent {
    pub name: String,
    pub timestamp: i64,
    pub properties: crate::types::Properties,
    /// Content-based hash for server-side deduplication (32-char hex)
    pub event_hash: String,
}

impl From<&Event> for JsonEvent {
    fn from(event: &Event) -> Self {
        Self {
            name: event.name.clone(),
            timestamp: event.timestamp,
            properties: event.properties.clone(),
            event_hash: compute_event_hash(event),
        }
    }
}

impl Stack for JsonStack {
    fn make_batch(
        &self,
        common: &BatchCommon,
        context: &serde_json::Value,
        events: &[Event],
    ) -> Box<dyn BatchPayload> {
        Box::new(JsonBatch {
            common: common.clone(),
            context: context.clone(),
            events: events.iter().map(JsonEvent::from).collect(),
        })
    }
}

impl BatchPayload for JsonBatch {
    fn to_bytes(&self) -> Result<Vec<u8>, SerializeError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn event_count(&self) -> usize {
        self.events.len()
    }
}

/// Hash of name, timestamp and properties, truncated to 128 bits.
pub fn compute_event_hash(event: &Event) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.name.as_bytes());
    hasher.update(event.timestamp.to_le_bytes());
    // serde_json::Map iterates in key order, so this is stable
    hasher.update(serde_json::Value::Object(event.properties.clone()).to_string());
    hex::encode(&hasher.finalize()[..16])
}
