//! Core domain types for eventpipe
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | A named, timestamped occurrence with free-form properties |
//! | **Context** | Snapshot of device/app/session metadata shared by a run of events |
//! | **StoredEvent** | An event tagged with the context it was captured under |
//! | **Batch** | A bounded run of events sharing one context, offered for delivery |
//! | **Session** | A bounded period of user activity, closed by inactivity |
//!
//! Timestamps are integer seconds since the Unix epoch throughout.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Name of the event emitted when a session begins.
pub const SESSION_START_EVENT: &str = "session_start";

/// Name of the event emitted when a session is closed by an explicit restart.
pub const SESSION_END_EVENT: &str = "session_end";

/// Free-form event properties.
pub type Properties = serde_json::Map<String, serde_json::Value>;

// ============================================
// Events
// ============================================

/// An immutable telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name (e.g. "screen_view", "session_start")
    pub name: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    /// Event payload
    #[serde(default)]
    pub properties: Properties,
}

impl Event {
    /// Create an event with no properties.
    pub fn new(name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            properties: Properties::new(),
        }
    }

    /// Attach properties to the event.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// Opaque identifier of the context an event was captured under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Mint a fresh context id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An event owned by a queue, tagged with its capture context.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub event: Event,
    pub context_id: ContextId,
}

impl StoredEvent {
    pub fn new(event: Event, context_id: ContextId) -> Self {
        Self { event, context_id }
    }

    /// Shorthand for the wrapped event's timestamp.
    pub fn timestamp(&self) -> i64 {
        self.event.timestamp
    }
}

// ============================================
// Queue configuration and telemetry
// ============================================

/// Batching limits for a single event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Upper bound on events per batch
    pub max_batch_size: usize,
    /// Delay before a partial batch is flushed
    pub upload_interval: std::time::Duration,
    /// Buffer length that triggers an immediate flush
    pub upload_threshold: usize,
    /// Buffer capacity; inserts past it evict the sorted tail
    pub max_events: usize,
}

impl QueueConfig {
    /// Check the batching limits. Violations are caller bugs, reported as [`Error::Config`].
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be at least 1".to_string()));
        }
        if self.upload_threshold == 0 {
            return Err(Error::Config(
                "upload_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_events < self.upload_threshold {
            return Err(Error::Config(format!(
                "max_events ({}) must be >= upload_threshold ({})",
                self.max_events, self.upload_threshold
            )));
        }
        Ok(())
    }
}

/// Per-flush diagnostics handed to the upload callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Number of events in the offered batch
    pub events_in_batch: usize,
    /// `events_in_batch / max_batch_size`, in `[0, 1]`
    pub batch_load: f64,
    /// Events evicted by overflow since the last accepted batch
    pub events_dropped_since_last_batch: usize,
}

// ============================================
// Session
// ============================================

/// Persisted session record.
///
/// `id` is the timestamp at which the session was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub last_event_timestamp: i64,
}

impl Session {
    /// A session created at `timestamp` with no activity since.
    pub fn started_at(timestamp: i64) -> Self {
        Self {
            id: timestamp,
            last_event_timestamp: timestamp,
        }
    }
}
