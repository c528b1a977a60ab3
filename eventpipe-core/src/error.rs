//! Error types for eventpipe-core

use thiserror::Error;

use crate::sender::SendError;

/// Main error type for the eventpipe-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error (session store)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A queue operation that requires a configuration ran before one was installed.
    ///
    /// This is a wiring bug in the caller, not a runtime condition.
    #[error("event queue used before it was configured")]
    NotConfigured,

    /// The queue's worker task has stopped and no longer accepts work
    #[error("event queue is closed")]
    QueueClosed,

    /// Batch delivery error
    #[error("send error: {0}")]
    Send(#[from] SendError),
}

/// Result type alias for eventpipe-core
pub type Result<T> = std::result::Result<T, Error>;
