//! # eventpipe-core
//!
//! Core library for eventpipe - a client-side telemetry pipeline.
//!
//! This library provides:
//! - An event queue that batches events by timestamp and context
//! - A batch sender with a typed error taxonomy
//! - A session manager that emits session-boundary events
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through three stages:
//! - **Capture:** [`Pipeline::track`] stamps the current context id and refreshes the session
//! - **Batching:** one [`EventQueue`] per destination decides *when* and *what* to flush
//! - **Delivery:** the upload callback serializes with a [`sender::Stack`] and sends via
//!   [`BatchSender`] on a background task
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use eventpipe_core::{Config, Database, Pipeline};
//!
//! # async fn run() -> eventpipe_core::Result<()> {
//! let config = Config::load()?;
//!
//! let db = Database::open(&Config::database_path())?;
//! db.migrate()?;
//!
//! let pipeline = Pipeline::from_config(&config, Arc::new(db))?;
//! pipeline.start();
//! pipeline.track("app_open", Default::default())?;
//! pipeline.shutdown(std::time::Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use context::ContextStore;
pub use db::{Database, KeyValueStore, MemoryStore};
pub use error::{Error, Result};
pub use pipeline::{DeliveryStats, DestinationSpec, DestinationStatus, Pipeline, PipelineBuilder};
pub use queue::{EventQueue, FlushOutcome, QueueStatus};
pub use sender::{BatchSender, SendError};
pub use session::SessionManager;
pub use types::*;

// Public modules
pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod sender;
pub mod session;
pub mod timer;
pub mod types;
