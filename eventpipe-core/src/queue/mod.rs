//! Event queue and batching engine
//!
//! Buffers [`StoredEvent`](crate::types::StoredEvent)s in timestamp order,
//! bounds memory by evicting the sorted tail past `max_events`, and offers
//! head-of-buffer batches to an upload callback when either the upload
//! threshold is reached or the one-shot upload timer fires.
//!
//! ## Flush triggers
//!
//! - **Threshold**: after every insert, if `len >= upload_threshold`
//! - **Timer**: `upload_interval` after the first event lands in an idle queue;
//!   flushes unconditionally
//! - **Capacity signal**: retries an owed timer flush, or a threshold flush
//!
//! A batch is the longest prefix that fits `max_batch_size` and shares the
//! first event's context. A rejected batch leaves the buffer untouched and is
//! offered again on the next trigger.

mod core;
mod worker;

pub use self::core::{FlushOutcome, QueueCore, QueueStatus, RemoveHandler, UploadHandler};
pub use self::worker::{EventQueue, WeakEventQueue};
