//! Actor wrapper that gives each queue its own serialized execution context
//!
//! Every public method hands a command to the queue's worker task over an
//! unbounded channel and returns immediately. The worker applies commands in
//! the order they were accepted, so all buffer mutations are linearized.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::timer::TokioTimer;
use crate::types::{QueueConfig, StoredEvent};

use super::core::{FlushOutcome, QueueCore, QueueStatus, RemoveHandler, UploadHandler};

enum Command {
    Configure(QueueConfig),
    SetUploadHandler(UploadHandler),
    SetRemoveHandler(RemoveHandler),
    AddEvent(StoredEvent),
    AddEvents(Vec<StoredEvent>),
    CapacityAvailable,
    SetPaused(bool),
    TimerFired(u64),
    Flush(oneshot::Sender<Result<FlushOutcome>>),
    Status(oneshot::Sender<QueueStatus>),
    Snapshot(oneshot::Sender<Vec<StoredEvent>>),
}

/// Handle to a running event queue.
///
/// Cloning is cheap; the worker stops once every handle is dropped.
#[derive(Clone)]
pub struct EventQueue {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
}

/// Non-owning handle, for callbacks that live inside the queue itself.
#[derive(Clone)]
pub struct WeakEventQueue {
    name: Arc<str>,
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl EventQueue {
    /// Spawn a queue worker on the current tokio runtime.
    ///
    /// The queue buffers events but never flushes until [`configure`](Self::configure) is called.
    pub fn spawn(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::unbounded_channel();

        let weak = tx.downgrade();
        let timer = TokioTimer::new(move |generation| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::TimerFired(generation));
            }
        });
        let core = QueueCore::new(Box::new(timer));

        tokio::spawn(run(Arc::clone(&name), core, rx));
        debug!(queue = %name, "Spawned event queue");

        Self { name, tx }
    }

    /// A handle whose worker is already gone; every send fails with `QueueClosed`.
    #[cfg(test)]
    pub(crate) fn closed(name: impl Into<String>) -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self {
            name: Arc::from(name.into()),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install or replace the configuration. An invalid config is rejected before it
    /// reaches the worker.
    pub fn configure(&self, config: QueueConfig) -> Result<()> {
        config.validate()?;
        self.send(Command::Configure(config))
    }

    /// Set the upload callback. Intended to be called once by the owner.
    pub fn set_upload_handler(&self, handler: UploadHandler) -> Result<()> {
        self.send(Command::SetUploadHandler(handler))
    }

    /// Set the overflow-eviction callback. Intended to be called once by the owner.
    pub fn set_remove_handler(&self, handler: RemoveHandler) -> Result<()> {
        self.send(Command::SetRemoveHandler(handler))
    }

    pub fn add_event(&self, event: StoredEvent) -> Result<()> {
        self.send(Command::AddEvent(event))
    }

    pub fn add_events(&self, events: Vec<StoredEvent>) -> Result<()> {
        self.send(Command::AddEvents(events))
    }

    /// Tell the queue a previously rejected flush may now succeed.
    pub fn notify_capacity_available(&self) -> Result<()> {
        self.send(Command::CapacityAvailable)
    }

    /// Suspend or resume flushing (offline mode).
    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.send(Command::SetPaused(paused))
    }

    /// Flush the head of the buffer now, regardless of threshold.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Flush(reply))?;
        rx.await.map_err(|_| Error::QueueClosed)?
    }

    /// Current queue state, observed after every previously accepted command.
    pub async fn status(&self) -> Result<QueueStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply))?;
        rx.await.map_err(|_| Error::QueueClosed)
    }

    /// Copy of the buffered events in flush order.
    pub async fn snapshot(&self) -> Result<Vec<StoredEvent>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        rx.await.map_err(|_| Error::QueueClosed)
    }

    pub fn downgrade(&self) -> WeakEventQueue {
        WeakEventQueue {
            name: Arc::clone(&self.name),
            tx: self.tx.downgrade(),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::QueueClosed)
    }
}

impl WeakEventQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward a capacity signal if the queue is still alive.
    pub fn notify_capacity_available(&self) -> Result<()> {
        let tx = self.tx.upgrade().ok_or(Error::QueueClosed)?;
        tx.send(Command::CapacityAvailable)
            .map_err(|_| Error::QueueClosed)
    }
}

async fn run(name: Arc<str>, mut core: QueueCore, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Configure(config) => {
                if let Err(e) = core.configure(config) {
                    error!(queue = %name, error = %e, "Rejected queue configuration");
                }
            }
            Command::SetUploadHandler(handler) => core.set_upload_handler(handler),
            Command::SetRemoveHandler(handler) => core.set_remove_handler(handler),
            Command::AddEvent(event) => core.add_event(event),
            Command::AddEvents(events) => core.add_events(events),
            Command::CapacityAvailable => core.capacity_available(),
            Command::SetPaused(paused) => core.set_paused(paused),
            Command::TimerFired(generation) => core.timer_fired(generation),
            Command::Flush(reply) => {
                let _ = reply.send(core.flush());
            }
            Command::Status(reply) => {
                let _ = reply.send(core.status());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(core.events().to_vec());
            }
        }
    }

    debug!(queue = %name, pending = core.events().len(), "Event queue stopped");
}
