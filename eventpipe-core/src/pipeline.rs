//! Composition root
//!
//! A [`Pipeline`] wires one [`SessionManager`], one [`ContextStore`] and an
//! [`EventQueue`] + [`BatchSender`] pair per destination. Tracked events are
//! stamped with the current context id and fanned out to every destination
//! queue. Each queue's upload callback hands batches to a spawned delivery
//! task, bounded by the destination's `max_concurrent_sends`, and the task
//! signals the queue once the send slot frees up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, DestinationConfig};
use crate::context::ContextStore;
use crate::db::KeyValueStore;
use crate::error::{Error, Result};
use crate::queue::{EventQueue, FlushOutcome, QueueStatus, WeakEventQueue};
use crate::sender::{
    BatchCommon, BatchPayload, BatchSender, HttpTransport, JsonStack, ReqwestTransport, Stack,
};
use crate::session::SessionManager;
use crate::types::{ContextId, Event, Properties, QueueConfig, StoredEvent, Telemetry};

/// First retry delay for transient send failures; doubles per attempt.
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on the retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How often [`Pipeline::drain`] re-checks for outstanding work.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Delivery counters for one destination
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Batches the server acknowledged
    pub batches_sent: usize,
    /// Events in acknowledged batches
    pub events_sent: usize,
    /// Batches abandoned after a permanent error or exhausted retries
    pub batches_failed: usize,
    /// Events in abandoned batches
    pub events_failed: usize,
    /// Flush offers declined because every send slot was busy
    pub flushes_deferred: usize,
    /// Events evicted from the queue by overflow
    pub events_evicted: usize,
}

#[derive(Debug, Default)]
struct DeliveryCounters {
    batches_sent: AtomicUsize,
    events_sent: AtomicUsize,
    batches_failed: AtomicUsize,
    events_failed: AtomicUsize,
    flushes_deferred: AtomicUsize,
    events_evicted: AtomicUsize,
}

impl DeliveryCounters {
    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            flushes_deferred: self.flushes_deferred.load(Ordering::Relaxed),
            events_evicted: self.events_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Everything needed to build one destination.
pub struct DestinationSpec {
    pub name: String,
    pub url: String,
    pub api_key: Option<String>,
    pub max_concurrent_sends: usize,
    pub max_retries: usize,
    pub transport: Arc<dyn HttpTransport>,
}

impl DestinationSpec {
    /// Build a spec from config, using a `reqwest` transport.
    pub fn from_config(config: &DestinationConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            max_concurrent_sends: config.max_concurrent_sends,
            max_retries: config.max_retries,
            transport: Arc::new(transport),
        })
    }
}

/// State shared between a destination's upload callback and its delivery tasks.
struct Delivery {
    name: String,
    sender: BatchSender,
    in_flight: AtomicUsize,
    max_concurrent_sends: usize,
    max_retries: usize,
    counters: DeliveryCounters,
}

struct Destination {
    queue: EventQueue,
    delivery: Arc<Delivery>,
}

/// Point-in-time view of one destination.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationStatus {
    pub name: String,
    pub url: Option<String>,
    pub queue: QueueStatus,
    pub in_flight: usize,
    pub stats: DeliveryStats,
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    queue_config: QueueConfig,
    max_session_age: Duration,
    stack: Arc<dyn Stack>,
    context: Value,
    destinations: Vec<DestinationSpec>,
}

impl PipelineBuilder {
    pub fn new(store: Arc<dyn KeyValueStore>, queue_config: QueueConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            queue_config,
            max_session_age: Duration::from_millis(crate::config::DEFAULT_MAX_SESSION_AGE_MS),
            stack: Arc::new(JsonStack),
            context: Value::Object(Default::default()),
            destinations: Vec::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_session_age(mut self, age: Duration) -> Self {
        self.max_session_age = age;
        self
    }

    pub fn stack(mut self, stack: Arc<dyn Stack>) -> Self {
        self.stack = stack;
        self
    }

    /// Initial context snapshot.
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn destination(mut self, spec: DestinationSpec) -> Self {
        self.destinations.push(spec);
        self
    }

    /// Spawn the destination queues. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Pipeline> {
        self.queue_config.validate()?;

        let instance_id = Uuid::new_v4();
        let contexts = Arc::new(ContextStore::new(self.context));
        let session = Arc::new(SessionManager::new(
            self.store,
            Arc::clone(&self.clock),
            self.max_session_age,
        ));

        let mut destinations = Vec::with_capacity(self.destinations.len());
        for spec in self.destinations {
            if spec.max_concurrent_sends == 0 {
                return Err(Error::Config(format!(
                    "destination {}: max_concurrent_sends must be at least 1",
                    spec.name
                )));
            }

            let sender = BatchSender::new(spec.transport, Arc::clone(&self.clock));
            sender.set_url(spec.url);
            if let Some(key) = spec.api_key {
                sender.set_api_key(key);
            }

            let delivery = Arc::new(Delivery {
                name: spec.name.clone(),
                sender,
                in_flight: AtomicUsize::new(0),
                max_concurrent_sends: spec.max_concurrent_sends,
                max_retries: spec.max_retries,
                counters: DeliveryCounters::default(),
            });

            let queue = EventQueue::spawn(spec.name);
            queue.set_upload_handler(upload_handler(
                Arc::clone(&delivery),
                queue.downgrade(),
                Arc::clone(&self.stack),
                Arc::clone(&contexts),
                instance_id,
            ))?;

            let evictions = Arc::clone(&delivery);
            queue.set_remove_handler(Box::new(move |evicted: &[StoredEvent]| {
                evictions
                    .counters
                    .events_evicted
                    .fetch_add(evicted.len(), Ordering::Relaxed);
            }))?;
            queue.configure(self.queue_config)?;

            destinations.push(Destination { queue, delivery });
        }

        let sink_queues: Vec<EventQueue> = destinations.iter().map(|d| d.queue.clone()).collect();
        let sink_contexts = Arc::clone(&contexts);
        session.set_event_sink(Box::new(move |event| {
            let context_id = sink_contexts.current_id();
            for queue in &sink_queues {
                if let Err(e) = queue.add_event(StoredEvent::new(event.clone(), context_id)) {
                    warn!(queue = queue.name(), error = %e, "Dropped session event");
                }
            }
        }));

        info!(
            instance_id = %instance_id,
            destinations = destinations.len(),
            "Pipeline started"
        );

        Ok(Pipeline {
            destinations,
            session,
            contexts,
            clock: self.clock,
        })
    }
}

/// Event tracking front end over one or more destinations.
pub struct Pipeline {
    destinations: Vec<Destination>,
    session: Arc<SessionManager>,
    contexts: Arc<ContextStore>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn builder(store: Arc<dyn KeyValueStore>, queue_config: QueueConfig) -> PipelineBuilder {
        PipelineBuilder::new(store, queue_config)
    }

    /// Build a pipeline from a validated configuration.
    pub fn from_config(config: &Config, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        config.validate()?;

        let mut builder = Self::builder(store, config.queue.to_queue_config())
            .max_session_age(config.session.max_session_age());
        for destination in &config.destinations {
            builder = builder.destination(DestinationSpec::from_config(destination)?);
        }
        builder.build()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    /// Begin or resume a session.
    pub fn start(&self) {
        self.session.start();
    }

    pub fn on_activation(&self) {
        self.session.on_activation();
    }

    pub fn start_new_session(&self) {
        self.session.start_new_session();
    }

    /// Track an event timestamped now.
    pub fn track(&self, name: impl Into<String>, properties: Properties) -> Result<()> {
        let event = Event::new(name, self.clock.now()).with_properties(properties);
        self.track_event(event)
    }

    /// Track an event that already carries its timestamp.
    pub fn track_event(&self, event: Event) -> Result<()> {
        self.session.refresh_session(&event);
        let context_id = self.contexts.current_id();

        // A closed queue must not starve the remaining destinations
        let mut first_error = None;
        for destination in &self.destinations {
            if let Err(e) = destination
                .queue
                .add_event(StoredEvent::new(event.clone(), context_id))
            {
                warn!(queue = destination.queue.name(), error = %e, "Dropped tracked event");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Make `context` current for subsequently tracked events.
    pub fn update_context(&self, context: Value) -> ContextId {
        self.contexts.update_context(context)
    }

    /// Pause or resume uploads on every destination.
    pub fn set_offline(&self, offline: bool) -> Result<()> {
        info!(offline, "Offline mode changed");
        for destination in &self.destinations {
            destination.queue.set_paused(offline)?;
        }
        Ok(())
    }

    /// Replace the API credential on every destination.
    pub fn set_api_key(&self, api_key: &str) {
        for destination in &self.destinations {
            destination.delivery.sender.set_api_key(api_key);
        }
    }

    /// Offer batches on every destination until each one is empty or declines.
    ///
    /// Returns the number of events handed to delivery.
    pub async fn flush_all(&self) -> Result<usize> {
        let mut handed_off = 0;
        for destination in &self.destinations {
            loop {
                match destination.queue.flush().await? {
                    FlushOutcome::Accepted { events } => handed_off += events,
                    FlushOutcome::Empty | FlushOutcome::Paused | FlushOutcome::Rejected => break,
                }
            }
        }
        Ok(handed_off)
    }

    /// Forget context snapshots no queued event refers to.
    pub async fn prune_contexts(&self) -> Result<usize> {
        let mut referenced = Vec::new();
        for destination in &self.destinations {
            referenced.extend(
                destination
                    .queue
                    .snapshot()
                    .await?
                    .into_iter()
                    .map(|e| e.context_id),
            );
        }
        Ok(self.contexts.prune(referenced.iter()))
    }

    /// Flush and wait for in-flight sends until everything is delivered or
    /// `timeout` elapses. Returns `true` when fully drained.
    pub async fn drain(&self, timeout: Duration) -> Result<bool> {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                self.flush_all().await?;

                let mut idle = true;
                for destination in &self.destinations {
                    let pending = destination.queue.status().await?.pending;
                    let in_flight = destination.delivery.in_flight.load(Ordering::SeqCst);
                    if pending > 0 || in_flight > 0 {
                        idle = false;
                    }
                }
                if idle {
                    return Ok::<_, Error>(());
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        match drained {
            Ok(result) => {
                result?;
                self.prune_contexts().await?;
                Ok(true)
            }
            Err(_) => {
                warn!(?timeout, "Drain timed out with events outstanding");
                Ok(false)
            }
        }
    }

    /// Drain with a deadline, then release the queues.
    pub async fn shutdown(self, timeout: Duration) -> Result<bool> {
        let drained = self.drain(timeout).await?;
        info!(drained, "Pipeline shut down");
        Ok(drained)
    }

    pub async fn status(&self) -> Result<Vec<DestinationStatus>> {
        let mut statuses = Vec::with_capacity(self.destinations.len());
        for destination in &self.destinations {
            let queue = destination.queue.status().await?;
            statuses.push(DestinationStatus {
                name: destination.delivery.name.clone(),
                url: destination.delivery.sender.url(),
                queue,
                in_flight: destination.delivery.in_flight.load(Ordering::SeqCst),
                stats: destination.delivery.counters.snapshot(),
            });
        }
        Ok(statuses)
    }

    /// Delivery counters keyed by destination name, in configuration order.
    pub fn stats(&self) -> Vec<(String, DeliveryStats)> {
        self.destinations
            .iter()
            .map(|d| (d.delivery.name.clone(), d.delivery.counters.snapshot()))
            .collect()
    }
}

fn upload_handler(
    delivery: Arc<Delivery>,
    queue: WeakEventQueue,
    stack: Arc<dyn Stack>,
    contexts: Arc<ContextStore>,
    instance_id: Uuid,
) -> crate::queue::UploadHandler {
    Box::new(
        move |events: Vec<Event>, context_id: ContextId, telemetry: Telemetry| {
            if delivery.in_flight.load(Ordering::SeqCst) >= delivery.max_concurrent_sends {
                delivery
                    .counters
                    .flushes_deferred
                    .fetch_add(1, Ordering::Relaxed);
                debug!(destination = %delivery.name, "All send slots busy, deferring batch");
                return false;
            }

            let context = contexts.snapshot(&context_id).unwrap_or_else(|| {
                warn!(context_id = %context_id, "Missing context snapshot, sending empty context");
                Value::Null
            });
            let common = BatchCommon::new(instance_id, context_id, telemetry);
            let payload = stack.make_batch(&common, &context, &events);

            delivery.in_flight.fetch_add(1, Ordering::SeqCst);
            let delivery = Arc::clone(&delivery);
            let queue = queue.clone();
            tokio::spawn(async move {
                deliver(&delivery, payload.as_ref()).await;
                delivery.in_flight.fetch_sub(1, Ordering::SeqCst);
                if queue.notify_capacity_available().is_err() {
                    debug!(queue = queue.name(), "Queue closed before send completed");
                }
            });
            true
        },
    )
}

/// Send one batch, retrying transient failures with exponential backoff.
async fn deliver(delivery: &Delivery, payload: &dyn BatchPayload) {
    let events = payload.event_count();
    let mut delay = INITIAL_RETRY_DELAY;

    for attempt in 0..=delivery.max_retries {
        if attempt > 0 {
            debug!(
                destination = %delivery.name,
                attempt = attempt + 1,
                max_attempts = delivery.max_retries + 1,
                ?delay,
                "Retrying batch"
            );
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
        }

        match delivery.sender.send_batch(payload).await {
            Ok(()) => {
                let counters = &delivery.counters;
                counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                counters.events_sent.fetch_add(events, Ordering::Relaxed);
                return;
            }
            Err(e) if e.is_transient() => {
                warn!(destination = %delivery.name, error = %e, "Transient error sending batch");
            }
            Err(e) => {
                warn!(destination = %delivery.name, error = %e, "Dropping batch");
                break;
            }
        }
    }

    let counters = &delivery.counters;
    counters.batches_failed.fetch_add(1, Ordering::Relaxed);
    counters.events_failed.fetch_add(events, Ordering::Relaxed);
}
