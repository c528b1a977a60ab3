//! Single-threaded batching state machine
//!
//! [`QueueCore`] owns the sorted buffer and every piece of derived state
//! (timer slot, timer-fired flag, dropped counter, pause flag, config). It is
//! not thread-safe on purpose: [`EventQueue`](super::EventQueue) drives it
//! from one worker task, and tests drive it directly.

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::timer::{Timer, TimerToken};
use crate::types::{ContextId, Event, QueueConfig, StoredEvent, Telemetry};

/// Called with a candidate batch; returns `true` if the batch was handed off for sending.
///
/// Runs on the queue's worker. It must return quickly and must not wait on the
/// same queue.
pub type UploadHandler = Box<dyn FnMut(Vec<Event>, ContextId, Telemetry) -> bool + Send>;

/// Called with events evicted by overflow. Metrics only.
pub type RemoveHandler = Box<dyn FnMut(&[StoredEvent]) + Send>;

/// Result of a single flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing buffered
    Empty,
    /// Flushing is suspended by the pause flag
    Paused,
    /// The upload handler took `events` events off the head of the buffer
    Accepted { events: usize },
    /// The upload handler declined; the buffer is unchanged
    Rejected,
}

/// Point-in-time view of a queue's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStatus {
    /// Events currently buffered
    pub pending: usize,
    /// Events evicted since the last accepted batch
    pub dropped_since_last_batch: usize,
    /// A one-shot upload timer is scheduled
    pub timer_pending: bool,
    /// The last timer fire has not been satisfied by an accepted flush yet
    pub timer_fired: bool,
    pub paused: bool,
    pub configured: bool,
}

/// Batching engine state.
pub struct QueueCore {
    config: Option<QueueConfig>,
    /// Sorted ascending by timestamp; equal timestamps keep arrival order.
    events: Vec<StoredEvent>,
    dropped_events: usize,
    timer_fired: bool,
    timer_token: Option<TimerToken>,
    next_generation: u64,
    paused: bool,
    timer: Box<dyn Timer>,
    upload_handler: Option<UploadHandler>,
    remove_handler: Option<RemoveHandler>,
}

impl QueueCore {
    /// Create an unconfigured, empty core. It buffers but never flushes until configured.
    pub fn new(timer: Box<dyn Timer>) -> Self {
        Self {
            config: None,
            events: Vec::new(),
            dropped_events: 0,
            timer_fired: false,
            timer_token: None,
            next_generation: 0,
            paused: false,
            timer,
            upload_handler: None,
            remove_handler: None,
        }
    }

    pub fn set_upload_handler(&mut self, handler: UploadHandler) {
        self.upload_handler = Some(handler);
    }

    pub fn set_remove_handler(&mut self, handler: RemoveHandler) {
        self.remove_handler = Some(handler);
    }

    /// Install or replace the configuration and re-evaluate capacity and triggers.
    ///
    /// An invalid config is rejected and the previous one stays in place.
    pub fn configure(&mut self, config: QueueConfig) -> Result<()> {
        config.validate()?;
        debug!(
            max_batch_size = config.max_batch_size,
            upload_interval_secs = config.upload_interval.as_secs(),
            upload_threshold = config.upload_threshold,
            max_events = config.max_events,
            "Queue configured"
        );
        self.config = Some(config);
        self.on_new_events();
        Ok(())
    }

    pub fn add_event(&mut self, event: StoredEvent) {
        self.insert(event);
        self.on_new_events();
    }

    pub fn add_events(&mut self, events: Vec<StoredEvent>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            self.insert(event);
        }
        self.on_new_events();
    }

    /// The sender freed capacity; retry whatever flush is owed.
    pub fn capacity_available(&mut self) {
        self.evaluate_triggers();
    }

    /// Suspend or resume flushing. Resuming re-evaluates triggers immediately.
    pub fn set_paused(&mut self, paused: bool) {
        let resumed = self.paused && !paused;
        self.paused = paused;
        if resumed {
            self.evaluate_triggers();
        }
    }

    /// A one-shot timer fired. Stale generations are ignored.
    pub fn timer_fired(&mut self, generation: u64) {
        match &self.timer_token {
            Some(token) if token.generation() == generation => {}
            _ => {
                debug!(generation, "Ignoring stale timer fire");
                return;
            }
        }

        self.timer_token = None;
        self.timer_fired = true;
        self.attempt_flush();
        self.schedule_timer_if_needed();
    }

    /// Flush the head of the buffer regardless of threshold.
    ///
    /// Returns [`Error::NotConfigured`] if no configuration was ever installed.
    pub fn flush(&mut self) -> Result<FlushOutcome> {
        let config = self.config.ok_or(Error::NotConfigured)?;
        Ok(self.flush_with(config))
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.events.len(),
            dropped_since_last_batch: self.dropped_events,
            timer_pending: self.timer_token.is_some(),
            timer_fired: self.timer_fired,
            paused: self.paused,
            configured: self.config.is_some(),
        }
    }

    /// Buffered events in flush order.
    pub fn events(&self) -> &[StoredEvent] {
        &self.events
    }

    pub fn config(&self) -> Option<&QueueConfig> {
        self.config.as_ref()
    }

    fn insert(&mut self, event: StoredEvent) {
        let timestamp = event.timestamp();
        let index = self
            .events
            .partition_point(|existing| existing.timestamp() <= timestamp);
        self.events.insert(index, event);
    }

    fn on_new_events(&mut self) {
        self.strip_events_if_needed();
        self.schedule_timer_if_needed();
        self.flush_if_needed_by_count();
    }

    fn evaluate_triggers(&mut self) {
        if self.timer_fired {
            self.attempt_flush();
        } else {
            self.flush_if_needed_by_count();
        }
    }

    fn strip_events_if_needed(&mut self) {
        let Some(config) = self.config else {
            return;
        };
        if self.events.len() <= config.max_events {
            return;
        }

        let evicted = self.events.split_off(config.max_events);
        self.dropped_events += evicted.len();

        warn!(
            evicted = evicted.len(),
            max_events = config.max_events,
            dropped_since_last_batch = self.dropped_events,
            "Event buffer over capacity, dropping tail"
        );

        if let Some(handler) = self.remove_handler.as_mut() {
            handler(&evicted);
        }
    }

    fn schedule_timer_if_needed(&mut self) {
        if self.timer_token.is_some() || self.events.is_empty() {
            return;
        }
        let Some(config) = self.config else {
            return;
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        self.timer_token = Some(self.timer.schedule(config.upload_interval, generation));
        debug!(generation, "Scheduled upload timer");
    }

    fn flush_if_needed_by_count(&mut self) {
        let Some(config) = self.config else {
            return;
        };
        if self.events.len() < config.upload_threshold {
            return;
        }
        self.flush_with(config);
    }

    fn attempt_flush(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "Flush triggered on an unconfigured queue");
        }
    }

    fn flush_with(&mut self, config: QueueConfig) -> FlushOutcome {
        if self.paused {
            return FlushOutcome::Paused;
        }
        let Some(context_id) = self.events.first().map(|e| e.context_id) else {
            return FlushOutcome::Empty;
        };

        let context_end = self
            .events
            .iter()
            .position(|e| e.context_id != context_id)
            .unwrap_or(usize::MAX);
        let count = config
            .max_batch_size
            .min(self.events.len())
            .min(context_end);

        let telemetry = Telemetry {
            events_in_batch: count,
            batch_load: count as f64 / config.max_batch_size as f64,
            events_dropped_since_last_batch: self.dropped_events,
        };

        let batch: Vec<Event> = self.events[..count]
            .iter()
            .map(|stored| stored.event.clone())
            .collect();

        let accepted = match self.upload_handler.as_mut() {
            Some(handler) => handler(batch, context_id, telemetry),
            None => false,
        };

        if !accepted {
            debug!(
                context_id = %context_id,
                events = count,
                pending = self.events.len(),
                "Batch rejected, keeping buffer"
            );
            return FlushOutcome::Rejected;
        }

        self.events.drain(..count);
        self.dropped_events = 0;
        self.timer_fired = false;

        if self.events.is_empty() {
            if let Some(token) = self.timer_token.take() {
                token.cancel();
            }
        }

        debug!(
            context_id = %context_id,
            events = count,
            remaining = self.events.len(),
            "Batch accepted"
        );
        FlushOutcome::Accepted { events: count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTimer;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Upload {
        timestamps: Vec<i64>,
        context_id: ContextId,
        telemetry: Telemetry,
    }

    struct Harness {
        core: QueueCore,
        timer: ManualTimer,
        uploads: Arc<Mutex<Vec<Upload>>>,
        evicted: Arc<Mutex<Vec<i64>>>,
        accept: Arc<Mutex<bool>>,
    }

    impl Harness {
        fn new() -> Self {
            let timer = ManualTimer::new();
            let mut core = QueueCore::new(Box::new(timer.clone()));
            let uploads = Arc::new(Mutex::new(Vec::new()));
            let evicted = Arc::new(Mutex::new(Vec::new()));
            let accept = Arc::new(Mutex::new(true));

            let sink = Arc::clone(&uploads);
            let verdict = Arc::clone(&accept);
            core.set_upload_handler(Box::new(move |events, context_id, telemetry| {
                sink.lock().unwrap().push(Upload {
                    timestamps: events.iter().map(|e| e.timestamp).collect(),
                    context_id,
                    telemetry,
                });
                *verdict.lock().unwrap()
            }));

            let removed = Arc::clone(&evicted);
            core.set_remove_handler(Box::new(move |events: &[StoredEvent]| {
                removed
                    .lock()
                    .unwrap()
                    .extend(events.iter().map(|e| e.timestamp()));
            }));

            Self {
                core,
                timer,
                uploads,
                evicted,
                accept,
            }
        }

        fn configured(config: QueueConfig) -> Self {
            let mut harness = Self::new();
            harness.core.configure(config).unwrap();
            harness
        }

        fn set_accept(&self, accept: bool) {
            *self.accept.lock().unwrap() = accept;
        }

        fn uploads(&self) -> Vec<Upload> {
            self.uploads.lock().unwrap().clone()
        }

        fn evicted(&self) -> Vec<i64> {
            self.evicted.lock().unwrap().clone()
        }

        fn buffered(&self) -> Vec<i64> {
            self.core.events().iter().map(|e| e.timestamp()).collect()
        }

        fn fire_timer(&mut self) {
            let generation = self.timer.last_generation().expect("no timer scheduled");
            self.core.timer_fired(generation);
        }
    }

    fn config(max_batch_size: usize, threshold: usize, max_events: usize) -> QueueConfig {
        QueueConfig {
            max_batch_size,
            upload_interval: Duration::from_secs(60),
            upload_threshold: threshold,
            max_events,
        }
    }

    fn stored(timestamp: i64, context_id: ContextId) -> StoredEvent {
        StoredEvent::new(Event::new(format!("e{timestamp}"), timestamp), context_id)
    }

    #[test]
    fn test_insert_keeps_timestamp_order_and_fifo_ties() {
        let mut h = Harness::configured(config(10, 100, 100));
        let ctx = ContextId::new();

        for ts in [5, 1, 3, 3, 9, 1] {
            h.core.add_event(stored(ts, ctx));
        }

        assert_eq!(h.buffered(), vec![1, 1, 3, 3, 5, 9]);

        // Equal timestamps keep arrival order
        h.core
            .add_event(StoredEvent::new(Event::new("first", 7), ctx));
        h.core
            .add_event(StoredEvent::new(Event::new("second", 7), ctx));
        let names: Vec<_> = h
            .core
            .events()
            .iter()
            .filter(|e| e.timestamp() == 7)
            .map(|e| e.event.name.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(h.buffered(), vec![1, 1, 3, 3, 5, 7, 7, 9]);
    }

    #[test]
    fn test_unconfigured_queue_buffers_without_flushing() {
        let mut h = Harness::new();
        let ctx = ContextId::new();
        for ts in 0..50 {
            h.core.add_event(stored(ts, ctx));
        }

        assert_eq!(h.core.events().len(), 50);
        assert!(h.uploads().is_empty());
        assert!(h.timer.scheduled().is_empty());
        assert!(matches!(h.core.flush(), Err(Error::NotConfigured)));
    }

    #[test]
    fn test_overflow_evicts_sorted_tail() {
        let mut h = Harness::configured(config(10, 100, 5));
        let ctx = ContextId::new();

        for ts in 1..=8 {
            h.core.add_event(stored(ts, ctx));
        }

        assert_eq!(h.buffered(), vec![1, 2, 3, 4, 5]);
        assert_eq!(h.evicted(), vec![6, 7, 8]);
        assert_eq!(h.core.status().dropped_since_last_batch, 3);
    }

    #[test]
    fn test_overflow_victim_is_sort_position_not_arrival() {
        let mut h = Harness::configured(config(10, 100, 3));
        let ctx = ContextId::new();

        for ts in [10, 20, 30] {
            h.core.add_event(stored(ts, ctx));
        }
        // Arrives last but sorts first, so the newest timestamp is evicted
        h.core.add_event(stored(5, ctx));

        assert_eq!(h.buffered(), vec![5, 10, 20]);
        assert_eq!(h.evicted(), vec![30]);
    }

    #[test]
    fn test_batched_insert_evicts_once() {
        let mut h = Harness::configured(config(10, 100, 4));
        let ctx = ContextId::new();

        h.core
            .add_events((1..=6).rev().map(|ts| stored(ts, ctx)).collect());

        assert_eq!(h.buffered(), vec![1, 2, 3, 4]);
        assert_eq!(h.evicted(), vec![5, 6]);
    }

    #[test]
    fn test_threshold_triggers_single_flush() {
        let mut h = Harness::configured(config(10, 3, 100));
        let ctx = ContextId::new();

        h.core.add_event(stored(1, ctx));
        h.core.add_event(stored(2, ctx));
        assert!(h.uploads().is_empty());

        h.core.add_event(stored(3, ctx));
        let uploads = h.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].timestamps, vec![1, 2, 3]);
        assert!(h.core.events().is_empty());
    }

    #[test]
    fn test_flush_stops_at_context_boundary() {
        let mut h = Harness::configured(config(10, 100, 100));
        let a = ContextId::new();
        let b = ContextId::new();

        h.core.add_events(vec![
            stored(1, a),
            stored(2, a),
            stored(3, b),
            stored(4, a),
        ]);
        let outcome = h.core.flush().unwrap();

        assert_eq!(outcome, FlushOutcome::Accepted { events: 2 });
        let uploads = h.uploads();
        assert_eq!(uploads[0].timestamps, vec![1, 2]);
        assert_eq!(uploads[0].context_id, a);
        assert_eq!(h.buffered(), vec![3, 4]);
    }

    #[test]
    fn test_flush_respects_max_batch_size_and_reports_load() {
        let mut h = Harness::configured(config(4, 100, 100));
        let ctx = ContextId::new();
        h.core.add_events((1..=6).map(|ts| stored(ts, ctx)).collect());

        h.core.flush().unwrap();
        h.core.flush().unwrap();

        let uploads = h.uploads();
        assert_eq!(uploads[0].timestamps, vec![1, 2, 3, 4]);
        assert_eq!(uploads[0].telemetry.batch_load, 1.0);
        assert_eq!(uploads[1].timestamps, vec![5, 6]);
        assert_eq!(uploads[1].telemetry.events_in_batch, 2);
        assert_eq!(uploads[1].telemetry.batch_load, 0.5);
    }

    #[test]
    fn test_flush_empty_buffer_is_noop() {
        let mut h = Harness::configured(config(4, 100, 100));
        assert_eq!(h.core.flush().unwrap(), FlushOutcome::Empty);
        assert!(h.uploads().is_empty());
    }

    #[test]
    fn test_accepted_flush_resets_dropped_counter() {
        let mut h = Harness::configured(config(10, 100, 2));
        let ctx = ContextId::new();
        h.core.add_events((1..=5).map(|ts| stored(ts, ctx)).collect());

        h.core.flush().unwrap();

        let uploads = h.uploads();
        assert_eq!(uploads[0].telemetry.events_dropped_since_last_batch, 3);
        assert_eq!(h.core.status().dropped_since_last_batch, 0);
    }

    #[test]
    fn test_rejected_flush_keeps_buffer_and_retries_identically() {
        let mut h = Harness::configured(config(10, 2, 3));
        let ctx = ContextId::new();
        h.set_accept(false);

        h.core.add_events((1..=4).map(|ts| stored(ts, ctx)).collect());
        assert_eq!(h.buffered(), vec![1, 2, 3]);
        assert_eq!(h.uploads().len(), 1);

        h.set_accept(true);
        h.core.capacity_available();

        let uploads = h.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0], uploads[1]);
        assert_eq!(uploads[1].telemetry.events_dropped_since_last_batch, 1);
        assert!(h.core.events().is_empty());
    }

    #[test]
    fn test_timer_schedules_once_and_fires_unconditionally() {
        let mut h = Harness::configured(config(10, 100, 100));
        let ctx = ContextId::new();

        h.core.add_event(stored(1, ctx));
        h.core.add_event(stored(2, ctx));
        assert_eq!(h.timer.scheduled().len(), 1);
        assert_eq!(h.timer.scheduled()[0].0, Duration::from_secs(60));
        assert!(h.core.status().timer_pending);

        h.fire_timer();

        assert_eq!(h.uploads()[0].timestamps, vec![1, 2]);
        let status = h.core.status();
        assert!(!status.timer_fired);
        assert!(!status.timer_pending);
    }

    #[test]
    fn test_rejected_timer_flush_stays_owed() {
        let mut h = Harness::configured(config(10, 100, 100));
        let ctx = ContextId::new();
        h.core.add_event(stored(1, ctx));
        h.set_accept(false);

        h.fire_timer();
        assert_eq!(h.uploads().len(), 1);
        assert!(h.core.status().timer_fired);
        // Timer re-armed for the remaining event
        assert_eq!(h.timer.scheduled().len(), 2);
        assert!(h.core.status().timer_pending);

        // Capacity signal retries below threshold because the timer already fired
        h.set_accept(true);
        h.core.capacity_available();

        assert_eq!(h.uploads().len(), 2);
        assert!(h.core.events().is_empty());
        assert!(!h.core.status().timer_fired);
        assert!(!h.core.status().timer_pending);
    }

    #[test]
    fn test_rejected_timer_flush_retried_on_next_fire() {
        let mut h = Harness::configured(config(10, 100, 100));
        let ctx = ContextId::new();
        h.core.add_events(vec![stored(1, ctx), stored(2, ctx)]);
        h.set_accept(false);

        h.fire_timer();
        h.set_accept(true);
        h.fire_timer();

        let uploads = h.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0], uploads[1]);
        assert!(h.core.events().is_empty());
        assert!(!h.core.status().timer_fired);
        assert!(!h.core.status().timer_pending);
    }

    #[test]
    fn test_capacity_signal_without_timer_is_threshold_gated() {
        let mut h = Harness::configured(config(10, 3, 100));
        let ctx = ContextId::new();
        h.core.add_event(stored(1, ctx));

        h.core.capacity_available();

        assert!(h.uploads().is_empty());
    }

    #[test]
    fn test_stale_timer_generation_ignored() {
        let mut h = Harness::configured(config(10, 100, 100));
        let ctx = ContextId::new();
        h.core.add_event(stored(1, ctx));

        h.core.timer_fired(999);

        assert!(h.uploads().is_empty());
        assert!(!h.core.status().timer_fired);
    }

    #[test]
    fn test_pause_suppresses_flush_but_not_insertion() {
        let mut h = Harness::configured(config(10, 2, 3));
        let ctx = ContextId::new();
        h.core.set_paused(true);

        h.core.add_events((1..=5).map(|ts| stored(ts, ctx)).collect());
        h.fire_timer();

        assert!(h.uploads().is_empty());
        assert_eq!(h.buffered(), vec![1, 2, 3]);
        assert_eq!(h.evicted(), vec![4, 5]);
        assert_eq!(h.core.flush().unwrap(), FlushOutcome::Paused);

        h.core.set_paused(false);

        assert_eq!(h.uploads().len(), 1);
        assert!(h.core.events().is_empty());
    }

    #[test]
    fn test_reconfigure_reevaluates_pending_events() {
        let mut h = Harness::configured(config(10, 100, 100));
        let ctx = ContextId::new();
        h.core.add_events((1..=5).map(|ts| stored(ts, ctx)).collect());
        assert!(h.uploads().is_empty());

        h.core.configure(config(10, 3, 4)).unwrap();

        assert_eq!(h.evicted(), vec![5]);
        assert_eq!(h.uploads()[0].timestamps, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut h = Harness::configured(config(10, 3, 100));
        let ctx = ContextId::new();
        h.core.add_event(stored(1, ctx));

        assert!(matches!(
            h.core.configure(config(0, 1, 100)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            h.core.configure(config(10, 0, 100)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            h.core.configure(config(10, 5, 4)),
            Err(Error::Config(_))
        ));

        // Previous config still governs flushing
        assert_eq!(h.core.config(), Some(&config(10, 3, 100)));
        assert_eq!(h.core.flush().unwrap(), FlushOutcome::Accepted { events: 1 });
        assert_eq!(h.uploads()[0].telemetry.batch_load, 0.1);
    }

    #[test]
    fn test_missing_upload_handler_counts_as_rejection() {
        let mut core = QueueCore::new(Box::new(ManualTimer::new()));
        core.configure(config(10, 100, 100)).unwrap();
        core.add_event(stored(1, ContextId::new()));

        assert_eq!(core.flush().unwrap(), FlushOutcome::Rejected);
        assert_eq!(core.events().len(), 1);
    }

    #[test]
    fn test_end_to_end_threshold_scenario() {
        let mut h = Harness::configured(config(2, 3, 10));
        let ctx = ContextId::new();

        h.core.add_event(stored(100, ctx));
        h.core.add_event(stored(200, ctx));
        h.core.add_event(stored(300, ctx));

        let uploads = h.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].timestamps, vec![100, 200]);
        assert_eq!(uploads[0].telemetry.batch_load, 1.0);
        assert_eq!(h.buffered(), vec![300]);
        assert!(h.core.status().timer_pending);
    }

    #[test]
    fn test_buffer_invariants_hold_for_mixed_inserts() {
        let mut h = Harness::configured(config(3, 1000, 7));
        let ctx = ContextId::new();
        let mut seed: i64 = 17;

        for _ in 0..200 {
            seed = (seed * 1_103_515_245 + 12_345) % 2_147_483_648;
            h.core.add_event(stored(seed % 50, ctx));

            let buffered = h.buffered();
            assert!(buffered.len() <= 7);
            assert!(buffered.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
