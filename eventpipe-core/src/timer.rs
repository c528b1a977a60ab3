//! One-shot timer service for the event queue
//!
//! A queue asks its [`Timer`] to fire once after the upload interval. Each
//! scheduling carries a generation number; the queue ignores fires whose
//! generation no longer matches its pending token, so a cancel that races a
//! fire already in flight is harmless.

use std::sync::Arc;
use std::time::Duration;

/// Schedules one-shot timers for a single queue.
pub trait Timer: Send {
    /// Arrange for the owner to be notified with `generation` after `after` elapses.
    fn schedule(&mut self, after: Duration, generation: u64) -> TimerToken;
}

/// Handle to a pending one-shot timer.
pub struct TimerToken {
    generation: u64,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerToken {
    pub fn new(generation: u64, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            generation,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A token with nothing to cancel (manual timers).
    pub fn detached(generation: u64) -> Self {
        Self {
            generation,
            cancel: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancel the timer if it has not fired yet.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerToken")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Timer backed by `tokio::time::sleep` tasks.
///
/// Must be used from within a tokio runtime.
pub struct TokioTimer {
    notify: Arc<dyn Fn(u64) + Send + Sync>,
}

impl TokioTimer {
    /// `notify` is called with the generation when a timer fires.
    pub fn new(notify: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            notify: Arc::new(notify),
        }
    }
}

impl Timer for TokioTimer {
    fn schedule(&mut self, after: Duration, generation: u64) -> TimerToken {
        let notify = Arc::clone(&self.notify);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            notify(generation);
        });
        TimerToken::new(generation, move || handle.abort())
    }
}

/// Timer that records schedules and fires only when told to.
///
/// Clones share state, so a test can keep one clone while the queue owns another.
#[derive(Clone, Default)]
pub struct ManualTimer {
    scheduled: Arc<std::sync::Mutex<Vec<(Duration, u64)>>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(interval, generation)` scheduled so far, oldest first.
    pub fn scheduled(&self) -> Vec<(Duration, u64)> {
        self.scheduled
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Generation of the most recent schedule, if any.
    pub fn last_generation(&self) -> Option<u64> {
        self.scheduled().last().map(|(_, generation)| *generation)
    }
}

impl Timer for ManualTimer {
    fn schedule(&mut self, after: Duration, generation: u64) -> TimerToken {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.push((after, generation));
        }
        TimerToken::detached(generation)
    }
}
