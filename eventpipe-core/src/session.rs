//! Session lifecycle tracking
//!
//! A session is a run of activity that ends once no event has been seen for
//! longer than the configured maximum session age. The manager keeps the
//! current [`Session`] in memory, persists it under [`SESSION_KEY`] after every
//! change, and emits `session_start` / `session_end` events through an event
//! sink so they travel the same pipeline as application events.
//!
//! ```text
//!             start() / activation, no fresh session
//! NoSession ─────────────────────────────────────────▶ Active(now, now)  + session_start
//!     │       start() / activation, fresh persisted session
//!     └──────────────────────────────────────────────▶ Active(id, last)  (silent)
//!
//! Active ── start_new_session() ──▶ Active(now, now)  + session_end @ last, session_start @ now
//! Active ── refresh_session(e) ───▶ Active(id, e.timestamp)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::KeyValueStore;
use crate::types::{Event, Session, SESSION_END_EVENT, SESSION_START_EVENT};

/// Durable key holding the serialized session record.
pub const SESSION_KEY: &str = "session";

/// Receives session-boundary events.
pub type SessionEventSink = Box<dyn Fn(Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    NoSession,
    Active(Session),
}

/// Tracks the current session and emits session-boundary events.
pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    max_session_age_ms: AtomicU64,
    state: Mutex<SessionState>,
    sink: RwLock<Option<SessionEventSink>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        max_session_age: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            max_session_age_ms: AtomicU64::new(duration_ms(max_session_age)),
            state: Mutex::new(SessionState::NoSession),
            sink: RwLock::new(None),
        }
    }

    /// Set where session-boundary events go.
    pub fn set_event_sink(&self, sink: SessionEventSink) {
        let mut slot = self.sink.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(sink);
    }

    /// Change the inactivity timeout. Takes effect at the next guard evaluation.
    pub fn set_max_session_age(&self, age: Duration) {
        self.max_session_age_ms
            .store(duration_ms(age), Ordering::SeqCst);
    }

    pub fn max_session_age(&self) -> Duration {
        Duration::from_millis(self.max_session_age_ms.load(Ordering::SeqCst))
    }

    /// Resume a fresh session or begin a new one.
    pub fn start(&self) {
        let emitted = {
            let mut state = self.lock_state();
            let now = self.clock.now();

            let candidate = match *state {
                SessionState::Active(session) => Some(session),
                SessionState::NoSession => self.load_persisted(),
            };

            match candidate {
                Some(session) if self.is_fresh(&session, now) => {
                    debug!(session_id = session.id, "Resumed session");
                    *state = SessionState::Active(session);
                    None
                }
                _ => {
                    let session = Session::started_at(now);
                    *state = SessionState::Active(session);
                    self.persist(&session);
                    info!(session_id = session.id, "Started session");
                    Some(Event::new(SESSION_START_EVENT, now))
                }
            }
        };

        if let Some(event) = emitted {
            self.emit(event);
        }
    }

    /// The application came to the foreground.
    pub fn on_activation(&self) {
        self.start();
    }

    /// Close the current session and begin a new one unconditionally.
    ///
    /// The `session_end` event carries the outgoing session's last activity
    /// time. With no outgoing session at all, only `session_start` is emitted.
    pub fn start_new_session(&self) {
        let emitted = {
            let mut state = self.lock_state();
            let now = self.clock.now();

            let outgoing = match *state {
                SessionState::Active(session) => Some(session),
                SessionState::NoSession => self.load_persisted(),
            };

            let session = Session::started_at(now);
            *state = SessionState::Active(session);
            self.persist(&session);

            info!(
                session_id = session.id,
                previous_session_id = outgoing.map(|s| s.id),
                "Started new session"
            );

            let mut events = Vec::with_capacity(2);
            if let Some(previous) = outgoing {
                events.push(Event::new(SESSION_END_EVENT, previous.last_event_timestamp));
            }
            events.push(Event::new(SESSION_START_EVENT, now));
            events
        };

        for event in emitted {
            self.emit(event);
        }
    }

    /// Record activity from `event` on the current session.
    ///
    /// Without a session in memory the persisted one is adopted, or a new
    /// record is created from the event's timestamp. No event is emitted.
    pub fn refresh_session(&self, event: &Event) {
        let mut state = self.lock_state();

        let mut session = match *state {
            SessionState::Active(session) => session,
            SessionState::NoSession => self
                .load_persisted()
                .unwrap_or_else(|| Session::started_at(event.timestamp)),
        };
        session.last_event_timestamp = event.timestamp;

        *state = SessionState::Active(session);
        self.persist(&session);
    }

    /// Id of the current session, if one is active.
    pub fn session_id(&self) -> Option<i64> {
        self.current().map(|s| s.id)
    }

    pub fn current(&self) -> Option<Session> {
        match *self.lock_state() {
            SessionState::Active(session) => Some(session),
            SessionState::NoSession => None,
        }
    }

    /// Force the session id, treating now as the last activity. No event is emitted.
    pub fn set_session_id(&self, id: i64) {
        let mut state = self.lock_state();
        let session = Session {
            id,
            last_event_timestamp: self.clock.now(),
        };
        *state = SessionState::Active(session);
        self.persist(&session);
        debug!(session_id = id, "Session id overridden");
    }

    /// Read the persisted record; an absent key or a bad payload both mean "no session".
    pub fn load_persisted(&self) -> Option<Session> {
        let bytes = match self.store.get(SESSION_KEY) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "Discarding undecodable session record");
                None
            }
        }
    }

    /// Whether `session` would be resumed by a `start()` right now.
    pub fn is_resumable(&self, session: &Session) -> bool {
        self.is_fresh(session, self.clock.now())
    }

    fn persist(&self, session: &Session) {
        let result = serde_json::to_vec(session)
            .map_err(crate::error::Error::from)
            .and_then(|bytes| self.store.set(SESSION_KEY, &bytes));

        if let Err(e) = result {
            warn!(session_id = session.id, error = %e, "Failed to persist session");
        }
    }

    fn is_fresh(&self, session: &Session, now: i64) -> bool {
        let max_age_ms = self.max_session_age_ms.load(Ordering::SeqCst);
        let idle_ms = now
            .saturating_sub(session.last_event_timestamp)
            .saturating_mul(1000);
        idle_ms < i64::try_from(max_age_ms).unwrap_or(i64::MAX)
    }

    fn emit(&self, event: Event) {
        let sink = self.sink.read().unwrap_or_else(|e| e.into_inner());
        match sink.as_ref() {
            Some(sink) => sink(event),
            None => debug!(event = %event.name, "No session event sink, dropping event"),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
