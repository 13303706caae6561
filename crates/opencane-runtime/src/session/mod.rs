//! Per-device session state and sequence bookkeeping.
//!
//! The manager is the single writer for every session's seq counters: all
//! mutation goes through one mutex, so concurrent callers always observe
//! distinct outbound seq values. Runtime dispatch serializes per session on
//! top of this, which keeps the critical sections short.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use opencane_protocol::envelope::now_ms;
use opencane_protocol::Envelope;

use crate::store::{self, Store};

pub type SessionKey = (String, String);

/// High-level runtime state for one device session.
///
/// At most one of `Listening`/`Thinking`/`Speaking` is active at a time;
/// `Interrupted` is transient and yields to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Authed,
    Ready,
    Listening,
    Thinking,
    Speaking,
    Interrupted,
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Authed => "authed",
            SessionState::Ready => "ready",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
            SessionState::Interrupted => "interrupted",
            SessionState::Closing => "closing",
        }
    }
}

/// Outcome of committing one inbound seq.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOutcome {
    /// The next expected value.
    New,
    /// Ahead of the expected value; accepted and committed, the gap is not
    /// re-requested (the device retransmits if it cares).
    OutOfOrder,
    /// At or below the committed frontier.
    Duplicate,
}

impl SeqOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, SeqOutcome::Duplicate)
    }
}

#[derive(Debug)]
struct DeviceSession {
    device_id: String,
    session_id: String,
    state: SessionState,
    created_at_ms: u64,
    last_seen_ms: u64,
    last_recv_seq: i64,
    outbound_seq: i64,
    telemetry: Map<String, Value>,
    metadata: Map<String, Value>,
    pending_commands: VecDeque<Envelope>,
    pending_dropped: u64,
    replay_window: VecDeque<Envelope>,
    active_turn_id: u64,
    active_task_id: Option<String>,
    close_reason: String,
    closed_at_ms: u64,
    /// Last moment a P0 risk hint was surfaced to this session.
    last_p0_hint_ms: u64,
}

impl DeviceSession {
    fn new(device_id: &str, session_id: &str) -> Self {
        let now = now_ms();
        Self {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            state: SessionState::Authed,
            created_at_ms: now,
            last_seen_ms: now,
            last_recv_seq: -1,
            outbound_seq: 0,
            telemetry: Map::new(),
            metadata: Map::new(),
            pending_commands: VecDeque::new(),
            pending_dropped: 0,
            replay_window: VecDeque::new(),
            active_turn_id: 0,
            active_task_id: None,
            close_reason: String::new(),
            closed_at_ms: 0,
            last_p0_hint_ms: 0,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state,
            created_at_ms: self.created_at_ms,
            last_seen_ms: self.last_seen_ms,
            last_recv_seq: self.last_recv_seq,
            outbound_seq: self.outbound_seq,
            pending_commands: self.pending_commands.len(),
            replay_window: self.replay_window.len(),
            active_turn_id: self.active_turn_id,
            active_task_id: self.active_task_id.clone(),
            telemetry: self.telemetry.clone(),
            metadata: self.metadata.clone(),
            close_reason: self.close_reason.clone(),
            closed_at_ms: self.closed_at_ms,
        }
    }
}

/// Read-only view of one session, used for status endpoints and persistence.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub device_id: String,
    pub session_id: String,
    pub state: SessionState,
    pub created_at_ms: u64,
    pub last_seen_ms: u64,
    pub last_recv_seq: i64,
    pub outbound_seq: i64,
    pub pending_commands: usize,
    pub replay_window: usize,
    pub active_turn_id: u64,
    pub active_task_id: Option<String>,
    pub telemetry: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub close_reason: String,
    pub closed_at_ms: u64,
}

impl SessionSnapshot {
    pub fn key(&self) -> SessionKey {
        (self.device_id.clone(), self.session_id.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closing
    }
}

struct Inner {
    sessions: HashMap<SessionKey, DeviceSession>,
    latest_by_device: HashMap<String, SessionKey>,
}

pub struct SessionManager {
    inner: Mutex<Inner>,
    store: Option<Arc<Store>>,
    replay_window_size: usize,
    pending_limit: usize,
}

impl SessionManager {
    pub fn new(
        store: Option<Arc<Store>>,
        replay_window_size: usize,
        pending_limit: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                latest_by_device: HashMap::new(),
            }),
            store,
            replay_window_size: replay_window_size.max(1),
            pending_limit: pending_limit.max(1),
        }
    }

    fn persist(&self, snapshot: &SessionSnapshot) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store::sessions::upsert_device_session(&store.conn(), snapshot) {
            debug!(error = %e, device_id = %snapshot.device_id, "session persistence failed");
        }
    }

    fn with_session<R>(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&mut DeviceSession) -> R,
    ) -> (R, SessionSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .entry(key.clone())
            .or_insert_with(|| DeviceSession::new(&key.0, &key.1));
        let result = f(session);
        let snapshot = session.snapshot();
        inner
            .latest_by_device
            .entry(key.0.clone())
            .or_insert_with(|| key.clone());
        (result, snapshot)
    }

    /// Resolve a session for an inbound event. Control events without a
    /// session id reuse the device's live session or `{device_id}-default` —
    /// never a random id.
    pub fn get_or_create(&self, device_id: &str, session_id: Option<&str>) -> SessionSnapshot {
        let key = {
            let inner = self.inner.lock().unwrap();
            match session_id.filter(|s| !s.trim().is_empty()) {
                Some(sid) => (device_id.to_string(), sid.to_string()),
                None => match inner.latest_by_device.get(device_id) {
                    Some(existing)
                        if inner
                            .sessions
                            .get(existing)
                            .is_some_and(|s| s.state != SessionState::Closing) =>
                    {
                        existing.clone()
                    }
                    _ => (device_id.to_string(), format!("{device_id}-default")),
                },
            }
        };
        let (created, snapshot) = {
            let mut inner = self.inner.lock().unwrap();
            let created = !inner.sessions.contains_key(&key);
            let session = inner
                .sessions
                .entry(key.clone())
                .or_insert_with(|| DeviceSession::new(&key.0, &key.1));
            let snapshot = session.snapshot();
            inner.latest_by_device.insert(key.0.clone(), key.clone());
            (created, snapshot)
        };
        if created {
            debug!(device_id, session_id = %snapshot.session_id, "session created");
            self.persist(&snapshot);
        }
        snapshot
    }

    pub fn get(&self, device_id: &str, session_id: &str) -> Option<SessionSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(&(device_id.to_string(), session_id.to_string()))
            .map(DeviceSession::snapshot)
    }

    pub fn latest_for_device(&self, device_id: &str) -> Option<SessionSnapshot> {
        let inner = self.inner.lock().unwrap();
        let key = inner.latest_by_device.get(device_id)?;
        inner.sessions.get(key).map(DeviceSession::snapshot)
    }

    /// Classify and commit one inbound seq. Persists the committed frontier.
    pub fn check_and_commit_seq(&self, key: &SessionKey, seq: i64) -> SeqOutcome {
        let (outcome, snapshot) = self.with_session(key, |s| {
            s.last_seen_ms = now_ms();
            if seq < 0 {
                return SeqOutcome::New;
            }
            if seq <= s.last_recv_seq {
                return SeqOutcome::Duplicate;
            }
            let outcome = if seq == s.last_recv_seq + 1 {
                SeqOutcome::New
            } else {
                SeqOutcome::OutOfOrder
            };
            s.last_recv_seq = seq;
            outcome
        });
        if !outcome.is_duplicate() {
            self.persist(&snapshot);
        }
        outcome
    }

    /// Allocate the next outbound seq. Strictly monotonic, never reused;
    /// persists on every allocation.
    pub fn next_outbound_seq(&self, key: &SessionKey) -> i64 {
        let (seq, snapshot) = self.with_session(key, |s| {
            s.outbound_seq = s.outbound_seq.max(0) + 1;
            s.last_seen_ms = now_ms();
            s.outbound_seq
        });
        self.persist(&snapshot);
        seq
    }

    /// Remember a sent command for post-reconnect replay, evicting FIFO when
    /// the ring is full.
    pub fn record_command(&self, key: &SessionKey, command: &Envelope) {
        let window = self.replay_window_size;
        let command = command.clone();
        self.with_session(key, move |s| {
            if s.replay_window.len() >= window {
                s.replay_window.pop_front();
            }
            s.replay_window.push_back(command);
        });
    }

    /// Ordered replay-window entries with seq greater than the device's
    /// declared frontier.
    pub fn replay_after(&self, key: &SessionKey, last_recv_seq: i64) -> Vec<Envelope> {
        let (entries, _) = self.with_session(key, |s| {
            s.replay_window
                .iter()
                .filter(|c| c.seq > last_recv_seq)
                .cloned()
                .collect::<Vec<_>>()
        });
        entries
    }

    /// Buffer a command that could not be delivered. Bounded; the oldest entry
    /// is dropped on overflow.
    pub fn push_pending(&self, key: &SessionKey, command: Envelope) {
        let limit = self.pending_limit;
        self.with_session(key, move |s| {
            if s.pending_commands.len() >= limit {
                s.pending_commands.pop_front();
                s.pending_dropped += 1;
            }
            s.pending_commands.push_back(command);
        });
    }

    pub fn drain_pending(&self, key: &SessionKey) -> Vec<Envelope> {
        let (drained, _) = self.with_session(key, |s| s.pending_commands.drain(..).collect());
        drained
    }

    pub fn update_state(&self, key: &SessionKey, state: SessionState) -> SessionSnapshot {
        let (_, snapshot) = self.with_session(key, |s| {
            s.state = state;
            s.last_seen_ms = now_ms();
            if state != SessionState::Closing {
                s.close_reason.clear();
                s.closed_at_ms = 0;
            }
        });
        self.persist(&snapshot);
        snapshot
    }

    pub fn state(&self, key: &SessionKey) -> Option<SessionState> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(key).map(|s| s.state)
    }

    /// Shallow-merge telemetry keys.
    pub fn update_telemetry(&self, key: &SessionKey, values: &Map<String, Value>) {
        let (_, snapshot) = self.with_session(key, |s| {
            for (k, v) in values {
                s.telemetry.insert(k.clone(), v.clone());
            }
            s.last_seen_ms = now_ms();
        });
        self.persist(&snapshot);
    }

    pub fn update_metadata(&self, key: &SessionKey, values: &Map<String, Value>) {
        let (_, snapshot) = self.with_session(key, |s| {
            for (k, v) in values {
                s.metadata.insert(k.clone(), v.clone());
            }
        });
        self.persist(&snapshot);
    }

    pub fn touch(&self, key: &SessionKey) {
        self.with_session(key, |s| s.last_seen_ms = now_ms());
    }

    /// Bump the barge-in generation. In-flight turn work compares its own
    /// generation against the current one and stops when stale.
    pub fn bump_turn(&self, key: &SessionKey) -> u64 {
        let (turn, _) = self.with_session(key, |s| {
            s.active_turn_id += 1;
            s.active_turn_id
        });
        turn
    }

    pub fn turn_generation(&self, key: &SessionKey) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(key).map_or(0, |s| s.active_turn_id)
    }

    pub fn set_active_task(&self, key: &SessionKey, task_id: Option<String>) {
        self.with_session(key, |s| s.active_task_id = task_id);
    }

    pub fn active_task(&self, key: &SessionKey) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(key).and_then(|s| s.active_task_id.clone())
    }

    pub fn note_p0_hint(&self, key: &SessionKey) {
        self.with_session(key, |s| s.last_p0_hint_ms = now_ms());
    }

    /// Milliseconds since the last P0 hint for this session, if any.
    pub fn p0_hint_age_ms(&self, key: &SessionKey) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        let last = inner.sessions.get(key).map(|s| s.last_p0_hint_ms)?;
        if last == 0 {
            return None;
        }
        Some(now_ms().saturating_sub(last))
    }

    pub fn close(&self, key: &SessionKey, reason: &str) -> Option<SessionSnapshot> {
        let (_, snapshot) = self.with_session(key, |s| {
            s.state = SessionState::Closing;
            s.close_reason = reason.to_string();
            s.closed_at_ms = now_ms();
            s.last_seen_ms = s.closed_at_ms;
        });
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.latest_by_device.get(&key.0) == Some(key) {
                inner.latest_by_device.remove(&key.0);
            }
        }
        if let Some(store) = &self.store {
            let _ = store::sessions::close_device_session(
                &store.conn(),
                &key.0,
                &key.1,
                reason,
                snapshot.closed_at_ms,
            );
        }
        Some(snapshot)
    }

    pub fn all_snapshots(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.values().map(DeviceSession::snapshot).collect()
    }

    pub fn open_session_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .values()
            .filter(|s| s.state != SessionState::Closing)
            .count()
    }

    /// Context handed to the dialogue engine for one turn.
    pub fn session_context(&self, key: &SessionKey) -> Map<String, Value> {
        let inner = self.inner.lock().unwrap();
        let mut context = Map::new();
        if let Some(s) = inner.sessions.get(key) {
            context.insert("device_id".into(), Value::String(s.device_id.clone()));
            context.insert("session_id".into(), Value::String(s.session_id.clone()));
            context.insert("state".into(), Value::String(s.state.as_str().into()));
            context.insert("telemetry".into(), Value::Object(s.telemetry.clone()));
            context.insert("metadata".into(), Value::Object(s.metadata.clone()));
        }
        context
    }
}
