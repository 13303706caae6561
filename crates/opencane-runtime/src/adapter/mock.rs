//! In-process adapter for tests and the HTTP event-injection path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use opencane_protocol::Envelope;

use crate::error::RuntimeError;

use super::{GatewayAdapter, EVENT_CHANNEL_CAPACITY};

/// Events are injected directly; sent commands are captured for inspection.
/// `set_online(false)` simulates a dropped transport so offline buffering and
/// replay can be exercised.
pub struct MockAdapter {
    event_tx: mpsc::Sender<Envelope>,
    event_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    sent: Mutex<Vec<Envelope>>,
    online: AtomicBool,
    closed_sessions: Mutex<Vec<(String, String, String)>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            sent: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            closed_sessions: Mutex::new(Vec::new()),
        }
    }

    /// Push one canonical event into the runtime's stream.
    pub async fn inject_event(&self, event: Envelope) -> Result<(), RuntimeError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| RuntimeError::Transport("mock event stream closed".into()))
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Commands sent so far, oldest first.
    pub fn sent_commands(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<Envelope> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    pub fn closed_sessions(&self) -> Vec<(String, String, String)> {
        self.closed_sessions.lock().unwrap().clone()
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn transport(&self) -> &'static str {
        "in_process"
    }

    async fn start(&self) -> Result<mpsc::Receiver<Envelope>, RuntimeError> {
        self.event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RuntimeError::Transport("mock event stream already taken".into()))
    }

    async fn stop(&self) {}

    fn send_command(&self, command: Envelope) -> Result<(), RuntimeError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RuntimeError::Transport("mock transport offline".into()));
        }
        self.sent.lock().unwrap().push(command);
        Ok(())
    }

    fn is_device_online(&self, _device_id: &str) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn close_session(&self, device_id: &str, session_id: &str, reason: &str) {
        self.closed_sessions.lock().unwrap().push((
            device_id.to_string(),
            session_id.to_string(),
            reason.to_string(),
        ));
    }
}
