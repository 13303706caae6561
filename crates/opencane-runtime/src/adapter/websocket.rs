//! WebSocket transport adapter.
//!
//! Devices connect to a listener and exchange canonical envelopes as JSON
//! text frames in both directions. Each connection gets a writer task; the
//! adapter routes outbound commands to the device's live connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use opencane_protocol::{DeviceEventType, Envelope};

use crate::error::RuntimeError;

use super::{GatewayAdapter, COMMAND_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY};

struct WsShared {
    event_tx: mpsc::Sender<Envelope>,
    /// device_id → writer for its live connection.
    writers: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    session_by_device: Mutex<HashMap<String, String>>,
    shutdown: Notify,
    running: AtomicBool,
}

impl WsShared {
    fn register_writer(&self, device_id: &str, tx: mpsc::Sender<Message>) {
        self.writers.lock().unwrap().insert(device_id.to_string(), tx);
    }

    fn drop_writer(&self, device_id: &str) {
        self.writers.lock().unwrap().remove(device_id);
    }

    async fn handle_text(&self, text: &str, device_hint: &mut Option<String>, tx: &mpsc::Sender<Message>) {
        let parsed: Result<Value, _> = serde_json::from_str(text);
        let default_session = device_hint
            .as_deref()
            .map(|device| self.default_session(device));
        let envelope = parsed.map_err(|e| e.to_string()).and_then(|value| {
            Envelope::from_json(value, device_hint.as_deref(), default_session.as_deref())
                .map_err(|e| e.to_string())
        });
        match envelope {
            Ok(envelope) => {
                if device_hint.is_none() {
                    *device_hint = Some(envelope.device_id.clone());
                    self.register_writer(&envelope.device_id, tx.clone());
                }
                if !envelope.session_id.is_empty() {
                    self.session_by_device
                        .lock()
                        .unwrap()
                        .insert(envelope.device_id.clone(), envelope.session_id.clone());
                }
                if self.event_tx.send(envelope).await.is_err() {
                    debug!("runtime event stream closed");
                }
            }
            Err(e) => {
                debug!(error = %e, "malformed websocket payload");
                // Surface an error event instead of dropping silently when we
                // already know which device this connection belongs to.
                if let Some(device) = device_hint.as_deref() {
                    let mut payload = serde_json::Map::new();
                    payload.insert("error".into(), Value::String("invalid control payload".into()));
                    let _ = self
                        .event_tx
                        .send(Envelope::event(
                            DeviceEventType::Error,
                            device,
                            self.default_session(device),
                            -1,
                            payload,
                        ))
                        .await;
                }
            }
        }
    }

    fn default_session(&self, device_id: &str) -> String {
        self.session_by_device
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| format!("{device_id}-default"))
    }
}

pub struct WebSocketAdapter {
    bind_addr: String,
    shared: Arc<WsShared>,
    event_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

impl WebSocketAdapter {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            bind_addr: bind_addr.into(),
            shared: Arc::new(WsShared {
                event_tx,
                writers: Mutex::new(HashMap::new()),
                session_by_device: Mutex::new(HashMap::new()),
                shutdown: Notify::new(),
                running: AtomicBool::new(false),
            }),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    async fn run_connection(shared: Arc<WsShared>, stream: tokio::net::TcpStream) {
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(peer, error = %e, "websocket handshake failed");
                return;
            }
        };
        debug!(peer, "websocket device connected");
        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Message>(COMMAND_CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let mut device_hint: Option<String> = None;
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    shared.handle_text(&text, &mut device_hint, &tx).await;
                }
                Ok(Message::Ping(data)) => {
                    let _ = tx.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(peer, error = %e, "websocket read error");
                    break;
                }
                _ => {}
            }
        }

        if let Some(device) = device_hint.as_deref() {
            shared.drop_writer(device);
            debug!(peer, device, "websocket device disconnected");
        }
        writer.abort();
    }
}

#[async_trait]
impl GatewayAdapter for WebSocketAdapter {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn transport(&self) -> &'static str {
        "websocket"
    }

    async fn start(&self) -> Result<mpsc::Receiver<Envelope>, RuntimeError> {
        let event_rx = self
            .event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RuntimeError::Transport("websocket adapter already started".into()))?;
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| RuntimeError::Transport(format!("bind {}: {e}", self.bind_addr)))?;
        info!(addr = %self.bind_addr, "websocket adapter listening");
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                tokio::spawn(Self::run_connection(shared.clone(), stream));
                            }
                            Err(e) => {
                                warn!(error = %e, "websocket accept failed");
                            }
                        }
                    }
                    _ = shared.shutdown.notified() => break,
                }
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            debug!("websocket accept loop stopped");
        });
        Ok(event_rx)
    }

    async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();
        self.shared.writers.lock().unwrap().clear();
    }

    fn send_command(&self, command: Envelope) -> Result<(), RuntimeError> {
        let writers = self.shared.writers.lock().unwrap();
        let Some(tx) = writers.get(&command.device_id) else {
            return Err(RuntimeError::Transport(format!(
                "device offline: {}",
                command.device_id
            )));
        };
        let body = serde_json::to_string(&command)
            .map_err(|e| RuntimeError::InvalidControlPayload(e.to_string()))?;
        tx.try_send(Message::Text(body.into())).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RuntimeError::TransportBackpressure,
            mpsc::error::TrySendError::Closed(_) => {
                RuntimeError::Transport("websocket writer closed".into())
            }
        })
    }

    fn is_device_online(&self, device_id: &str) -> bool {
        self.shared.writers.lock().unwrap().contains_key(device_id)
    }

    async fn close_session(&self, device_id: &str, session_id: &str, reason: &str) {
        let mut payload = serde_json::Map::new();
        payload.insert("reason".into(), Value::String(reason.to_string()));
        let _ = self.send_command(Envelope::command(
            opencane_protocol::DeviceCommandType::Close,
            device_id,
            session_id,
            -1,
            payload,
        ));
        self.shared.session_by_device.lock().unwrap().remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencane_protocol::DeviceCommandType;

    #[tokio::test]
    async fn device_roundtrip_over_websocket() {
        let adapter = Arc::new(WebSocketAdapter::new("127.0.0.1:0"));
        // Bind on an ephemeral port by hand so the test can discover it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = adapter.shared.clone();
        let mut events = {
            let event_rx = adapter.event_rx.lock().unwrap().take().unwrap();
            shared.running.store(true, Ordering::SeqCst);
            let shared = shared.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else { break };
                    tokio::spawn(WebSocketAdapter::run_connection(shared.clone(), stream));
                }
            });
            event_rx
        };

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let hello = serde_json::json!({
            "type": "hello", "device_id": "dev-1", "session_id": "s1", "seq": 1
        });
        client
            .send(Message::Text(hello.to_string().into()))
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.device_id, "dev-1");
        assert!(adapter.is_device_online("dev-1"));

        // Outbound command reaches the device as JSON.
        adapter
            .send_command(Envelope::command(
                DeviceCommandType::HelloAck,
                "dev-1",
                "s1",
                1,
                serde_json::Map::new(),
            ))
            .unwrap();
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "hello_ack");
    }

    #[tokio::test]
    async fn offline_device_send_fails() {
        let adapter = WebSocketAdapter::new("127.0.0.1:0");
        let err = adapter
            .send_command(Envelope::command(
                DeviceCommandType::Ack,
                "nobody",
                "s1",
                1,
                serde_json::Map::new(),
            ))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Transport(_)));
    }
}
