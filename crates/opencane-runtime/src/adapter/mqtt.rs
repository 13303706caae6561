//! MQTT transport adapter, profile-driven.
//!
//! One broker connection carries every device: control topics are JSON
//! envelopes at QoS >= 1, audio topics are framed binary (or base64 JSON,
//! per profile) at QoS 0. Reconnects use exponential backoff with full
//! jitter inside the profile's window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use opencane_protocol::{
    AudioFrame, AudioUpMode, DeviceCommandType, DeviceEventType, Envelope, ModemProfile,
};

use crate::error::RuntimeError;

use super::{GatewayAdapter, COMMAND_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY};

#[derive(Debug, Clone)]
pub struct MqttConnection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn qos_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();
    for (i, token) in filter_parts.iter().enumerate() {
        if *token == "#" {
            return i == filter_parts.len() - 1;
        }
        if i >= topic_parts.len() {
            return false;
        }
        if *token == "+" {
            continue;
        }
        if *token != topic_parts[i] {
            return false;
        }
    }
    topic_parts.len() == filter_parts.len()
}

fn extract_wildcard(filter: &str, topic: &str) -> Option<String> {
    if !topic_matches(filter, topic) {
        return None;
    }
    let topic_parts: Vec<&str> = topic.split('/').collect();
    for (i, token) in filter.split('/').enumerate() {
        if token == "+" {
            return topic_parts.get(i).map(|s| s.to_string());
        }
    }
    None
}

/// State shared between the adapter facade and its spawned loops.
struct MqttShared {
    profile: ModemProfile,
    connection: MqttConnection,
    client: Mutex<Option<AsyncClient>>,
    connected: AtomicBool,
    event_tx: mpsc::Sender<Envelope>,
    session_by_device: Mutex<HashMap<String, String>>,
    shutdown: Notify,
    running: AtomicBool,
}

impl MqttShared {
    fn default_session(&self, device_id: &str) -> String {
        self.session_by_device
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| format!("{device_id}-default"))
    }

    fn remember_session(&self, device_id: &str, session_id: &str) {
        if !session_id.is_empty() {
            self.session_by_device
                .lock()
                .unwrap()
                .insert(device_id.to_string(), session_id.to_string());
        }
    }

    /// Parse one inbound publish into a canonical envelope. Malformed
    /// payloads become `error` events rather than silent drops.
    fn parse_publish(&self, topic: &str, payload: &[u8]) -> Option<Envelope> {
        let control_filter = ModemProfile::subscription_filter(&self.profile.up_control_topic);
        let audio_filter = ModemProfile::subscription_filter(&self.profile.up_audio_topic);

        if topic_matches(&control_filter, topic) {
            let device_hint = extract_wildcard(&control_filter, topic).unwrap_or_default();
            let value: Value = match serde_json::from_slice(payload) {
                Ok(value) => value,
                Err(_) => {
                    return Some(self.error_event(&device_hint, "invalid control payload"));
                }
            };
            let default_session = if device_hint.is_empty() {
                None
            } else {
                Some(self.default_session(&device_hint))
            };
            match Envelope::from_json(
                value,
                (!device_hint.is_empty()).then_some(device_hint.as_str()),
                default_session.as_deref(),
            ) {
                Ok(envelope) => {
                    self.remember_session(&envelope.device_id, &envelope.session_id);
                    Some(envelope)
                }
                Err(e) => {
                    debug!(topic, error = %e, "unparseable control payload");
                    Some(self.error_event(&device_hint, "invalid control payload"))
                }
            }
        } else if topic_matches(&audio_filter, topic) {
            let device_id = extract_wildcard(&audio_filter, topic)?;
            let session_id = self.default_session(&device_id);
            let result = match self.profile.audio_up_mode {
                AudioUpMode::FramedPacket => self.parse_framed_audio(payload, &device_id, &session_id),
                AudioUpMode::JsonB64 => self.parse_json_audio(payload, &device_id, &session_id),
            };
            match result {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    debug!(device_id, error = %e, "invalid audio packet");
                    Some(self.error_event(&device_id, "invalid audio packet"))
                }
            }
        } else {
            None
        }
    }

    fn parse_framed_audio(
        &self,
        payload: &[u8],
        device_id: &str,
        session_id: &str,
    ) -> Result<Envelope, RuntimeError> {
        let frame = AudioFrame::decode(payload, self.profile.packet_magic)?;
        let mut body = Map::new();
        body.insert(
            "audio_b64".into(),
            Value::String(base64::engine::general_purpose::STANDARD.encode(&frame.payload)),
        );
        body.insert("encoding".into(), Value::String("opus".into()));
        body.insert("timestamp".into(), Value::from(frame.timestamp_ms));
        // Reserved header bytes surface in telemetry instead of being
        // validated.
        if frame.frame_type != 0 || frame.flags != 0 {
            body.insert("frame_type".into(), Value::from(frame.frame_type));
            body.insert("frame_flags".into(), Value::from(frame.flags));
        }
        Ok(Envelope::event(
            DeviceEventType::AudioChunk,
            device_id,
            session_id,
            frame.seq as i64,
            body,
        ))
    }

    fn parse_json_audio(
        &self,
        payload: &[u8],
        device_id: &str,
        session_id: &str,
    ) -> Result<Envelope, RuntimeError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| RuntimeError::InvalidAudioFrame(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| RuntimeError::InvalidAudioFrame("audio json must be an object".into()))?;
        let nested = object.get("payload").and_then(Value::as_object);
        let source = nested.unwrap_or(object);

        let audio_b64 = source
            .get("audio_b64")
            .or_else(|| source.get("audio"))
            .or_else(|| source.get("data"))
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::InvalidAudioFrame("missing base64 audio field".into()))?;
        let seq = source
            .get("seq")
            .or_else(|| object.get("seq"))
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        let ts = source
            .get("timestamp")
            .or_else(|| source.get("ts"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let encoding = source
            .get("encoding")
            .and_then(Value::as_str)
            .unwrap_or("opus");

        let mut body = Map::new();
        body.insert("audio_b64".into(), Value::String(audio_b64.to_string()));
        body.insert("encoding".into(), Value::String(encoding.to_string()));
        body.insert("timestamp".into(), Value::from(ts));
        Ok(Envelope::event(
            DeviceEventType::AudioChunk,
            device_id,
            session_id,
            seq,
            body,
        ))
    }

    fn error_event(&self, device_id: &str, message: &str) -> Envelope {
        let device = if device_id.is_empty() { "unknown" } else { device_id };
        let mut payload = Map::new();
        payload.insert("error".into(), Value::String(message.to_string()));
        Envelope::event(
            DeviceEventType::Error,
            device,
            self.default_session(device),
            -1,
            payload,
        )
    }

    /// Serialize one outbound command to `(topic, qos, bytes)`. Audio-bearing
    /// `tts_chunk`s go framed on the audio topic; everything else is control
    /// JSON.
    fn serialize_command(&self, command: &Envelope) -> Result<(String, QoS, Vec<u8>), RuntimeError> {
        if command.command_type() == Some(DeviceCommandType::TtsChunk) {
            if let Some(audio_b64) = command.payload_str("audio_b64") {
                let audio = base64::engine::general_purpose::STANDARD
                    .decode(audio_b64)
                    .map_err(|e| RuntimeError::InvalidControlPayload(e.to_string()))?;
                let frame = AudioFrame::new(
                    self.profile.packet_magic,
                    command.seq.max(0) as u32,
                    (command.ts & 0xFFFF_FFFF) as u32,
                    audio,
                );
                let topic =
                    ModemProfile::render_topic(&self.profile.down_audio_topic, &command.device_id);
                return Ok((topic, qos_level(self.profile.qos_audio), frame.encode()));
            }
        }
        let topic = ModemProfile::render_topic(&self.profile.down_control_topic, &command.device_id);
        let body = serde_json::to_vec(command)
            .map_err(|e| RuntimeError::InvalidControlPayload(e.to_string()))?;
        Ok((topic, qos_level(self.profile.qos_control), body))
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let min = self.profile.reconnect_min_ms;
        let max = self.profile.reconnect_max_ms;
        let ceiling = (min.saturating_mul(1 << attempt.min(6))).clamp(min, max);
        // Full jitter inside [min, ceiling].
        let delay = rand::thread_rng().gen_range(min..=ceiling.max(min));
        Duration::from_millis(delay)
    }
}

pub struct GenericMqttAdapter {
    shared: Arc<MqttShared>,
    event_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    command_tx: mpsc::Sender<Envelope>,
    command_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

impl GenericMqttAdapter {
    pub fn new(profile: ModemProfile, connection: MqttConnection) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(MqttShared {
                profile,
                connection,
                client: Mutex::new(None),
                connected: AtomicBool::new(false),
                event_tx,
                session_by_device: Mutex::new(HashMap::new()),
                shutdown: Notify::new(),
                running: AtomicBool::new(false),
            }),
            event_rx: Mutex::new(Some(event_rx)),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }
}

#[async_trait]
impl GatewayAdapter for GenericMqttAdapter {
    fn name(&self) -> &'static str {
        "generic_mqtt"
    }

    fn transport(&self) -> &'static str {
        "mqtt"
    }

    async fn start(&self) -> Result<mpsc::Receiver<Envelope>, RuntimeError> {
        let event_rx = self
            .event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RuntimeError::Transport("mqtt adapter already started".into()))?;
        let mut command_rx = self
            .command_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RuntimeError::Transport("mqtt writer already started".into()))?;
        self.shared.running.store(true, Ordering::SeqCst);

        let mut options = MqttOptions::new(
            self.shared.connection.client_id.clone(),
            self.shared.connection.host.clone(),
            self.shared.connection.port,
        );
        options.set_keep_alive(Duration::from_secs(self.shared.profile.keepalive_seconds as u64));
        if let Some(username) = &self.shared.connection.username {
            options.set_credentials(
                username.clone(),
                self.shared.connection.password.clone().unwrap_or_default(),
            );
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        *self.shared.client.lock().unwrap() = Some(client.clone());

        // Network loop: poll the broker, normalize publishes, back off with
        // jitter on errors.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let control_filter =
                ModemProfile::subscription_filter(&shared.profile.up_control_topic);
            let audio_filter = ModemProfile::subscription_filter(&shared.profile.up_audio_topic);
            let mut attempt: u32 = 0;
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        attempt = 0;
                        shared.connected.store(true, Ordering::SeqCst);
                        info!(
                            host = %shared.connection.host,
                            port = shared.connection.port,
                            profile = %shared.profile.name,
                            "mqtt connected"
                        );
                        let _ = client
                            .subscribe(&control_filter, qos_level(shared.profile.qos_control))
                            .await;
                        let _ = client
                            .subscribe(&audio_filter, qos_level(shared.profile.qos_audio))
                            .await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(envelope) =
                            shared.parse_publish(&publish.topic, &publish.payload)
                        {
                            if shared.event_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        shared.connected.store(false, Ordering::SeqCst);
                        warn!("mqtt broker disconnected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        shared.connected.store(false, Ordering::SeqCst);
                        if !shared.running.load(Ordering::SeqCst) {
                            break;
                        }
                        let backoff = shared.jittered_backoff(attempt);
                        attempt = attempt.saturating_add(1);
                        warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "mqtt connection error, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shared.shutdown.notified() => break,
                        }
                    }
                }
            }
            debug!("mqtt network loop stopped");
        });

        // Writer loop: drain the bounded command queue.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let client = shared.client.lock().unwrap().clone();
                let Some(client) = client else { break };
                match shared.serialize_command(&command) {
                    Ok((topic, qos, bytes)) => {
                        if let Err(e) = client.publish(topic.clone(), qos, false, bytes).await {
                            warn!(topic, error = %e, "mqtt publish failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "unserializable command dropped"),
                }
            }
            debug!("mqtt writer loop stopped");
        });

        Ok(event_rx)
    }

    async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();
        let client = self.shared.client.lock().unwrap().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.session_by_device.lock().unwrap().clear();
    }

    fn send_command(&self, command: Envelope) -> Result<(), RuntimeError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(RuntimeError::Transport("mqtt broker offline".into()));
        }
        self.command_tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RuntimeError::TransportBackpressure,
            mpsc::error::TrySendError::Closed(_) => {
                RuntimeError::Transport("mqtt writer stopped".into())
            }
        })
    }

    fn is_device_online(&self, _device_id: &str) -> bool {
        // MQTT has no per-device liveness; broker connectivity is the proxy.
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn close_session(&self, device_id: &str, session_id: &str, reason: &str) {
        let mut payload = Map::new();
        payload.insert("reason".into(), Value::String(reason.to_string()));
        let _ = self.send_command(Envelope::command(
            DeviceCommandType::Close,
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
    use opencane_protocol::profiles::{resolve_profile, ProfileOverrides};

    fn connection() -> MqttConnection {
        MqttConnection {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "opencane-test".into(),
            username: None,
            password: None,
        }
    }

    fn adapter_for(profile_name: &str) -> GenericMqttAdapter {
        let profile = resolve_profile(profile_name, &ProfileOverrides::default()).unwrap();
        GenericMqttAdapter::new(profile, connection())
    }

    #[test]
    fn topic_matching() {
        assert!(topic_matches("device/+/up/control", "device/dev-1/up/control"));
        assert!(!topic_matches("device/+/up/control", "device/dev-1/up/audio"));
        assert!(!topic_matches("device/+/up/control", "device/dev-1/up/control/extra"));
        assert_eq!(
            extract_wildcard("device/+/up/audio", "device/dev-7/up/audio").as_deref(),
            Some("dev-7")
        );
    }

    #[test]
    fn control_publish_parses_to_envelope() {
        let adapter = adapter_for("ec600mcnle_v1");
        let payload = serde_json::json!({
            "type": "hello",
            "seq": 1,
            "session_id": "s1",
            "payload": {"capabilities": {"tts_mode": "device_text"}}
        });
        let envelope = adapter
            .shared
            .parse_publish("device/dev-1/up/control", payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(envelope.device_id, "dev-1");
        assert_eq!(envelope.event_type(), Some(DeviceEventType::Hello));
        // Session learned from control traffic feeds audio defaults.
        assert_eq!(adapter.shared.default_session("dev-1"), "s1");
    }

    #[test]
    fn malformed_control_becomes_error_event() {
        let adapter = adapter_for("ec600mcnle_v1");
        let envelope = adapter
            .shared
            .parse_publish("device/dev-1/up/control", b"{not json")
            .unwrap();
        assert_eq!(envelope.event_type(), Some(DeviceEventType::Error));
        assert_eq!(envelope.device_id, "dev-1");
    }

    #[test]
    fn framed_audio_publish_parses() {
        let adapter = adapter_for("ec600mcnle_v1");
        let frame = AudioFrame::new(0xA1, 9, 1234, vec![5, 6, 7]);
        let envelope = adapter
            .shared
            .parse_publish("device/dev-1/up/audio", &frame.encode())
            .unwrap();
        assert_eq!(envelope.event_type(), Some(DeviceEventType::AudioChunk));
        assert_eq!(envelope.seq, 9);
        let audio = envelope.payload_str("audio_b64").unwrap();
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(audio).unwrap(),
            vec![5, 6, 7]
        );
    }

    #[test]
    fn bad_magic_becomes_error_event() {
        let adapter = adapter_for("ec600mcnle_v1");
        let frame = AudioFrame::new(0x55, 9, 1234, vec![5]);
        let envelope = adapter
            .shared
            .parse_publish("device/dev-1/up/audio", &frame.encode())
            .unwrap();
        assert_eq!(envelope.event_type(), Some(DeviceEventType::Error));
    }

    #[test]
    fn reserved_header_bytes_surface_in_payload() {
        let adapter = adapter_for("ec600mcnle_v1");
        let mut wire = AudioFrame::new(0xA1, 2, 10, vec![1]).encode();
        wire[2] = 0x05;
        wire[3] = 0x80;
        let envelope = adapter
            .shared
            .parse_publish("device/dev-1/up/audio", &wire)
            .unwrap();
        assert_eq!(envelope.payload_i64("frame_type"), Some(5));
        assert_eq!(envelope.payload_i64("frame_flags"), Some(128));
    }

    #[test]
    fn json_b64_audio_mode() {
        let adapter = adapter_for("a7670c_v1");
        let payload = serde_json::json!({"audio_b64": "AQID", "seq": 4, "timestamp": 99});
        let envelope = adapter
            .shared
            .parse_publish("device/dev-2/up/audio", payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(envelope.seq, 4);
        assert_eq!(envelope.payload_str("encoding"), Some("opus"));
    }

    #[test]
    fn tts_audio_chunks_serialize_as_framed_binary() {
        let adapter = adapter_for("ec600mcnle_v1");
        let mut payload = Map::new();
        payload.insert(
            "audio_b64".into(),
            Value::String(base64::engine::general_purpose::STANDARD.encode([9u8, 8, 7])),
        );
        let command = Envelope::command(DeviceCommandType::TtsChunk, "dev-1", "s1", 3, payload);
        let (topic, qos, bytes) = adapter.shared.serialize_command(&command).unwrap();
        assert_eq!(topic, "device/dev-1/down/audio");
        assert!(matches!(qos, QoS::AtMostOnce));
        let frame = AudioFrame::decode(&bytes, 0xA1).unwrap();
        assert_eq!(frame.payload, vec![9, 8, 7]);
        assert_eq!(frame.seq, 3);
    }

    #[test]
    fn control_commands_serialize_as_json() {
        let adapter = adapter_for("ec600mcnle_v1");
        let command = Envelope::command(DeviceCommandType::Ack, "dev-1", "s1", 2, Map::new());
        let (topic, qos, bytes) = adapter.shared.serialize_command(&command).unwrap();
        assert_eq!(topic, "device/dev-1/down/control");
        assert!(matches!(qos, QoS::AtLeastOnce));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "ack");
    }

    #[test]
    fn send_while_offline_fails_for_replay_buffering() {
        let adapter = adapter_for("ec600mcnle_v1");
        let command = Envelope::command(DeviceCommandType::Ack, "dev-1", "s1", 1, Map::new());
        let err = adapter.send_command(command).unwrap_err();
        assert!(matches!(err, RuntimeError::Transport(_)));
    }

    #[test]
    fn backoff_stays_in_profile_window() {
        let adapter = adapter_for("sim7600g_h_v1");
        for attempt in 0..10 {
            let backoff = adapter.shared.jittered_backoff(attempt);
            assert!(backoff >= Duration::from_millis(2_000));
            assert!(backoff <= Duration::from_millis(60_000));
        }
    }
}
