//! Canonical message envelope.
//!
//! Device → server traffic is an *event*, server → device traffic is a
//! *command*. Both directions share the same envelope shape:
//!
//! `{"version":"0.1","msg_id":"…","device_id":"…","session_id":"…",
//!   "seq":3,"ts":1700000000000,"type":"audio_chunk","payload":{…}}`

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

pub const PROTOCOL_VERSION: &str = "0.1";

/// Events a device can send to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventType {
    Hello,
    Heartbeat,
    ListenStart,
    AudioChunk,
    ListenStop,
    Abort,
    ImageReady,
    Telemetry,
    ToolResult,
    Error,
}

/// Commands the server can send to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommandType {
    HelloAck,
    Ack,
    SttPartial,
    SttFinal,
    TtsStart,
    TtsChunk,
    TtsStop,
    TaskUpdate,
    ToolCall,
    SetConfig,
    OtaPlan,
    Close,
}

/// The `type` field of an envelope. Untagged so both directions share one
/// wire representation; an unrecognized string fails deserialization, which
/// the boundary reports as a recoverable parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvelopeType {
    Event(DeviceEventType),
    Command(DeviceCommandType),
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Event(e) => match e {
                DeviceEventType::Hello => "hello",
                DeviceEventType::Heartbeat => "heartbeat",
                DeviceEventType::ListenStart => "listen_start",
                DeviceEventType::AudioChunk => "audio_chunk",
                DeviceEventType::ListenStop => "listen_stop",
                DeviceEventType::Abort => "abort",
                DeviceEventType::ImageReady => "image_ready",
                DeviceEventType::Telemetry => "telemetry",
                DeviceEventType::ToolResult => "tool_result",
                DeviceEventType::Error => "error",
            },
            EnvelopeType::Command(c) => match c {
                DeviceCommandType::HelloAck => "hello_ack",
                DeviceCommandType::Ack => "ack",
                DeviceCommandType::SttPartial => "stt_partial",
                DeviceCommandType::SttFinal => "stt_final",
                DeviceCommandType::TtsStart => "tts_start",
                DeviceCommandType::TtsChunk => "tts_chunk",
                DeviceCommandType::TtsStop => "tts_stop",
                DeviceCommandType::TaskUpdate => "task_update",
                DeviceCommandType::ToolCall => "tool_call",
                DeviceCommandType::SetConfig => "set_config",
                DeviceCommandType::OtaPlan => "ota_plan",
                DeviceCommandType::Close => "close",
            },
        }
    }
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_seq() -> i64 {
    -1
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One canonical message, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub msg_id: String,
    pub device_id: String,
    #[serde(default)]
    pub session_id: String,
    /// Monotonic per direction, per session. `-1` means "not sequenced"
    /// (the sender did not participate in seq tracking).
    #[serde(default = "default_seq")]
    pub seq: i64,
    /// Millisecond epoch.
    #[serde(default)]
    pub ts: u64,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build a device → server event.
    pub fn event(
        kind: DeviceEventType,
        device_id: impl Into<String>,
        session_id: impl Into<String>,
        seq: i64,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            msg_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            session_id: session_id.into(),
            seq,
            ts: now_ms(),
            kind: EnvelopeType::Event(kind),
            payload,
        }
    }

    /// Build a server → device command.
    pub fn command(
        kind: DeviceCommandType,
        device_id: impl Into<String>,
        session_id: impl Into<String>,
        seq: i64,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            msg_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            session_id: session_id.into(),
            seq,
            ts: now_ms(),
            kind: EnvelopeType::Command(kind),
            payload,
        }
    }

    /// Parse a raw JSON value into an envelope, applying device/session
    /// fallbacks the way adapters do for dialects that omit them.
    pub fn from_json(
        value: Value,
        default_device_id: Option<&str>,
        default_session_id: Option<&str>,
    ) -> Result<Self, ProtocolError> {
        let mut envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidControlPayload(e.to_string()))?;
        if envelope.device_id.trim().is_empty() {
            match default_device_id {
                Some(id) if !id.trim().is_empty() => envelope.device_id = id.to_string(),
                _ => {
                    return Err(ProtocolError::InvalidControlPayload(
                        "missing device_id".into(),
                    ))
                }
            }
        }
        if envelope.session_id.trim().is_empty() {
            envelope.session_id = match default_session_id {
                Some(id) if !id.trim().is_empty() => id.to_string(),
                _ => format!("{}-default", envelope.device_id),
            };
        }
        if envelope.msg_id.trim().is_empty() {
            envelope.msg_id = uuid::Uuid::new_v4().to_string();
        }
        if envelope.ts == 0 {
            envelope.ts = now_ms();
        }
        Ok(envelope)
    }

    pub fn event_type(&self) -> Option<DeviceEventType> {
        match self.kind {
            EnvelopeType::Event(e) => Some(e),
            EnvelopeType::Command(_) => None,
        }
    }

    pub fn command_type(&self) -> Option<DeviceCommandType> {
        match self.kind {
            EnvelopeType::Command(c) => Some(c),
            EnvelopeType::Event(_) => None,
        }
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }

    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_json_roundtrip() {
        let mut payload = Map::new();
        payload.insert("text".into(), json!("hello there"));
        payload.insert("n".into(), json!(3));
        let env = Envelope::event(DeviceEventType::ListenStop, "dev-001", "s1", 8, payload);

        let encoded = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(env, back);
        let re_encoded = serde_json::to_string(&back).unwrap();
        assert_eq!(encoded, re_encoded);
    }

    #[test]
    fn type_field_is_snake_case_string() {
        let env = Envelope::command(
            DeviceCommandType::TtsStop,
            "dev-001",
            "s1",
            4,
            Map::new(),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], json!("tts_stop"));
        assert_eq!(env.kind.as_str(), "tts_stop");
    }

    #[test]
    fn from_json_fills_defaults() {
        let env = Envelope::from_json(
            json!({"type": "hello", "device_id": "dev-9"}),
            None,
            None,
        )
        .unwrap();
        assert_eq!(env.session_id, "dev-9-default");
        assert_eq!(env.seq, -1);
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert!(!env.msg_id.is_empty());
        assert!(env.ts > 0);
    }

    #[test]
    fn from_json_requires_device_id() {
        let err = Envelope::from_json(json!({"type": "heartbeat"}), None, None).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidControlPayload(_)));
    }

    #[test]
    fn from_json_rejects_unknown_type() {
        let err = Envelope::from_json(
            json!({"type": "warp_drive", "device_id": "dev-1"}),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidControlPayload(_)));
    }

    #[test]
    fn event_and_command_types_parse_from_strings() {
        let event: EnvelopeType = serde_json::from_value(json!("audio_chunk")).unwrap();
        assert_eq!(event, EnvelopeType::Event(DeviceEventType::AudioChunk));
        let command: EnvelopeType = serde_json::from_value(json!("task_update")).unwrap();
        assert_eq!(command, EnvelopeType::Command(DeviceCommandType::TaskUpdate));
    }
}
