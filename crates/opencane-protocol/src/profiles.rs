//! Modem profile registry.
//!
//! Each supported cellular module ships with a different MQTT dialect: topic
//! shapes, QoS expectations, keepalive windows, and whether audio travels as
//! framed binary or base64 JSON. A profile bundles those parameters; runtime
//! overrides may supersede any field.

use serde::{Deserialize, Serialize};

use crate::audio_frame::DEFAULT_PACKET_MAGIC;
use crate::ProtocolError;

/// How a device uploads audio on its audio topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioUpMode {
    /// 16-byte framed binary packets.
    FramedPacket,
    /// JSON object carrying `audio_b64`.
    JsonB64,
}

/// Transport parameters for one modem family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModemProfile {
    pub name: String,
    /// Templates use `{device_id}`; subscription side swaps it for `+`.
    pub up_control_topic: String,
    pub up_audio_topic: String,
    pub down_control_topic: String,
    pub down_audio_topic: String,
    pub qos_control: u8,
    pub qos_audio: u8,
    pub keepalive_seconds: u16,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub audio_up_mode: AudioUpMode,
    pub packet_magic: u8,
    pub supports_tool_result: bool,
    pub supports_telemetry_normalize: bool,
}

impl ModemProfile {
    fn base(name: &str) -> Self {
        Self {
            name: name.to_string(),
            up_control_topic: "device/{device_id}/up/control".into(),
            up_audio_topic: "device/{device_id}/up/audio".into(),
            down_control_topic: "device/{device_id}/down/control".into(),
            down_audio_topic: "device/{device_id}/down/audio".into(),
            qos_control: 1,
            qos_audio: 0,
            keepalive_seconds: 60,
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 30_000,
            audio_up_mode: AudioUpMode::FramedPacket,
            packet_magic: DEFAULT_PACKET_MAGIC,
            supports_tool_result: false,
            supports_telemetry_normalize: false,
        }
    }

    /// Render a topic template for one device.
    pub fn render_topic(template: &str, device_id: &str) -> String {
        template.replace("{device_id}", device_id)
    }

    /// Subscription filter for a topic template (`{device_id}` → `+`).
    pub fn subscription_filter(template: &str) -> String {
        template.replace("{device_id}", "+")
    }
}

/// Optional runtime overrides applied on top of a built-in profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverrides {
    pub up_control_topic: Option<String>,
    pub up_audio_topic: Option<String>,
    pub down_control_topic: Option<String>,
    pub down_audio_topic: Option<String>,
    pub qos_control: Option<u8>,
    pub qos_audio: Option<u8>,
    pub keepalive_seconds: Option<u16>,
    pub reconnect_min_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub audio_up_mode: Option<AudioUpMode>,
    pub packet_magic: Option<u8>,
    pub supports_tool_result: Option<bool>,
    pub supports_telemetry_normalize: Option<bool>,
}

pub const BUILTIN_PROFILES: &[&str] = &[
    "ec600mcnle_v1",
    "a7670c_v1",
    "sim7600g_h_v1",
    "ec800m_v1",
    "ml307r_dl_v1",
];

fn builtin(name: &str) -> Option<ModemProfile> {
    let profile = match name {
        "ec600mcnle_v1" => {
            let mut p = ModemProfile::base(name);
            p.supports_tool_result = true;
            p.supports_telemetry_normalize = true;
            p
        }
        "a7670c_v1" => {
            let mut p = ModemProfile::base(name);
            p.audio_up_mode = AudioUpMode::JsonB64;
            p.keepalive_seconds = 45;
            p
        }
        "sim7600g_h_v1" => {
            let mut p = ModemProfile::base(name);
            p.keepalive_seconds = 90;
            p.reconnect_min_ms = 2_000;
            p.reconnect_max_ms = 60_000;
            p
        }
        "ec800m_v1" => {
            let mut p = ModemProfile::base(name);
            p.packet_magic = 0xA2;
            p.supports_telemetry_normalize = true;
            p
        }
        "ml307r_dl_v1" => {
            let mut p = ModemProfile::base(name);
            p.audio_up_mode = AudioUpMode::JsonB64;
            p.qos_control = 2;
            p.keepalive_seconds = 30;
            p.supports_tool_result = true;
            p
        }
        _ => return None,
    };
    Some(profile)
}

/// Resolve a profile by name, applying overrides. Unknown names are an error;
/// callers treat that as fatal at startup.
pub fn resolve_profile(
    name: &str,
    overrides: &ProfileOverrides,
) -> Result<ModemProfile, ProtocolError> {
    let mut profile =
        builtin(name).ok_or_else(|| ProtocolError::UnknownProfile(name.to_string()))?;

    if let Some(v) = &overrides.up_control_topic {
        profile.up_control_topic = v.clone();
    }
    if let Some(v) = &overrides.up_audio_topic {
        profile.up_audio_topic = v.clone();
    }
    if let Some(v) = &overrides.down_control_topic {
        profile.down_control_topic = v.clone();
    }
    if let Some(v) = &overrides.down_audio_topic {
        profile.down_audio_topic = v.clone();
    }
    if let Some(v) = overrides.qos_control {
        profile.qos_control = v.min(2);
    }
    if let Some(v) = overrides.qos_audio {
        profile.qos_audio = v.min(2);
    }
    if let Some(v) = overrides.keepalive_seconds {
        profile.keepalive_seconds = v.max(10);
    }
    if let Some(v) = overrides.reconnect_min_ms {
        profile.reconnect_min_ms = v.max(100);
    }
    if let Some(v) = overrides.reconnect_max_ms {
        profile.reconnect_max_ms = v.max(profile.reconnect_min_ms);
    }
    if let Some(v) = overrides.audio_up_mode {
        profile.audio_up_mode = v;
    }
    if let Some(v) = overrides.packet_magic {
        profile.packet_magic = v;
    }
    if let Some(v) = overrides.supports_tool_result {
        profile.supports_tool_result = v;
    }
    if let Some(v) = overrides.supports_telemetry_normalize {
        profile.supports_telemetry_normalize = v;
    }
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_builtins_resolve() {
        for name in BUILTIN_PROFILES {
            let profile = resolve_profile(name, &ProfileOverrides::default()).unwrap();
            assert_eq!(&profile.name, name);
            assert!(profile.qos_control >= 1, "{name}: control must be reliable");
            assert_eq!(profile.qos_audio, 0, "{name}: audio is best-effort");
            assert!(profile.reconnect_min_ms <= profile.reconnect_max_ms);
        }
    }

    #[test]
    fn unknown_profile_is_error() {
        let err = resolve_profile("bg95_v9", &ProfileOverrides::default()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownProfile(_)));
    }

    #[test]
    fn overrides_supersede_builtin_fields() {
        let overrides = ProfileOverrides {
            up_control_topic: Some("cane/{device_id}/ctl".into()),
            packet_magic: Some(0xB7),
            audio_up_mode: Some(AudioUpMode::JsonB64),
            keepalive_seconds: Some(5),
            ..Default::default()
        };
        let profile = resolve_profile("ec600mcnle_v1", &overrides).unwrap();
        assert_eq!(profile.up_control_topic, "cane/{device_id}/ctl");
        assert_eq!(profile.packet_magic, 0xB7);
        assert_eq!(profile.audio_up_mode, AudioUpMode::JsonB64);
        // Floor applies to unreasonable keepalives.
        assert_eq!(profile.keepalive_seconds, 10);
    }

    #[test]
    fn topic_rendering() {
        assert_eq!(
            ModemProfile::render_topic("device/{device_id}/up/control", "dev-1"),
            "device/dev-1/up/control"
        );
        assert_eq!(
            ModemProfile::subscription_filter("device/{device_id}/up/audio"),
            "device/+/up/audio"
        );
    }
}
