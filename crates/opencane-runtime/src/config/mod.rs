//! Resolved runtime configuration: settings file + `OPENCANE_*` environment
//! overrides, validated at startup. An unknown adapter or modem profile is
//! fatal before anything starts.

pub mod settings;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use opencane_protocol::{resolve_profile, ModemProfile, ProfileOverrides};

use crate::audio::AudioConfig;
use crate::connection::{ConnectionConfig, TtsMode};
use crate::ingest::OverflowPolicy;
use crate::task::TaskConfig;
use crate::vision::VisionConfig;

pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 18792;
pub const SUPPORTED_ADAPTERS: &[&str] = &["mock", "websocket", "generic_mqtt", "ec600"];

#[derive(Debug, Clone)]
pub struct Configuration {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub assets_root: PathBuf,
    pub adapter: String,
    pub profile: ModemProfile,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub websocket_bind: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub auth_token: Option<String>,
    pub replay_protection: bool,
    pub replay_window_seconds: u64,
    pub ingest_capacity: usize,
    pub ingest_workers: usize,
    pub ingest_overflow_policy: OverflowPolicy,
    pub audio: AudioConfig,
    pub vision: VisionConfig,
    pub tasks: TaskConfig,
    pub connection: ConnectionConfig,
    pub strict_startup: bool,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
}

impl Configuration {
    /// Resolve configuration from the data dir's settings file plus
    /// environment overrides, then validate.
    pub fn create() -> Result<Self> {
        let data_dir = env_string("OPENCANE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(home).join(".opencane")
            });
        let file = settings::Settings::load(&data_dir).context("failed to load settings")?;

        let adapter = env_string("OPENCANE_ADAPTER")
            .or(file.adapter)
            .unwrap_or_else(|| "mock".to_string());
        if !SUPPORTED_ADAPTERS.contains(&adapter.as_str()) {
            bail!(
                "unsupported adapter '{adapter}' (expected one of: {})",
                SUPPORTED_ADAPTERS.join(", ")
            );
        }

        // The ec600 adapter is the legacy profile pinned to its modem family.
        let profile_name = if adapter == "ec600" {
            "ec600mcnle_v1".to_string()
        } else {
            env_string("OPENCANE_PROFILE")
                .or(file.profile)
                .unwrap_or_else(|| "ec600mcnle_v1".to_string())
        };
        let overrides = file.profile_overrides.unwrap_or_else(ProfileOverrides::default);
        let profile = resolve_profile(&profile_name, &overrides)
            .map_err(|e| anyhow::anyhow!("{e} (known profiles: ec600mcnle_v1, a7670c_v1, sim7600g_h_v1, ec800m_v1, ml307r_dl_v1)"))?;

        let tts_mode = env_string("OPENCANE_TTS_MODE")
            .or(file.tts_mode)
            .unwrap_or_else(|| "device_text".to_string());
        let tts_mode = TtsMode::parse(&tts_mode)
            .with_context(|| format!("invalid ttsMode '{tts_mode}' (device_text | server_audio)"))?;

        let overflow = env_string("OPENCANE_INGEST_OVERFLOW")
            .or(file.ingest_overflow_policy)
            .unwrap_or_else(|| "reject".to_string());
        let ingest_overflow_policy = OverflowPolicy::parse(&overflow).with_context(|| {
            format!("invalid ingestOverflowPolicy '{overflow}' (reject | wait | drop_oldest)")
        })?;

        let mut connection = ConnectionConfig {
            tts_mode,
            require_activated_devices: env_bool("OPENCANE_REQUIRE_ACTIVATED")
                .or(file.require_activated_devices)
                .unwrap_or(false),
            tool_result_enabled: env_bool("OPENCANE_TOOL_RESULT")
                .or(file.tool_result_enabled)
                .unwrap_or(false),
            telemetry_normalize_enabled: env_bool("OPENCANE_TELEMETRY_NORMALIZE")
                .or(file.telemetry_normalize)
                .unwrap_or(profile.supports_telemetry_normalize),
            telemetry_persist_samples: env_bool("OPENCANE_TELEMETRY_PERSIST")
                .or(file.telemetry_persist_samples)
                .unwrap_or(false),
            ..ConnectionConfig::default()
        };
        if let Some(bytes) = env_parse::<usize>("OPENCANE_TTS_CHUNK_BYTES").or(file.tts_audio_chunk_bytes)
        {
            connection.tts_audio_chunk_bytes = bytes.max(256);
        }
        if let Some(minutes) = env_parse::<u64>("OPENCANE_IDLE_TIMEOUT_MIN").or(file.idle_timeout_minutes)
        {
            connection.idle_timeout_ms = minutes.max(1) * 60 * 1000;
        }
        if !profile.supports_tool_result {
            connection.tool_result_enabled = false;
        }

        let mut vision = VisionConfig::default();
        if let Some(threshold) = env_parse::<u32>("OPENCANE_DEDUP_THRESHOLD").or(file.dedup_threshold) {
            vision.dedup_threshold = threshold.min(64);
        }
        if let Some(minutes) = env_parse::<u64>("OPENCANE_DEDUP_WINDOW_MIN").or(file.dedup_window_minutes)
        {
            vision.dedup_window_ms = minutes.max(1) * 60 * 1000;
        }

        let tasks = TaskConfig {
            default_timeout_seconds: env_parse("OPENCANE_TASK_TIMEOUT_S")
                .or(file.task_timeout_seconds)
                .unwrap_or(120)
                .max(1),
            max_concurrent_tasks: env_parse("OPENCANE_TASK_CONCURRENCY")
                .or(file.max_concurrent_tasks)
                .unwrap_or(4)
                .max(1),
            status_retry_count: env_parse("OPENCANE_TASK_RETRY_COUNT")
                .or(file.status_retry_count)
                .unwrap_or(2),
            status_retry_backoff_ms: env_parse("OPENCANE_TASK_RETRY_BACKOFF_MS")
                .or(file.status_retry_backoff_ms)
                .unwrap_or(300),
        };

        Ok(Self {
            db_path: data_dir.join("opencane.db"),
            assets_root: data_dir.join("lifelog").join("images"),
            adapter,
            profile,
            mqtt_host: env_string("OPENCANE_MQTT_HOST")
                .or(file.mqtt_host)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: env_parse("OPENCANE_MQTT_PORT").or(file.mqtt_port).unwrap_or(1883),
            mqtt_client_id: env_string("OPENCANE_MQTT_CLIENT_ID")
                .or(file.mqtt_client_id)
                .unwrap_or_else(|| "opencane-runtime".to_string()),
            mqtt_username: env_string("OPENCANE_MQTT_USERNAME").or(file.mqtt_username),
            mqtt_password: env_string("OPENCANE_MQTT_PASSWORD").or(file.mqtt_password),
            websocket_bind: env_string("OPENCANE_WS_BIND")
                .or(file.websocket_bind)
                .unwrap_or_else(|| "0.0.0.0:18790".to_string()),
            listen_host: env_string("OPENCANE_LISTEN_HOST")
                .or(file.listen_host)
                .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string()),
            listen_port: env_parse("OPENCANE_LISTEN_PORT")
                .or(file.listen_port)
                .unwrap_or(DEFAULT_LISTEN_PORT),
            auth_token: env_string("OPENCANE_AUTH_TOKEN").or(file.auth_token),
            replay_protection: env_bool("OPENCANE_REPLAY_PROTECTION")
                .or(file.replay_protection)
                .unwrap_or(false),
            replay_window_seconds: env_parse("OPENCANE_REPLAY_WINDOW_S")
                .or(file.replay_window_seconds)
                .unwrap_or(300)
                .max(10),
            ingest_capacity: env_parse("OPENCANE_INGEST_CAPACITY")
                .or(file.ingest_capacity)
                .unwrap_or(128)
                .max(1),
            ingest_workers: env_parse("OPENCANE_INGEST_WORKERS")
                .or(file.ingest_workers)
                .unwrap_or(4)
                .max(1),
            ingest_overflow_policy,
            audio: AudioConfig::default(),
            vision,
            tasks,
            connection,
            strict_startup: env_bool("OPENCANE_STRICT_STARTUP")
                .or(file.strict_startup)
                .unwrap_or(false),
            data_dir,
        })
    }
}
