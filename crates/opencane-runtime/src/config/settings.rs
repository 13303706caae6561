//! Settings file handling: `settings.json` in the data directory, replaced
//! atomically on save, with every field optional so partial files stay valid.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use opencane_protocol::ProfileOverrides;

const SETTINGS_FILE: &str = "settings.json";
/// Staging name used while replacing the settings file.
const SETTINGS_STAGING: &str = "settings.json.new";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_overrides: Option<ProfileOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_bind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_protection: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_window_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_audio_chunk_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_overflow_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_window_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_retry_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_startup: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_activated_devices: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_normalize: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_persist_samples: Option<bool>,
}

impl Settings {
    pub fn file_path(data_dir: &Path) -> PathBuf {
        data_dir.join(SETTINGS_FILE)
    }

    /// Load the settings for one data directory. A missing file is a fresh
    /// install and yields defaults; a file that exists but does not parse is
    /// an error, because overwriting it later would silently lose whatever
    /// the operator had written.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::file_path(data_dir);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Persist the settings, replacing the previous file atomically: the
    /// serialized form lands in a staging file first, then renames over the
    /// live one so a crash mid-save never leaves a half-written file.
    pub fn store(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        let serialized = serde_json::to_string_pretty(self)?;
        let staging = data_dir.join(SETTINGS_STAGING);
        std::fs::write(&staging, serialized.as_bytes())
            .with_context(|| format!("failed to write {}", staging.display()))?;
        std::fs::rename(&staging, Self::file_path(data_dir))?;
        Ok(())
    }
}
