pub mod lifelog;
pub mod operations;
pub mod sessions;
pub mod tasks;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i64 = 1;

const REQUIRED_TABLES: &[&str] = &[
    "device_sessions",
    "device_bindings",
    "lifelog_events",
    "lifelog_images",
    "lifelog_contexts",
    "digital_tasks",
    "digital_task_push_queue",
    "device_operations",
    "thought_traces",
    "runtime_observability_samples",
];

/// Process-wide SQLite handle. Writes serialize through the connection mutex;
/// the per-table modules expose free functions over `&Connection`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn new(path: &str) -> Result<Self> {
        let db_path = Path::new(path);
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create database directory {}", dir.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("failed to open database at {path}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.configure_pragmas()?;
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.configure_pragmas()?;
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
            .context("failed to configure database pragmas")?;
        debug!("database pragmas configured");
        Ok(())
    }

    fn get_schema_version(&self) -> Result<i64> {
        let version: i64 = self
            .conn
            .lock()
            .unwrap()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .context("failed to read schema version")?;
        Ok(version)
    }

    fn set_schema_version(&self, version: i64) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .pragma_update(None, "user_version", version)
            .context("failed to set schema version")?;
        Ok(())
    }

    fn initialize_schema(&self) -> Result<()> {
        let current_version = self.get_schema_version()?;
        info!(
            current_version,
            target_version = SCHEMA_VERSION,
            "checking schema version"
        );

        if current_version == 0 {
            self.create_tables()?;
            self.set_schema_version(SCHEMA_VERSION)?;
            info!("created database schema v{SCHEMA_VERSION}");
            return Ok(());
        }

        if current_version < SCHEMA_VERSION {
            self.migrate_schema(current_version)?;
        }
        self.assert_required_tables()?;
        Ok(())
    }

    fn assert_required_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .context("failed to prepare table check query")?;

        let missing: Vec<&str> = REQUIRED_TABLES
            .iter()
            .filter(|&&table| !stmt.exists(rusqlite::params![table]).unwrap_or(false))
            .copied()
            .collect();

        if !missing.is_empty() {
            anyhow::bail!(
                "SQLite schema is missing required tables ({}). \
                 Back up and rebuild the database, or run an offline migration first.",
                missing.join(", ")
            );
        }
        Ok(())
    }

    fn create_tables(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS device_sessions (
                    device_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    created_at_ms INTEGER NOT NULL,
                    last_seen_ms INTEGER NOT NULL,
                    last_recv_seq INTEGER NOT NULL DEFAULT -1,
                    outbound_seq INTEGER NOT NULL DEFAULT 0,
                    metadata TEXT,
                    telemetry TEXT,
                    close_reason TEXT NOT NULL DEFAULT '',
                    closed_at_ms INTEGER NOT NULL DEFAULT 0,
                    updated_at_ms INTEGER NOT NULL,
                    PRIMARY KEY (device_id, session_id)
                );
                CREATE INDEX IF NOT EXISTS idx_device_sessions_state
                    ON device_sessions(state);

                CREATE TABLE IF NOT EXISTS device_bindings (
                    device_id TEXT PRIMARY KEY,
                    device_token TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'registered',
                    user_id TEXT NOT NULL DEFAULT '',
                    activated_at_ms INTEGER NOT NULL DEFAULT 0,
                    revoked_at_ms INTEGER NOT NULL DEFAULT 0,
                    revoke_reason TEXT NOT NULL DEFAULT '',
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS lifelog_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload TEXT,
                    risk_level TEXT NOT NULL DEFAULT 'P3',
                    confidence REAL NOT NULL DEFAULT 0,
                    ts INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_lifelog_events_session_ts
                    ON lifelog_events(session_id, ts);
                CREATE INDEX IF NOT EXISTS idx_lifelog_events_type
                    ON lifelog_events(event_type);",
            )
            .context("failed to create tables (part 1)")?;

        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS lifelog_images (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    image_uri TEXT NOT NULL,
                    dhash TEXT NOT NULL DEFAULT '',
                    content_hash TEXT NOT NULL DEFAULT '',
                    is_dedup INTEGER NOT NULL DEFAULT 0,
                    ts INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_lifelog_images_session_ts
                    ON lifelog_images(session_id, ts);

                CREATE TABLE IF NOT EXISTS lifelog_contexts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    image_id INTEGER NOT NULL,
                    semantic_summary TEXT NOT NULL DEFAULT '',
                    objects TEXT,
                    ocr TEXT,
                    risk_hints TEXT,
                    actionable_summary TEXT NOT NULL DEFAULT '',
                    risk_level TEXT NOT NULL DEFAULT 'P3',
                    risk_score REAL NOT NULL DEFAULT 0,
                    confidence REAL NOT NULL DEFAULT 0,
                    ts INTEGER NOT NULL,
                    FOREIGN KEY (image_id) REFERENCES lifelog_images(id) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS idx_lifelog_contexts_image
                    ON lifelog_contexts(image_id);",
            )
            .context("failed to create tables (part 2)")?;

        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS digital_tasks (
                    task_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    device_id TEXT NOT NULL DEFAULT '',
                    goal TEXT NOT NULL,
                    status TEXT NOT NULL,
                    steps TEXT,
                    result TEXT,
                    error TEXT NOT NULL DEFAULT '',
                    timeout_seconds INTEGER NOT NULL,
                    deadline_ms INTEGER NOT NULL,
                    notify INTEGER NOT NULL DEFAULT 1,
                    speak INTEGER NOT NULL DEFAULT 1,
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_digital_tasks_session
                    ON digital_tasks(session_id);
                CREATE INDEX IF NOT EXISTS idx_digital_tasks_status
                    ON digital_tasks(status);

                CREATE TABLE IF NOT EXISTS digital_task_push_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL,
                    device_id TEXT NOT NULL,
                    session_id TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL,
                    payload TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    next_attempt_at_ms INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT NOT NULL DEFAULT '',
                    sent_at_ms INTEGER NOT NULL DEFAULT 0,
                    created_at_ms INTEGER NOT NULL,
                    UNIQUE (device_id, task_id, status)
                );
                CREATE INDEX IF NOT EXISTS idx_push_queue_device
                    ON digital_task_push_queue(device_id, sent_at_ms);

                CREATE TABLE IF NOT EXISTS device_operations (
                    operation_id TEXT PRIMARY KEY,
                    device_id TEXT NOT NULL,
                    session_id TEXT NOT NULL DEFAULT '',
                    op_type TEXT NOT NULL,
                    command_type TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'queued',
                    payload TEXT,
                    result TEXT,
                    error TEXT NOT NULL DEFAULT '',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    next_attempt_at_ms INTEGER NOT NULL DEFAULT 0,
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL,
                    acked_at_ms INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_device_operations_device
                    ON device_operations(device_id, status);

                CREATE TABLE IF NOT EXISTS thought_traces (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    trace_id TEXT NOT NULL,
                    session_id TEXT NOT NULL DEFAULT '',
                    source TEXT NOT NULL DEFAULT '',
                    stage TEXT NOT NULL DEFAULT '',
                    payload TEXT,
                    ts INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_thought_traces_trace
                    ON thought_traces(trace_id, ts);

                CREATE TABLE IF NOT EXISTS runtime_observability_samples (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts INTEGER NOT NULL,
                    payload TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_observability_samples_ts
                    ON runtime_observability_samples(ts);",
            )
            .context("failed to create tables (part 3)")?;

        Ok(())
    }

    fn migrate_schema(&self, from_version: i64) -> Result<()> {
        let mut version = from_version;
        while version < SCHEMA_VERSION {
            info!(from = version, to = version + 1, "migrating schema");
            match version {
                _ => {
                    warn!(version, "unknown schema version, skipping");
                }
            }
            version += 1;
            self.set_schema_version(version)?;
        }
        info!(version = SCHEMA_VERSION, "schema migration complete");
        Ok(())
    }
}

pub(crate) fn now_ms() -> u64 {
    opencane_protocol::envelope::now_ms()
}

pub(crate) fn safe_json_parse(value: Option<String>) -> Option<serde_json::Value> {
    value.and_then(|s| serde_json::from_str(&s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_creates_schema() {
        let store = Store::new_in_memory().unwrap();
        let version = store.get_schema_version().unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        store.assert_required_tables().unwrap();
    }

    #[test]
    fn store_opens_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opencane.db");
        let store = Store::new(path.to_str().unwrap()).unwrap();
        drop(store);
        // Re-open: schema is already at the target version.
        let store = Store::new(path.to_str().unwrap()).unwrap();
        store.assert_required_tables().unwrap();
    }
}
