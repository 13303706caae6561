//! Device session and binding persistence.

use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

use crate::session::SessionSnapshot;

use super::{now_ms, safe_json_parse};

#[derive(Debug, Clone, Serialize)]
pub struct StoredDeviceSession {
    pub device_id: String,
    pub session_id: String,
    pub state: String,
    pub created_at_ms: u64,
    pub last_seen_ms: u64,
    pub last_recv_seq: i64,
    pub outbound_seq: i64,
    pub metadata: Option<Value>,
    pub telemetry: Option<Value>,
    pub close_reason: String,
    pub closed_at_ms: u64,
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<StoredDeviceSession> {
    Ok(StoredDeviceSession {
        device_id: row.get("device_id")?,
        session_id: row.get("session_id")?,
        state: row.get("state")?,
        created_at_ms: row.get::<_, i64>("created_at_ms")? as u64,
        last_seen_ms: row.get::<_, i64>("last_seen_ms")? as u64,
        last_recv_seq: row.get("last_recv_seq")?,
        outbound_seq: row.get("outbound_seq")?,
        metadata: safe_json_parse(row.get("metadata")?),
        telemetry: safe_json_parse(row.get("telemetry")?),
        close_reason: row.get("close_reason")?,
        closed_at_ms: row.get::<_, i64>("closed_at_ms")? as u64,
    })
}

pub fn upsert_device_session(
    conn: &Connection,
    snapshot: &SessionSnapshot,
) -> anyhow::Result<()> {
    let metadata = serde_json::to_string(&snapshot.metadata)?;
    let telemetry = serde_json::to_string(&snapshot.telemetry)?;
    conn.execute(
        "INSERT INTO device_sessions (
            device_id, session_id, state, created_at_ms, last_seen_ms,
            last_recv_seq, outbound_seq, metadata, telemetry,
            close_reason, closed_at_ms, updated_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT (device_id, session_id) DO UPDATE SET
            state = excluded.state,
            last_seen_ms = excluded.last_seen_ms,
            last_recv_seq = excluded.last_recv_seq,
            outbound_seq = excluded.outbound_seq,
            metadata = excluded.metadata,
            telemetry = excluded.telemetry,
            close_reason = excluded.close_reason,
            closed_at_ms = excluded.closed_at_ms,
            updated_at_ms = excluded.updated_at_ms",
        rusqlite::params![
            snapshot.device_id,
            snapshot.session_id,
            snapshot.state.as_str(),
            snapshot.created_at_ms as i64,
            snapshot.last_seen_ms as i64,
            snapshot.last_recv_seq,
            snapshot.outbound_seq,
            metadata,
            telemetry,
            snapshot.close_reason,
            snapshot.closed_at_ms as i64,
            now_ms() as i64,
        ],
    )?;
    Ok(())
}

pub fn close_device_session(
    conn: &Connection,
    device_id: &str,
    session_id: &str,
    reason: &str,
    closed_at_ms: u64,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE device_sessions
         SET state = 'closing', close_reason = ?3, closed_at_ms = ?4, updated_at_ms = ?5
         WHERE device_id = ?1 AND session_id = ?2",
        rusqlite::params![
            device_id,
            session_id,
            reason,
            closed_at_ms as i64,
            now_ms() as i64
        ],
    )?;
    Ok(())
}

pub fn list_device_sessions(
    conn: &Connection,
    device_id: Option<&str>,
    limit: usize,
) -> Vec<StoredDeviceSession> {
    let limit = limit.clamp(1, 500) as i64;
    let result = match device_id {
        Some(device) => conn
            .prepare(
                "SELECT * FROM device_sessions WHERE device_id = ?1
                 ORDER BY updated_at_ms DESC LIMIT ?2",
            )
            .and_then(|mut stmt| {
                stmt.query_map(rusqlite::params![device, limit], row_to_session)
                    .map(|rows| rows.filter_map(|r| r.ok()).collect())
            }),
        None => conn
            .prepare("SELECT * FROM device_sessions ORDER BY updated_at_ms DESC LIMIT ?1")
            .and_then(|mut stmt| {
                stmt.query_map(rusqlite::params![limit], row_to_session)
                    .map(|rows| rows.filter_map(|r| r.ok()).collect())
            }),
    };
    result.unwrap_or_default()
}

// --- Device identity bindings ---

#[derive(Debug, Clone, Serialize)]
pub struct DeviceBinding {
    pub device_id: String,
    pub status: String,
    pub user_id: String,
    pub activated_at_ms: u64,
    pub revoked_at_ms: u64,
    pub revoke_reason: String,
    pub created_at_ms: u64,
}

fn row_to_binding(row: &rusqlite::Row) -> rusqlite::Result<DeviceBinding> {
    Ok(DeviceBinding {
        device_id: row.get("device_id")?,
        status: row.get("status")?,
        user_id: row.get("user_id")?,
        activated_at_ms: row.get::<_, i64>("activated_at_ms")? as u64,
        revoked_at_ms: row.get::<_, i64>("revoked_at_ms")? as u64,
        revoke_reason: row.get("revoke_reason")?,
        created_at_ms: row.get::<_, i64>("created_at_ms")? as u64,
    })
}

pub fn register_device(
    conn: &Connection,
    device_id: &str,
    device_token: &str,
) -> anyhow::Result<DeviceBinding> {
    let now = now_ms() as i64;
    conn.execute(
        "INSERT INTO device_bindings (device_id, device_token, status, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, 'registered', ?3, ?3)
         ON CONFLICT (device_id) DO UPDATE SET
             device_token = excluded.device_token,
             status = 'registered',
             revoked_at_ms = 0,
             revoke_reason = '',
             updated_at_ms = excluded.updated_at_ms",
        rusqlite::params![device_id, device_token, now],
    )?;
    get_device_binding(conn, device_id)
        .ok_or_else(|| anyhow::anyhow!("failed to register device {device_id}"))
}

pub fn bind_device(conn: &Connection, device_id: &str, user_id: &str) -> bool {
    let result = conn.execute(
        "UPDATE device_bindings
         SET user_id = ?2, status = 'bound', updated_at_ms = ?3
         WHERE device_id = ?1 AND status != 'revoked'",
        rusqlite::params![device_id, user_id, now_ms() as i64],
    );
    matches!(result, Ok(n) if n > 0)
}

pub fn activate_device(conn: &Connection, device_id: &str) -> bool {
    let now = now_ms() as i64;
    let result = conn.execute(
        "UPDATE device_bindings
         SET status = 'activated', activated_at_ms = ?2, updated_at_ms = ?2
         WHERE device_id = ?1 AND status != 'revoked'",
        rusqlite::params![device_id, now],
    );
    matches!(result, Ok(n) if n > 0)
}

pub fn revoke_device(conn: &Connection, device_id: &str, reason: &str) -> bool {
    let now = now_ms() as i64;
    let result = conn.execute(
        "UPDATE device_bindings
         SET status = 'revoked', revoked_at_ms = ?2, revoke_reason = ?3, updated_at_ms = ?2
         WHERE device_id = ?1",
        rusqlite::params![device_id, now, reason],
    );
    matches!(result, Ok(n) if n > 0)
}

pub fn get_device_binding(conn: &Connection, device_id: &str) -> Option<DeviceBinding> {
    conn.prepare("SELECT * FROM device_bindings WHERE device_id = ?1")
        .ok()?
        .query_row(rusqlite::params![device_id], row_to_binding)
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionManager, SessionState};
    use crate::store::Store;
    use std::sync::Arc;

    #[test]
    fn session_upsert_and_close_roundtrip() {
        let store = Arc::new(Store::new_in_memory().unwrap());
        let manager = SessionManager::new(Some(store.clone()), 64, 32);
        let snap = manager.get_or_create("dev-1", Some("s1"));
        assert_eq!(snap.state, SessionState::Authed);

        let rows = list_device_sessions(&store.conn(), Some("dev-1"), 10);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "authed");

        manager.close(&("dev-1".into(), "s1".into()), "idle_timeout");
        let rows = list_device_sessions(&store.conn(), Some("dev-1"), 10);
        assert_eq!(rows[0].state, "closing");
        assert_eq!(rows[0].close_reason, "idle_timeout");
    }

    #[test]
    fn binding_lifecycle() {
        let store = Store::new_in_memory().unwrap();
        let conn = store.conn();

        let binding = register_device(&conn, "dev-9", "tok-1").unwrap();
        assert_eq!(binding.status, "registered");

        assert!(bind_device(&conn, "dev-9", "user-7"));
        assert!(activate_device(&conn, "dev-9"));
        let binding = get_device_binding(&conn, "dev-9").unwrap();
        assert_eq!(binding.status, "activated");
        assert_eq!(binding.user_id, "user-7");
        assert!(binding.activated_at_ms > 0);

        assert!(revoke_device(&conn, "dev-9", "lost"));
        let binding = get_device_binding(&conn, "dev-9").unwrap();
        assert_eq!(binding.status, "revoked");
        // Revoked devices cannot be re-bound.
        assert!(!bind_device(&conn, "dev-9", "user-8"));
        // Unknown devices are a no-op.
        assert!(!activate_device(&conn, "nope"));
    }
}
