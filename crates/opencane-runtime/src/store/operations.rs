//! Device operation log: outbound commands with a push lifecycle.

use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

use super::{now_ms, safe_json_parse};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceOperation {
    pub operation_id: String,
    pub device_id: String,
    pub session_id: String,
    pub op_type: String,
    pub command_type: String,
    pub status: String,
    pub payload: Option<Value>,
    pub result: Option<Value>,
    pub error: String,
    pub attempts: u32,
    pub next_attempt_at_ms: u64,
    pub created_at_ms: u64,
    pub acked_at_ms: u64,
}

fn row_to_operation(row: &rusqlite::Row) -> rusqlite::Result<DeviceOperation> {
    Ok(DeviceOperation {
        operation_id: row.get("operation_id")?,
        device_id: row.get("device_id")?,
        session_id: row.get("session_id")?,
        op_type: row.get("op_type")?,
        command_type: row.get("command_type")?,
        status: row.get("status")?,
        payload: safe_json_parse(row.get("payload")?),
        result: safe_json_parse(row.get("result")?),
        error: row.get("error")?,
        attempts: row.get::<_, i64>("attempts")? as u32,
        next_attempt_at_ms: row.get::<_, i64>("next_attempt_at_ms")? as u64,
        created_at_ms: row.get::<_, i64>("created_at_ms")? as u64,
        acked_at_ms: row.get::<_, i64>("acked_at_ms")? as u64,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn create_operation(
    conn: &Connection,
    operation_id: &str,
    device_id: &str,
    session_id: &str,
    op_type: &str,
    command_type: &str,
    status: &str,
    payload: &Value,
) -> anyhow::Result<()> {
    let now = now_ms() as i64;
    conn.execute(
        "INSERT INTO device_operations (
            operation_id, device_id, session_id, op_type, command_type,
            status, payload, created_at_ms, updated_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        ON CONFLICT (operation_id) DO UPDATE SET
            status = excluded.status,
            payload = excluded.payload,
            updated_at_ms = excluded.updated_at_ms",
        rusqlite::params![
            operation_id,
            device_id,
            session_id,
            op_type,
            command_type,
            status,
            payload.to_string(),
            now
        ],
    )?;
    Ok(())
}

/// Move an operation along its lifecycle
/// (`queued → sent → acked`, or `failed` / `canceled`).
pub fn mark_operation(
    conn: &Connection,
    operation_id: &str,
    status: &str,
    result: Option<&Value>,
    error: &str,
) -> bool {
    let now = now_ms() as i64;
    let acked_at = if status == "acked" { now } else { 0 };
    let result = conn.execute(
        "UPDATE device_operations
         SET status = ?2, result = COALESCE(?3, result), error = ?4,
             attempts = attempts + 1, updated_at_ms = ?5,
             acked_at_ms = CASE WHEN ?6 > 0 THEN ?6 ELSE acked_at_ms END
         WHERE operation_id = ?1",
        rusqlite::params![
            operation_id,
            status,
            result.map(|v| v.to_string()),
            error,
            now,
            acked_at
        ],
    );
    matches!(result, Ok(n) if n > 0)
}

pub fn get_operation(conn: &Connection, operation_id: &str) -> Option<DeviceOperation> {
    conn.prepare("SELECT * FROM device_operations WHERE operation_id = ?1")
        .ok()?
        .query_row(rusqlite::params![operation_id], row_to_operation)
        .ok()
}

pub fn list_operations(
    conn: &Connection,
    device_id: Option<&str>,
    status: Option<&str>,
    limit: usize,
) -> Vec<DeviceOperation> {
    let mut sql = String::from("SELECT * FROM device_operations WHERE 1=1");
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    if let Some(device_id) = device_id {
        sql.push_str(" AND device_id = ?");
        params.push(Box::new(device_id.to_string()));
    }
    if let Some(status) = status {
        sql.push_str(" AND status = ?");
        params.push(Box::new(status.to_string()));
    }
    sql.push_str(" ORDER BY created_at_ms DESC LIMIT ?");
    params.push(Box::new(limit.clamp(1, 500) as i64));

    let Ok(mut stmt) = conn.prepare(&sql) else {
        return vec![];
    };
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    stmt.query_map(param_refs.as_slice(), row_to_operation)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    #[test]
    fn operation_lifecycle() {
        let store = Store::new_in_memory().unwrap();
        let conn = store.conn();
        create_operation(
            &conn,
            "op-1",
            "dev-1",
            "s1",
            "set_config",
            "set_config",
            "queued",
            &json!({"volume": 80}),
        )
        .unwrap();

        assert!(mark_operation(&conn, "op-1", "sent", None, ""));
        assert!(mark_operation(&conn, "op-1", "acked", Some(&json!({"ok": true})), ""));
        let op = get_operation(&conn, "op-1").unwrap();
        assert_eq!(op.status, "acked");
        assert!(op.acked_at_ms > 0);
        assert_eq!(op.attempts, 2);

        assert!(!mark_operation(&conn, "missing", "failed", None, "x"));
        assert_eq!(list_operations(&conn, Some("dev-1"), None, 10).len(), 1);
        assert!(list_operations(&conn, Some("dev-1"), Some("queued"), 10).is_empty());
    }
}
