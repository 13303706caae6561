//! Digital task and push-queue persistence.
//!
//! Status transitions go through `update_task_if_status` so terminal states
//! stay sinks even when executor, canceller, and timeout race.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{now_ms, safe_json_parse};

pub const FINAL_STATUSES: &[&str] = &["success", "failed", "timeout", "canceled"];

#[derive(Debug, Clone, Serialize)]
pub struct StoredTask {
    pub task_id: String,
    pub session_id: String,
    pub device_id: String,
    pub goal: String,
    pub status: String,
    pub steps: Vec<Value>,
    pub result: Option<Value>,
    pub error: String,
    pub timeout_seconds: u64,
    pub deadline_ms: u64,
    pub notify: bool,
    pub speak: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl StoredTask {
    pub fn is_final(&self) -> bool {
        FINAL_STATUSES.contains(&self.status.as_str())
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<StoredTask> {
    let steps = safe_json_parse(row.get("steps")?)
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    Ok(StoredTask {
        task_id: row.get("task_id")?,
        session_id: row.get("session_id")?,
        device_id: row.get("device_id")?,
        goal: row.get("goal")?,
        status: row.get("status")?,
        steps,
        result: safe_json_parse(row.get("result")?),
        error: row.get("error")?,
        timeout_seconds: row.get::<_, i64>("timeout_seconds")? as u64,
        deadline_ms: row.get::<_, i64>("deadline_ms")? as u64,
        notify: row.get::<_, i64>("notify")? == 1,
        speak: row.get::<_, i64>("speak")? == 1,
        created_at_ms: row.get::<_, i64>("created_at_ms")? as u64,
        updated_at_ms: row.get::<_, i64>("updated_at_ms")? as u64,
    })
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub session_id: String,
    pub device_id: String,
    pub goal: String,
    pub steps: Vec<Value>,
    pub timeout_seconds: u64,
    pub notify: bool,
    pub speak: bool,
}

pub fn create_task(conn: &Connection, task: &NewTask) -> anyhow::Result<StoredTask> {
    let now = now_ms();
    let deadline_ms = now + task.timeout_seconds * 1000;
    conn.execute(
        "INSERT INTO digital_tasks (
            task_id, session_id, device_id, goal, status, steps, result, error,
            timeout_seconds, deadline_ms, notify, speak, created_at_ms, updated_at_ms
        ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, NULL, '', ?6, ?7, ?8, ?9, ?10, ?10)",
        rusqlite::params![
            task.task_id,
            task.session_id,
            task.device_id,
            task.goal,
            serde_json::to_string(&task.steps)?,
            task.timeout_seconds as i64,
            deadline_ms as i64,
            task.notify as i64,
            task.speak as i64,
            now as i64,
        ],
    )?;
    get_task(conn, &task.task_id).ok_or_else(|| anyhow::anyhow!("failed to create task"))
}

pub fn get_task(conn: &Connection, task_id: &str) -> Option<StoredTask> {
    conn.prepare("SELECT * FROM digital_tasks WHERE task_id = ?1")
        .ok()?
        .query_row(rusqlite::params![task_id], row_to_task)
        .ok()
}

/// Compare-and-set transition. Returns false when the task was not in one of
/// the expected statuses (terminal statuses are sinks).
pub fn update_task_if_status(
    conn: &Connection,
    task_id: &str,
    expected: &HashSet<&str>,
    status: &str,
    result: Option<&Value>,
    error: &str,
) -> bool {
    let placeholders: Vec<String> = (0..expected.len()).map(|i| format!("?{}", i + 6)).collect();
    let sql = format!(
        "UPDATE digital_tasks
         SET status = ?1, result = COALESCE(?2, result), error = ?3, updated_at_ms = ?4
         WHERE task_id = ?5 AND status IN ({})",
        placeholders.join(", ")
    );
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(status.to_string()),
        Box::new(result.map(|v| v.to_string())),
        Box::new(error.to_string()),
        Box::new(now_ms() as i64),
        Box::new(task_id.to_string()),
    ];
    for expected_status in expected {
        params.push(Box::new(expected_status.to_string()));
    }
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    matches!(conn.execute(&sql, param_refs.as_slice()), Ok(n) if n > 0)
}

/// Append one step to the task's append-only step log.
pub fn append_step(conn: &Connection, task_id: &str, stage: &str, status: &str, message: &str) {
    let Some(task) = get_task(conn, task_id) else {
        return;
    };
    let mut steps = task.steps;
    let mut step = Map::new();
    step.insert("ts".into(), serde_json::json!(now_ms()));
    step.insert("stage".into(), serde_json::json!(stage));
    step.insert("status".into(), serde_json::json!(status));
    step.insert("message".into(), serde_json::json!(message));
    steps.push(Value::Object(step));
    let _ = conn.execute(
        "UPDATE digital_tasks SET steps = ?2, updated_at_ms = ?3 WHERE task_id = ?1",
        rusqlite::params![
            task_id,
            serde_json::to_string(&steps).unwrap_or_default(),
            now_ms() as i64
        ],
    );
}

pub fn list_tasks(
    conn: &Connection,
    session_id: Option<&str>,
    status: Option<&str>,
    limit: usize,
    offset: usize,
) -> Vec<StoredTask> {
    let mut sql = String::from("SELECT * FROM digital_tasks WHERE 1=1");
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    if let Some(session_id) = session_id {
        sql.push_str(" AND session_id = ?");
        params.push(Box::new(session_id.to_string()));
    }
    if let Some(status) = status {
        sql.push_str(" AND status = ?");
        params.push(Box::new(status.to_string()));
    }
    sql.push_str(" ORDER BY created_at_ms DESC LIMIT ? OFFSET ?");
    params.push(Box::new(limit.clamp(1, 500) as i64));
    params.push(Box::new(offset as i64));

    let Ok(mut stmt) = conn.prepare(&sql) else {
        return vec![];
    };
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    stmt.query_map(param_refs.as_slice(), row_to_task)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

pub fn list_unfinished_tasks(conn: &Connection, limit: usize) -> Vec<StoredTask> {
    let Ok(mut stmt) = conn.prepare(
        "SELECT * FROM digital_tasks WHERE status IN ('pending', 'running')
         ORDER BY created_at_ms ASC LIMIT ?1",
    ) else {
        return vec![];
    };
    stmt.query_map(rusqlite::params![limit.clamp(1, 1000) as i64], row_to_task)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

/// Latest non-terminal task for one device, if any.
pub fn active_task_for_device(conn: &Connection, device_id: &str) -> Option<StoredTask> {
    conn.prepare(
        "SELECT * FROM digital_tasks
         WHERE device_id = ?1 AND status IN ('pending', 'running')
         ORDER BY created_at_ms DESC LIMIT 1",
    )
    .ok()?
    .query_row(rusqlite::params![device_id], row_to_task)
    .ok()
}

pub fn task_stats(conn: &Connection, session_id: Option<&str>) -> Map<String, Value> {
    let mut stats = Map::new();
    let (sql, has_filter) = match session_id {
        Some(_) => (
            "SELECT status, COUNT(*) FROM digital_tasks WHERE session_id = ?1 GROUP BY status",
            true,
        ),
        None => ("SELECT status, COUNT(*) FROM digital_tasks GROUP BY status", false),
    };
    let Ok(mut stmt) = conn.prepare(sql) else {
        return stats;
    };
    let mapper = |row: &rusqlite::Row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?));
    let rows = if has_filter {
        stmt.query_map(rusqlite::params![session_id.unwrap()], mapper)
    } else {
        stmt.query_map([], mapper)
    };
    let mut total = 0i64;
    if let Ok(rows) = rows {
        for (status, count) in rows.flatten() {
            total += count;
            stats.insert(status, serde_json::json!(count));
        }
    }
    stats.insert("total".into(), serde_json::json!(total));
    stats
}

// --- Push queue ---

#[derive(Debug, Clone, Serialize)]
pub struct PushQueueEntry {
    pub id: i64,
    pub task_id: String,
    pub device_id: String,
    pub session_id: String,
    pub status: String,
    pub payload: Option<Value>,
    pub attempts: u32,
    pub next_attempt_at_ms: u64,
    pub last_error: String,
}

fn row_to_push(row: &rusqlite::Row) -> rusqlite::Result<PushQueueEntry> {
    Ok(PushQueueEntry {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        device_id: row.get("device_id")?,
        session_id: row.get("session_id")?,
        status: row.get("status")?,
        payload: safe_json_parse(row.get("payload")?),
        attempts: row.get::<_, i64>("attempts")? as u32,
        next_attempt_at_ms: row.get::<_, i64>("next_attempt_at_ms")? as u64,
        last_error: row.get("last_error")?,
    })
}

/// Queue one status push. Keyed by `(device_id, task_id, status)` so retries
/// of the same transition share one row.
pub fn enqueue_push(
    conn: &Connection,
    task_id: &str,
    device_id: &str,
    session_id: &str,
    status: &str,
    payload: &Value,
    error: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO digital_task_push_queue (
            task_id, device_id, session_id, status, payload, attempts,
            next_attempt_at_ms, last_error, created_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?7)
        ON CONFLICT (device_id, task_id, status) DO UPDATE SET
            payload = excluded.payload,
            last_error = excluded.last_error,
            sent_at_ms = 0",
        rusqlite::params![
            task_id,
            device_id,
            session_id,
            status,
            payload.to_string(),
            error,
            now_ms() as i64,
        ],
    )?;
    Ok(())
}

/// Unsent pushes for one device whose backoff window has elapsed.
pub fn pending_pushes(conn: &Connection, device_id: &str, limit: usize) -> Vec<PushQueueEntry> {
    let Ok(mut stmt) = conn.prepare(
        "SELECT * FROM digital_task_push_queue
         WHERE device_id = ?1 AND sent_at_ms = 0 AND next_attempt_at_ms <= ?2
         ORDER BY created_at_ms ASC LIMIT ?3",
    ) else {
        return vec![];
    };
    stmt.query_map(
        rusqlite::params![device_id, now_ms() as i64, limit.clamp(1, 200) as i64],
        row_to_push,
    )
    .map(|rows| rows.filter_map(|r| r.ok()).collect())
    .unwrap_or_default()
}

pub fn mark_push_sent(conn: &Connection, id: i64) {
    let _ = conn.execute(
        "UPDATE digital_task_push_queue SET sent_at_ms = ?2 WHERE id = ?1",
        rusqlite::params![id, now_ms() as i64],
    );
}

pub fn mark_push_retry(conn: &Connection, id: i64, error: &str, retry_delay_ms: u64) {
    let _ = conn.execute(
        "UPDATE digital_task_push_queue
         SET attempts = attempts + 1, last_error = ?2, next_attempt_at_ms = ?3
         WHERE id = ?1",
        rusqlite::params![id, error, (now_ms() + retry_delay_ms) as i64],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn new_task(task_id: &str, device_id: &str) -> NewTask {
        NewTask {
            task_id: task_id.into(),
            session_id: "s1".into(),
            device_id: device_id.into(),
            goal: "book a checkup".into(),
            steps: vec![],
            timeout_seconds: 120,
            notify: true,
            speak: true,
        }
    }

    #[test]
    fn task_lifecycle_transitions_guarded() {
        let store = Store::new_in_memory().unwrap();
        let conn = store.conn();
        let task = create_task(&conn, &new_task("t1", "dev-1")).unwrap();
        assert_eq!(task.status, "pending");
        assert!(task.deadline_ms >= task.created_at_ms + 120_000);

        let expected: HashSet<&str> = ["pending"].into();
        assert!(update_task_if_status(&conn, "t1", &expected, "running", None, ""));
        // Terminal statuses are sinks.
        let running: HashSet<&str> = ["running"].into();
        assert!(update_task_if_status(&conn, "t1", &running, "success", None, ""));
        assert!(!update_task_if_status(&conn, "t1", &running, "failed", None, "nope"));
        let task = get_task(&conn, "t1").unwrap();
        assert_eq!(task.status, "success");
        assert!(task.is_final());
    }

    #[test]
    fn steps_are_append_only() {
        let store = Store::new_in_memory().unwrap();
        let conn = store.conn();
        create_task(&conn, &new_task("t1", "dev-1")).unwrap();
        append_step(&conn, "t1", "accepted", "ok", "task accepted");
        append_step(&conn, "t1", "running", "ok", "task running");
        let task = get_task(&conn, "t1").unwrap();
        assert_eq!(task.steps.len(), 2);
        assert_eq!(task.steps[0]["stage"], "accepted");
    }

    #[test]
    fn active_task_lookup_and_stats() {
        let store = Store::new_in_memory().unwrap();
        let conn = store.conn();
        create_task(&conn, &new_task("t1", "dev-1")).unwrap();
        create_task(&conn, &new_task("t2", "dev-2")).unwrap();
        let expected: HashSet<&str> = ["pending"].into();
        update_task_if_status(&conn, "t2", &expected, "canceled", None, "manual");

        assert_eq!(active_task_for_device(&conn, "dev-1").unwrap().task_id, "t1");
        assert!(active_task_for_device(&conn, "dev-2").is_none());

        let stats = task_stats(&conn, None);
        assert_eq!(stats["total"], serde_json::json!(2));
        assert_eq!(stats["pending"], serde_json::json!(1));
        assert_eq!(stats["canceled"], serde_json::json!(1));
    }

    #[test]
    fn push_queue_dedupes_by_transition() {
        let store = Store::new_in_memory().unwrap();
        let conn = store.conn();
        let payload = serde_json::json!({"status": "running"});
        enqueue_push(&conn, "t1", "dev-1", "s1", "running", &payload, "offline").unwrap();
        enqueue_push(&conn, "t1", "dev-1", "s1", "running", &payload, "offline again").unwrap();
        let pending = pending_pushes(&conn, "dev-1", 10);
        assert_eq!(pending.len(), 1);

        mark_push_retry(&conn, pending[0].id, "still offline", 60_000);
        // Backoff window not elapsed: hidden from the flush path.
        assert!(pending_pushes(&conn, "dev-1", 10).is_empty());

        mark_push_sent(&conn, pending[0].id);
        assert!(pending_pushes(&conn, "dev-1", 10).is_empty());
    }
}
