//! Lifelog persistence: runtime events, image records, structured contexts,
//! thought traces, and observability samples.

use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{now_ms, safe_json_parse};

#[derive(Debug, Clone, Serialize)]
pub struct LifelogEvent {
    pub id: i64,
    pub session_id: String,
    pub event_type: String,
    pub payload: Option<Value>,
    pub risk_level: String,
    pub confidence: f64,
    pub ts: u64,
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<LifelogEvent> {
    Ok(LifelogEvent {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        event_type: row.get("event_type")?,
        payload: safe_json_parse(row.get("payload")?),
        risk_level: row.get("risk_level")?,
        confidence: row.get("confidence")?,
        ts: row.get::<_, i64>("ts")? as u64,
    })
}

pub fn add_event(
    conn: &Connection,
    session_id: &str,
    event_type: &str,
    payload: &Map<String, Value>,
    risk_level: &str,
    confidence: f64,
    ts: Option<u64>,
) -> anyhow::Result<i64> {
    let payload_json = serde_json::to_string(payload)?;
    conn.execute(
        "INSERT INTO lifelog_events (session_id, event_type, payload, risk_level, confidence, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            session_id,
            event_type,
            payload_json,
            risk_level,
            confidence,
            ts.unwrap_or_else(now_ms) as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug, Clone, Default)]
pub struct TimelineFilter<'a> {
    pub session_id: Option<&'a str>,
    pub event_type: Option<&'a str>,
    pub risk_level: Option<&'a str>,
    pub start_ts: Option<u64>,
    pub end_ts: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

pub fn timeline(conn: &Connection, filter: &TimelineFilter) -> Vec<LifelogEvent> {
    let mut sql = String::from("SELECT * FROM lifelog_events WHERE 1=1");
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    if let Some(session_id) = filter.session_id {
        sql.push_str(" AND session_id = ?");
        params.push(Box::new(session_id.to_string()));
    }
    if let Some(event_type) = filter.event_type {
        sql.push_str(" AND event_type = ?");
        params.push(Box::new(event_type.to_string()));
    }
    if let Some(risk) = filter.risk_level {
        sql.push_str(" AND risk_level = ?");
        params.push(Box::new(risk.to_string()));
    }
    if let Some(start) = filter.start_ts {
        sql.push_str(" AND ts >= ?");
        params.push(Box::new(start as i64));
    }
    if let Some(end) = filter.end_ts {
        sql.push_str(" AND ts <= ?");
        params.push(Box::new(end as i64));
    }
    sql.push_str(" ORDER BY ts DESC, id DESC LIMIT ? OFFSET ?");
    params.push(Box::new(filter.limit.clamp(1, 1000) as i64));
    params.push(Box::new(filter.offset as i64));

    let Ok(mut stmt) = conn.prepare(&sql) else {
        return vec![];
    };
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    stmt.query_map(param_refs.as_slice(), row_to_event)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

/// Safety audit read path: `safety_policy` events, newest first.
pub fn safety_events(conn: &Connection, session_id: Option<&str>, limit: usize) -> Vec<LifelogEvent> {
    timeline(
        conn,
        &TimelineFilter {
            session_id,
            event_type: Some("safety_policy"),
            limit,
            ..Default::default()
        },
    )
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SafetyStats {
    pub total: u64,
    pub downgraded: u64,
    pub by_risk_level: Map<String, Value>,
}

pub fn safety_stats(conn: &Connection) -> SafetyStats {
    let mut stats = SafetyStats::default();
    let Ok(mut stmt) = conn.prepare(
        "SELECT risk_level, COUNT(*) AS total,
                SUM(CASE WHEN json_extract(payload, '$.downgraded') THEN 1 ELSE 0 END) AS downgraded
         FROM lifelog_events WHERE event_type = 'safety_policy' GROUP BY risk_level",
    ) else {
        return stats;
    };
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, Option<i64>>(2)?.unwrap_or(0),
        ))
    });
    if let Ok(rows) = rows {
        for (risk, total, downgraded) in rows.flatten() {
            stats.total += total as u64;
            stats.downgraded += downgraded as u64;
            stats
                .by_risk_level
                .insert(risk, serde_json::json!({"total": total, "downgraded": downgraded}));
        }
    }
    stats
}

// --- Images & contexts ---

#[derive(Debug, Clone, Serialize)]
pub struct ImageRecord {
    pub id: i64,
    pub session_id: String,
    pub image_uri: String,
    pub dhash: String,
    pub content_hash: String,
    pub is_dedup: bool,
    pub ts: u64,
}

fn row_to_image(row: &rusqlite::Row) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        image_uri: row.get("image_uri")?,
        dhash: row.get("dhash")?,
        content_hash: row.get("content_hash")?,
        is_dedup: row.get::<_, i64>("is_dedup")? == 1,
        ts: row.get::<_, i64>("ts")? as u64,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn add_image(
    conn: &Connection,
    session_id: &str,
    image_uri: &str,
    dhash: &str,
    content_hash: &str,
    is_dedup: bool,
    ts: u64,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO lifelog_images (session_id, image_uri, dhash, content_hash, is_dedup, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            session_id,
            image_uri,
            dhash,
            content_hash,
            is_dedup as i64,
            ts as i64
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Non-dedup image records for one session inside the dedup window, newest
/// first. These are the candidates for near-duplicate matching.
pub fn recent_images(
    conn: &Connection,
    session_id: &str,
    since_ts: u64,
    limit: usize,
) -> Vec<ImageRecord> {
    let Ok(mut stmt) = conn.prepare(
        "SELECT * FROM lifelog_images
         WHERE session_id = ?1 AND ts >= ?2 AND is_dedup = 0
         ORDER BY ts DESC LIMIT ?3",
    ) else {
        return vec![];
    };
    stmt.query_map(
        rusqlite::params![session_id, since_ts as i64, limit.clamp(1, 500) as i64],
        row_to_image,
    )
    .map(|rows| rows.filter_map(|r| r.ok()).collect())
    .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextRecord {
    pub id: i64,
    pub image_id: i64,
    pub semantic_summary: String,
    pub objects: Option<Value>,
    pub ocr: Option<Value>,
    pub risk_hints: Option<Value>,
    pub actionable_summary: String,
    pub risk_level: String,
    pub risk_score: f64,
    pub confidence: f64,
    pub ts: u64,
}

fn row_to_context(row: &rusqlite::Row) -> rusqlite::Result<ContextRecord> {
    Ok(ContextRecord {
        id: row.get("id")?,
        image_id: row.get("image_id")?,
        semantic_summary: row.get("semantic_summary")?,
        objects: safe_json_parse(row.get("objects")?),
        ocr: safe_json_parse(row.get("ocr")?),
        risk_hints: safe_json_parse(row.get("risk_hints")?),
        actionable_summary: row.get("actionable_summary")?,
        risk_level: row.get("risk_level")?,
        risk_score: row.get("risk_score")?,
        confidence: row.get("confidence")?,
        ts: row.get::<_, i64>("ts")? as u64,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn add_context(
    conn: &Connection,
    image_id: i64,
    semantic_summary: &str,
    objects: &[Value],
    ocr: &[Value],
    risk_hints: &[String],
    actionable_summary: &str,
    risk_level: &str,
    risk_score: f64,
    confidence: f64,
    ts: u64,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO lifelog_contexts (
            image_id, semantic_summary, objects, ocr, risk_hints,
            actionable_summary, risk_level, risk_score, confidence, ts
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            image_id,
            semantic_summary,
            serde_json::to_string(objects)?,
            serde_json::to_string(ocr)?,
            serde_json::to_string(risk_hints)?,
            actionable_summary,
            risk_level,
            risk_score,
            confidence,
            ts as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn context_by_image(conn: &Connection, image_id: i64) -> Option<ContextRecord> {
    conn.prepare("SELECT * FROM lifelog_contexts WHERE image_id = ?1 ORDER BY id DESC LIMIT 1")
        .ok()?
        .query_row(rusqlite::params![image_id], row_to_context)
        .ok()
}

pub fn context_count(conn: &Connection) -> u64 {
    conn.query_row("SELECT COUNT(*) FROM lifelog_contexts", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|n| n as u64)
    .unwrap_or(0)
}

// --- Thought traces ---

pub fn add_thought_trace(
    conn: &Connection,
    trace_id: &str,
    session_id: &str,
    source: &str,
    stage: &str,
    payload: &Value,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO thought_traces (trace_id, session_id, source, stage, payload, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            trace_id,
            session_id,
            source,
            stage,
            serde_json::to_string(payload)?,
            now_ms() as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// --- Observability samples ---

pub fn add_observability_sample(conn: &Connection, ts: u64, payload: &Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO runtime_observability_samples (ts, payload) VALUES (?1, ?2)",
        rusqlite::params![ts as i64, serde_json::to_string(payload)?],
    )?;
    Ok(())
}

pub fn observability_samples_since(conn: &Connection, since_ts: u64, limit: usize) -> Vec<(u64, Value)> {
    let Ok(mut stmt) = conn.prepare(
        "SELECT ts, payload FROM runtime_observability_samples
         WHERE ts >= ?1 ORDER BY ts ASC LIMIT ?2",
    ) else {
        return vec![];
    };
    stmt.query_map(
        rusqlite::params![since_ts as i64, limit.clamp(1, 5000) as i64],
        |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                safe_json_parse(row.get(1)?).unwrap_or(Value::Null),
            ))
        },
    )
    .map(|rows| rows.filter_map(|r| r.ok()).collect())
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    #[test]
    fn event_timeline_filters() {
        let store = Store::new_in_memory().unwrap();
        let conn = store.conn();
        let mut payload = Map::new();
        payload.insert("trace_id".into(), json!("t-1"));
        add_event(&conn, "s1", "voice_turn", &payload, "P3", 0.7, Some(100)).unwrap();
        add_event(&conn, "s1", "safety_policy", &payload, "P1", 0.9, Some(200)).unwrap();
        add_event(&conn, "s2", "voice_turn", &payload, "P3", 0.7, Some(300)).unwrap();

        let all_s1 = timeline(
            &conn,
            &TimelineFilter {
                session_id: Some("s1"),
                limit: 10,
                ..Default::default()
            },
        );
        assert_eq!(all_s1.len(), 2);
        // Newest first.
        assert_eq!(all_s1[0].event_type, "safety_policy");

        let risky = timeline(
            &conn,
            &TimelineFilter {
                risk_level: Some("P1"),
                limit: 10,
                ..Default::default()
            },
        );
        assert_eq!(risky.len(), 1);

        let windowed = timeline(
            &conn,
            &TimelineFilter {
                start_ts: Some(150),
                end_ts: Some(250),
                limit: 10,
                ..Default::default()
            },
        );
        assert_eq!(windowed.len(), 1);
    }

    #[test]
    fn safety_stats_counts_downgrades() {
        let store = Store::new_in_memory().unwrap();
        let conn = store.conn();
        let mut downgraded = Map::new();
        downgraded.insert("downgraded".into(), json!(true));
        let mut clean = Map::new();
        clean.insert("downgraded".into(), json!(false));
        add_event(&conn, "s1", "safety_policy", &downgraded, "P1", 0.9, None).unwrap();
        add_event(&conn, "s1", "safety_policy", &clean, "P3", 0.9, None).unwrap();

        let stats = safety_stats(&conn);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.downgraded, 1);
    }

    #[test]
    fn image_and_context_roundtrip() {
        let store = Store::new_in_memory().unwrap();
        let conn = store.conn();
        let image_id = add_image(&conn, "s1", "asset://a.jpg", "aa00", "cafe", false, 500).unwrap();
        let context_id = add_context(
            &conn,
            image_id,
            "a crosswalk with a green light",
            &[json!({"label": "crosswalk"})],
            &[],
            &["crosswalk".to_string()],
            "wait for the signal",
            "P1",
            0.6,
            0.8,
            500,
        )
        .unwrap();
        assert!(context_id > 0);
        let context = context_by_image(&conn, image_id).unwrap();
        assert_eq!(context.semantic_summary, "a crosswalk with a green light");
        assert_eq!(context.risk_level, "P1");
        assert_eq!(context_count(&conn), 1);

        let recent = recent_images(&conn, "s1", 0, 10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].dhash, "aa00");
        // Dedup rows are excluded from candidates.
        add_image(&conn, "s1", "asset://b.jpg", "aa00", "cafe", true, 600).unwrap();
        assert_eq!(recent_images(&conn, "s1", 0, 10).len(), 1);
    }
}
