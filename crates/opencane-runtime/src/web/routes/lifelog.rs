//! Lifelog write and read paths.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::ingest::ImageJob;
use crate::store::lifelog::{self, TimelineFilter};
use crate::web::{api_error, ok, runtime_error, AppState};

/// Same semantics as an `image_ready` event arriving over the wire.
pub async fn enqueue_image(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let session_id = body
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let Some(session_id) = session_id else {
        return api_error(StatusCode::BAD_REQUEST, "bad_request", "session_id is required");
    };
    let Some(image_b64) = body
        .get("image_base64")
        .or_else(|| body.get("image"))
        .and_then(Value::as_str)
    else {
        return api_error(StatusCode::BAD_REQUEST, "bad_request", "image_base64 is required");
    };
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(image_b64) else {
        return api_error(StatusCode::BAD_REQUEST, "bad_request", "image_base64 is not valid base64");
    };

    let job = ImageJob::new(
        session_id,
        body.get("device_id").and_then(Value::as_str).unwrap_or_default(),
        bytes,
        body.get("mime").and_then(Value::as_str).unwrap_or("image/jpeg"),
        body.get("question")
            .and_then(Value::as_str)
            .map(str::to_string),
        body.get("trace_id")
            .and_then(Value::as_str)
            .unwrap_or("control-api")
            .to_string(),
    );
    let job_id = job.job_id.clone();
    match state.runtime.ingest.enqueue(job).await {
        Ok(()) => ok(json!({"job_id": job_id, "queue": state.runtime.ingest.stats()})),
        Err(e) => runtime_error(e),
    }
}

/// Vector/structured search over indexed lifelog text.
pub async fn query(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let Some(text) = body.get("text").and_then(Value::as_str).filter(|t| !t.trim().is_empty())
    else {
        return api_error(StatusCode::BAD_REQUEST, "bad_request", "text is required");
    };
    let session_id = body.get("session_id").and_then(Value::as_str);
    let top_k = body.get("top_k").and_then(Value::as_u64).unwrap_or(5) as usize;
    let hits = state.vector.query(text, session_id, top_k.clamp(1, 50)).await;
    let items: Vec<Value> = hits
        .into_iter()
        .map(|(id, score, metadata)| json!({"id": id, "score": score, "metadata": metadata}))
        .collect();
    ok(json!({"count": items.len(), "items": items}))
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    pub risk_level: Option<String>,
    pub start_ts: Option<u64>,
    pub end_ts: Option<u64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn timeline(
    State(state): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> Response {
    let items = lifelog::timeline(
        &state.store.conn(),
        &TimelineFilter {
            session_id: query.session_id.as_deref(),
            event_type: query.event_type.as_deref(),
            risk_level: query.risk_level.as_deref(),
            start_ts: query.start_ts,
            end_ts: query.end_ts,
            limit: query.limit.unwrap_or(100),
            offset: query.offset.unwrap_or(0),
        },
    );
    ok(json!({"count": items.len(), "items": items}))
}

#[derive(Debug, Deserialize)]
pub struct SafetyQuery {
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

pub async fn safety(State(state): State<AppState>, Query(query): Query<SafetyQuery>) -> Response {
    let items = lifelog::safety_events(
        &state.store.conn(),
        query.session_id.as_deref(),
        query.limit.unwrap_or(100),
    );
    ok(json!({"count": items.len(), "items": items}))
}

pub async fn safety_stats(State(state): State<AppState>) -> Response {
    ok(json!({"stats": lifelog::safety_stats(&state.store.conn())}))
}
