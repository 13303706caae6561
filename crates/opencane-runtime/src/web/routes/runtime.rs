//! Runtime status and observability read paths.

use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;

use opencane_protocol::envelope::now_ms;

use crate::observability::{bucket_history, observability_payload};
use crate::store::lifelog;
use crate::web::{ok, AppState};

pub async fn status(State(state): State<AppState>) -> Response {
    ok(json!({"status": state.runtime.runtime_status()}))
}

pub async fn observability(State(state): State<AppState>) -> Response {
    let status = state.runtime.runtime_status();
    ok(observability_payload(&status, &state.thresholds))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Window to look back, default 60 minutes.
    pub minutes: Option<u64>,
    /// Bucket width, default one minute.
    pub bucket_ms: Option<u64>,
}

pub async fn observability_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let minutes = query.minutes.unwrap_or(60).clamp(1, 24 * 60);
    let since = now_ms().saturating_sub(minutes * 60 * 1000);
    let samples = lifelog::observability_samples_since(&state.store.conn(), since, 5_000);
    let points = bucket_history(&samples, query.bucket_ms.unwrap_or(60_000));
    ok(json!({"minutes": minutes, "points": points}))
}
