//! Digital task control endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::task::TaskRequest;
use crate::web::{api_error, ok, runtime_error, AppState};

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub goal: String,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub notify: Option<bool>,
    pub speak: Option<bool>,
    #[serde(default)]
    pub interrupt_previous: bool,
    pub task_id: Option<String>,
    #[serde(default)]
    pub steps: Vec<Value>,
}

pub async fn execute(State(state): State<AppState>, Json(body): Json<ExecuteBody>) -> Response {
    if body.goal.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "bad_request", "goal is required");
    }
    let request = TaskRequest {
        goal: body.goal,
        session_id: body.session_id,
        device_id: body.device_id,
        timeout_seconds: body.timeout_seconds,
        notify: body.notify,
        speak: body.speak,
        interrupt_previous: body.interrupt_previous,
        task_id: body.task_id,
        steps: body.steps,
    };
    match state.tasks.execute(request).await {
        Ok(task) => ok(json!({"accepted": true, "task": task})),
        Err(e) => runtime_error(e),
    }
}

pub async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.tasks.get(&task_id) {
        Some(task) => ok(json!({"task": task})),
        None => api_error(StatusCode::NOT_FOUND, "not_found", "task not found"),
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<Value>>,
) -> Response {
    let reason = body
        .as_ref()
        .and_then(|j| j.0.get("reason").and_then(Value::as_str))
        .unwrap_or("manual_cancel")
        .to_string();
    match state.tasks.cancel(&task_id, &reason).await {
        Ok(task) => ok(json!({"task": task})),
        Err(e) => runtime_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub session_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let items = state.tasks.list(
        query.session_id.as_deref(),
        query.status.as_deref(),
        query.limit.unwrap_or(20),
        query.offset.unwrap_or(0),
    );
    ok(json!({"count": items.len(), "items": items}))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub session_id: Option<String>,
}

pub async fn stats(State(state): State<AppState>, Query(query): Query<StatsQuery>) -> Response {
    ok(json!({"stats": state.tasks.stats(query.session_id.as_deref())}))
}
