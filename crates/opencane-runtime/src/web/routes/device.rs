//! Device identity lifecycle, operation dispatch, and event injection.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use opencane_protocol::Envelope;

use crate::store::{operations, sessions};
use crate::web::{api_error, ok, runtime_error, AppState};

fn require_device_id(body: &Value) -> Result<String, Response> {
    body.get("device_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "bad_request", "device_id is required"))
}

pub async fn register(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let device_id = match require_device_id(&body) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let token = body
        .get("device_token")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match sessions::register_device(&state.store.conn(), &device_id, token) {
        Ok(binding) => ok(json!({"binding": binding})),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", &e.to_string()),
    }
}

pub async fn bind(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let device_id = match require_device_id(&body) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let user_id = body.get("user_id").and_then(Value::as_str).unwrap_or_default();
    if user_id.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "bad_request", "user_id is required");
    }
    if !sessions::bind_device(&state.store.conn(), &device_id, user_id) {
        return api_error(StatusCode::NOT_FOUND, "not_found", "device not registered or revoked");
    }
    ok(json!({"binding": sessions::get_device_binding(&state.store.conn(), &device_id)}))
}

pub async fn activate(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let device_id = match require_device_id(&body) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if !sessions::activate_device(&state.store.conn(), &device_id) {
        return api_error(StatusCode::NOT_FOUND, "not_found", "device not registered or revoked");
    }
    ok(json!({"binding": sessions::get_device_binding(&state.store.conn(), &device_id)}))
}

pub async fn revoke(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let device_id = match require_device_id(&body) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let reason = body.get("reason").and_then(Value::as_str).unwrap_or("revoked");
    if !sessions::revoke_device(&state.store.conn(), &device_id, reason) {
        return api_error(StatusCode::NOT_FOUND, "not_found", "device not registered");
    }
    ok(json!({"binding": sessions::get_device_binding(&state.store.conn(), &device_id)}))
}

pub async fn dispatch_operation(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let device_id = match require_device_id(&body) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let op_type = body.get("op_type").and_then(Value::as_str).unwrap_or_default();
    let session_id = body.get("session_id").and_then(Value::as_str);
    let payload = body
        .get("payload")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    match state
        .runtime
        .dispatch_operation(&device_id, session_id, op_type, payload)
        .await
    {
        Ok((operation_id, seq)) => ok(json!({
            "operation_id": operation_id,
            "device_id": device_id,
            "op_type": op_type,
            "seq": seq,
        })),
        Err(e) => runtime_error(e),
    }
}

pub async fn ack_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let result = body.get("result");
    let error = body.get("error").and_then(Value::as_str).unwrap_or_default();
    let status = if error.is_empty() { "acked" } else { "failed" };
    if !operations::mark_operation(&state.store.conn(), &operation_id, status, result, error) {
        return api_error(StatusCode::NOT_FOUND, "not_found", "operation not found");
    }
    ok(json!({"operation": operations::get_operation(&state.store.conn(), &operation_id)}))
}

#[derive(Debug, Deserialize)]
pub struct OperationsQuery {
    pub device_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<OperationsQuery>,
) -> Response {
    let items = operations::list_operations(
        &state.store.conn(),
        query.device_id.as_deref(),
        query.status.as_deref(),
        query.limit.unwrap_or(100),
    );
    ok(json!({"count": items.len(), "items": items}))
}

/// Inject a canonical envelope into the runtime (testing/replay). Only
/// available when the runtime rides the mock adapter.
pub async fn inject_event(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let Some(mock) = &state.mock_adapter else {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "unsupported_adapter",
            "event injection requires the mock adapter",
        );
    };
    let envelope = match Envelope::from_json(body, None, None) {
        Ok(envelope) => envelope,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, "invalid_control_payload", &e.to_string()),
    };
    let summary = json!({
        "device_id": envelope.device_id,
        "session_id": envelope.session_id,
        "type": envelope.kind.as_str(),
        "seq": envelope.seq,
    });
    match mock.inject_event(envelope).await {
        Ok(()) => ok(json!({"injected": summary})),
        Err(e) => runtime_error(e),
    }
}
