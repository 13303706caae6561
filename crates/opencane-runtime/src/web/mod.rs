//! Control HTTP surface.
//!
//! JSON in, JSON out; every handler returns `{"success": true, ...}` or
//! `{"success": false, "error_code": ..., "message": ...}`. Auth is optional
//! bearer-token, with optional nonce+timestamp replay protection on writes.

pub mod routes;
pub mod security;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Router;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::adapter::mock::MockAdapter;
use crate::connection::ConnectionRuntime;
use crate::error::RuntimeError;
use crate::observability::ObservabilityThresholds;
use crate::providers::VectorIndex;
use crate::store::Store;
use crate::task::DigitalTaskService;

use security::{parse_timestamp_ms, RequestRateLimiter, RequestReplayProtector};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<ConnectionRuntime>,
    pub tasks: Arc<DigitalTaskService>,
    pub store: Arc<Store>,
    pub vector: Arc<dyn VectorIndex>,
    /// Present only when the runtime rides the mock adapter; enables
    /// `/v1/device/event` injection.
    pub mock_adapter: Option<Arc<MockAdapter>>,
    pub auth_token: Option<String>,
    pub security: Arc<SecurityState>,
    pub thresholds: ObservabilityThresholds,
}

pub struct SecurityState {
    pub rate_limiter: RequestRateLimiter,
    pub replay_protector: Option<RequestReplayProtector>,
}

pub fn ok(body: Value) -> Response {
    let mut out = json!({"success": true});
    if let (Some(base), Some(extra)) = (out.as_object_mut(), body.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    Json(out).into_response()
}

pub fn api_error(status: StatusCode, error_code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error_code": error_code,
            "message": message,
        })),
    )
        .into_response()
}

pub fn runtime_error(err: RuntimeError) -> Response {
    let status = match &err {
        RuntimeError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        RuntimeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        RuntimeError::InvalidControlPayload(msg) if msg.contains("not found") => {
            StatusCode::NOT_FOUND
        }
        RuntimeError::InvalidControlPayload(_) | RuntimeError::InvalidAudioFrame(_) => {
            StatusCode::BAD_REQUEST
        }
        RuntimeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.error_code(), &err.to_string())
}

fn header<'a>(request: &'a Request<Body>, name: &str) -> Option<&'a str> {
    request.headers().get(name)?.to_str().ok()
}

/// Auth + rate-limit + replay-protection middleware.
pub async fn control_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client_key = header(&request, "x-forwarded-for")
        .unwrap_or("local")
        .to_string();
    if !state.security.rate_limiter.allow(&client_key) {
        return api_error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "too many requests",
        );
    }

    if let Some(expected) = &state.auth_token {
        let bearer = header(&request, "authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        let alt = header(&request, "x-auth-token").map(str::trim);
        if bearer != Some(expected.as_str()) && alt != Some(expected.as_str()) {
            return api_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token");
        }
    }

    if let Some(protector) = &state.security.replay_protector {
        if request.method() != axum::http::Method::GET {
            let nonce = header(&request, "x-request-nonce").unwrap_or("").to_string();
            let timestamp = header(&request, "x-request-timestamp")
                .and_then(parse_timestamp_ms)
                .unwrap_or(0);
            if let Err(reason) = protector.validate(&client_key, &nonce, timestamp) {
                return api_error(StatusCode::UNAUTHORIZED, reason, "replay protection failed");
            }
        }
    }

    next.run(request).await
}

/// Build the control router with auth middleware applied to every `/v1` path.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    let api = routes::api_router()
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            control_auth,
        ))
        .layer(cors);

    Router::new()
        .route(
            "/health",
            axum::routing::get(|| async {
                Json(json!({"status": "ok", "service": "opencane-runtime"}))
            }),
        )
        .nest("/v1", api)
        .with_state(state)
}
