pub mod device;
pub mod lifelog;
pub mod runtime;
pub mod task;

use axum::routing::{get, post};
use axum::Router;

use super::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/runtime/status", get(runtime::status))
        .route("/runtime/observability", get(runtime::observability))
        .route(
            "/runtime/observability/history",
            get(runtime::observability_history),
        )
        .route("/device/register", post(device::register))
        .route("/device/bind", post(device::bind))
        .route("/device/activate", post(device::activate))
        .route("/device/revoke", post(device::revoke))
        .route("/device/ops/dispatch", post(device::dispatch_operation))
        .route("/device/ops/{operation_id}/ack", post(device::ack_operation))
        .route("/device/ops", get(device::list_operations))
        .route("/device/event", post(device::inject_event))
        .route("/lifelog/enqueue_image", post(lifelog::enqueue_image))
        .route("/lifelog/query", post(lifelog::query))
        .route("/lifelog/timeline", get(lifelog::timeline))
        .route("/lifelog/safety", get(lifelog::safety))
        .route("/lifelog/safety/stats", get(lifelog::safety_stats))
        .route("/digital-task/execute", post(task::execute))
        .route("/digital-task/stats", get(task::stats))
        .route("/digital-task/{task_id}", get(task::get_task))
        .route("/digital-task/{task_id}/cancel", post(task::cancel))
        .route("/digital-task", get(task::list))
}
