pub mod events;
pub mod sessions;
pub mod tasks;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;

use sb_domain::error::Error;

use crate::auth;
use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (no auth required) and **protected**
/// (gated behind the `SB_API_TOKEN` bearer-token middleware).
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        // Health probe (used by liveness checks)
        .route("/health", get(health));

    let protected = Router::new()
        // Sessions
        .route("/sessions", post(sessions::create_session))
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/:id", get(sessions::get_session))
        .route("/sessions/:id", delete(sessions::delete_session))
        .route("/sessions/:id/messages", get(sessions::get_messages))
        .route("/sessions/:id/prompt", post(sessions::submit_prompt))
        .route("/sessions/:id/stop", post(sessions::stop_session))
        .route("/sessions/:id/compact", post(sessions::compact_session))
        .route("/sessions/:id/fork", post(sessions::fork_session))
        // Background tasks
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/:id", get(tasks::get_task))
        .route("/tasks/:id", delete(tasks::stop_task))
        // Event stream
        .route("/events", get(events::event_stream))
        // Apply API auth middleware to all protected routes.
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Map a domain error onto an HTTP response. Validation failures come back
/// to the caller as 4xx; everything else is a 500.
pub(crate) fn domain_error(e: Error) -> Response {
    match e {
        Error::NotFound(msg) => api_error(StatusCode::NOT_FOUND, msg),
        Error::Invalid(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}
