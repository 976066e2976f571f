//! Background task endpoints — list, inspect, stop.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use super::{api_error, domain_error};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    /// Filter by parent session.
    #[serde(default)]
    pub session: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> impl IntoResponse {
    let tasks = state.tasks.list_tasks(query.session.as_deref());
    Json(serde_json::json!({
        "tasks": tasks,
        "count": tasks.len(),
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /tasks/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.get_task(&id) {
        Some(task) => Json(task).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("task {id} not found")),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /tasks/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Signal cancellation. The task transitions to `stopped` on its own
/// execution path and publishes `background_task.stopped`.
pub async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.stop_task(&id) {
        Ok(outcome) => {
            let status = if outcome.success {
                StatusCode::OK
            } else {
                // Already terminal.
                StatusCode::CONFLICT
            };
            (status, Json(outcome)).into_response()
        }
        Err(e) => domain_error(e),
    }
}
