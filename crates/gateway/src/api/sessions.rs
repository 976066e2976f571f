//! Session management endpoints.
//!
//! Prompt submission returns `202 Accepted` immediately; the turn proceeds
//! in the background and streams through `GET /events?session=<id>`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use sb_domain::capability::{QueryContext, QueryInvoker};
use sb_runtime::{compact_session as run_compaction, CompactOptions};
use sb_sessions::CreateSession;

use super::{api_error, domain_error};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionBody>>,
) -> impl IntoResponse {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    match state.sessions.create(CreateSession {
        title: body.title,
        ..CreateSession::default()
    }) {
        Ok(info) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "id": info.id, "title": info.title })),
        )
            .into_response(),
        Err(e) => domain_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /sessions, GET /sessions/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    match state.sessions.list() {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => domain_error(e),
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.get(&id) {
        Ok(info) => Json(info).into_response(),
        Err(e) => domain_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /sessions/:id/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.get_messages(&id, None) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => domain_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:id/prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PromptBody {
    pub content: String,
    /// Client submitting the prompt; recorded for event re-entry routing.
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Accept a prompt and run the turn detached. Progress is observable on the
/// session's SSE stream; errors surface there as `stream.error`.
pub async fn submit_prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PromptBody>,
) -> impl IntoResponse {
    if body.content.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "prompt content is empty");
    }
    // Unknown session is a synchronous validation error.
    if let Err(e) = state.sessions.get(&id) {
        return domain_error(e);
    }

    let history = match state.sessions.to_history(&id) {
        Ok(history) => history,
        Err(e) => return domain_error(e),
    };

    let cancel = state.cancel_map.register(&id);
    if let Some(client_id) = &body.client_id {
        state.active_sessions.set_active(client_id, &id);
    }

    let executor = state.executor.clone();
    let cancel_map = state.cancel_map.clone();
    let session_id = id.clone();
    tokio::spawn(async move {
        let ctx = QueryContext {
            session_id: Some(session_id.clone()),
            client_id: body.client_id,
            cancel: Some(cancel),
        };
        // Failures have already been published as `stream.error`.
        if let Err(e) = executor.handle_query(&body.content, ctx, history).await {
            tracing::debug!(session_id = %session_id, error = %e, "prompt turn ended with error");
        }
        cancel_map.remove(&session_id);
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted", "session_id": id })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:id/stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let stopped = state.cancel_map.cancel(&id);
    Json(serde_json::json!({ "session_id": id, "stopped": stopped }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /sessions/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.delete(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => domain_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:id/compact
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct CompactBody {
    #[serde(default)]
    pub keep_messages: Option<usize>,
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Explicit compaction: summarise into a child session and report its ID.
/// The client is expected to move to the child; the parent is untouched.
pub async fn compact_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CompactBody>>,
) -> impl IntoResponse {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let options = CompactOptions {
        keep_messages: body
            .keep_messages
            .unwrap_or(state.config.sessions.compact_keep_messages),
        custom_prompt: body.prompt,
    };

    let invoker: &dyn QueryInvoker = state.executor.as_ref();
    let result = run_compaction(&state.sessions, invoker, &id, options).await;
    if result.success {
        Json(serde_json::json!({
            "success": true,
            "session_id": result.session.map(|s| s.id),
        }))
        .into_response()
    } else {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "success": false,
                "error": result.error,
            })),
        )
            .into_response()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions/:id/fork
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct ForkBody {
    /// First message to copy; all messages when omitted.
    #[serde(default)]
    pub from_message_id: Option<String>,
}

pub async fn fork_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ForkBody>>,
) -> impl IntoResponse {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    match state.sessions.fork(&id, body.from_message_id.as_deref()) {
        Ok(info) => (StatusCode::CREATED, Json(info)).into_response(),
        Err(e) => domain_error(e),
    }
}
