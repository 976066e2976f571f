//! End-to-end API tests over the full bootstrap (memory storage, scripted
//! mock provider, real bus/runtime wiring).

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use sb_bus::{EventKind, Filter};
use sb_domain::config::{Config, StorageBackend};
use sb_gateway::{api, bootstrap};
use sb_gateway::state::AppState;
use sb_providers::{mock::Script, MockProvider};

fn test_state(provider: MockProvider) -> AppState {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    // Point at a var that is never set so tests run unauthenticated.
    config.server.api_token_env = "SB_TEST_NO_TOKEN".into();
    config.runtime.retry_base_delay_ms = 1;
    bootstrap::build_state(Arc::new(config), Arc::new(provider)).unwrap()
}

fn app(state: &AppState) -> axum::Router {
    api::router(state.clone()).with_state(state.clone())
}

async fn request(
    state: &AppState,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app(state)
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn health_is_public() {
    let state = test_state(MockProvider::always_text("x"));
    let (status, body) = request(&state, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn session_lifecycle() {
    let state = test_state(MockProvider::always_text("x"));

    let (status, created) = request(
        &state,
        "POST",
        "/sessions",
        Some(serde_json::json!({ "title": "demo" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap().to_owned();
    assert!(id.starts_with("ses_"));
    assert_eq!(created["title"], "demo");

    let (status, list) = request(&state, "GET", "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = request(&state, "DELETE", &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = request(&state, "GET", &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn prompt_is_accepted_and_turn_lands_in_session() {
    let state = test_state(MockProvider::always_text("4"));
    let (_, created) = request(&state, "POST", "/sessions", None).await;
    let id = created["id"].as_str().unwrap().to_owned();

    let (status, body) = request(
        &state,
        "POST",
        &format!("/sessions/{id}/prompt"),
        Some(serde_json::json!({ "content": "What is 2+2?" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");

    let sessions = state.sessions.clone();
    let sid = id.clone();
    wait_for(
        || {
            sessions
                .get_messages(&sid, None)
                .map(|m| m.len() == 2)
                .unwrap_or(false)
        },
        "assistant reply",
    )
    .await;

    let (_, messages) = request(&state, "GET", &format!("/sessions/{id}/messages"), None).await;
    let messages = messages.as_array().unwrap().clone();
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
}

#[tokio::test]
async fn prompt_validation_errors_are_synchronous() {
    let state = test_state(MockProvider::always_text("x"));

    let (status, _) = request(
        &state,
        "POST",
        "/sessions/ses_missing/prompt",
        Some(serde_json::json!({ "content": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, created) = request(&state, "POST", "/sessions", None).await;
    let id = created["id"].as_str().unwrap();
    let (status, _) = request(
        &state,
        "POST",
        &format!("/sessions/{id}/prompt"),
        Some(serde_json::json!({ "content": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn compaction_endpoint_creates_summary_child() {
    let state = test_state(MockProvider::always_text("summary of everything"));
    let (_, created) = request(&state, "POST", "/sessions", None).await;
    let id = created["id"].as_str().unwrap().to_owned();
    state.sessions.add_user_message(&id, "long history").unwrap();

    let (status, body) = request(
        &state,
        "POST",
        &format!("/sessions/{id}/compact"),
        Some(serde_json::json!({ "keep_messages": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let child_id = body["session_id"].as_str().unwrap().to_owned();

    let (_, messages) =
        request(&state, "GET", &format!("/sessions/{child_id}/messages"), None).await;
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "system");
}

#[tokio::test]
async fn unknown_task_is_404_and_list_starts_empty() {
    let state = test_state(MockProvider::always_text("x"));
    let (status, _) = request(&state, "GET", "/tasks/tsk_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = request(&state, "GET", "/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn background_task_completion_reenters_parent_session() {
    // Round 1: the model calls the `task` tool in background mode.
    // Every later round (parent follow-up, sub-agent, re-entry) is plain text.
    let scripts = vec![
        MockProvider::tool_call_script(
            "call_1",
            "task",
            serde_json::json!({
                "description": "background scan",
                "prompt": "scan everything",
                "background": true,
            }),
        ),
        MockProvider::text_script("task queued"),
        MockProvider::text_script("sub-agent result"),
        MockProvider::text_script("noted the completion"),
    ];
    let state = test_state(MockProvider::new(scripts));

    let (_, created) = request(&state, "POST", "/sessions", None).await;
    let parent = created["id"].as_str().unwrap().to_owned();

    let (_sub, mut rx) = state
        .bus
        .subscribe_channel(Filter::session(&parent), 1024);

    let (status, _) = request(
        &state,
        "POST",
        &format!("/sessions/{parent}/prompt"),
        Some(serde_json::json!({ "content": "run a background scan" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // The task tool result is immediate: status accepted plus IDs.
    let sessions = state.sessions.clone();
    let pid = parent.clone();
    wait_for(
        || {
            sessions
                .get_messages(&pid, None)
                .ok()
                .map(|messages| {
                    messages.iter().any(|m| {
                        m.parts.iter().any(|p| match &p.kind {
                            sb_sessions::PartKind::Tool {
                                output: Some(o), ..
                            } => o.contains("accepted") && o.contains("task_id"),
                            _ => false,
                        })
                    })
                })
                .unwrap_or(false)
        },
        "accepted tool result",
    )
    .await;

    // Re-entry: the processor injects the observed-event summary.
    let sessions = state.sessions.clone();
    let pid = parent.clone();
    wait_for(
        || {
            sessions
                .get_messages(&pid, None)
                .ok()
                .map(|messages| {
                    messages
                        .iter()
                        .any(|m| m.text().contains("Observed event: background_task.completed"))
                })
                .unwrap_or(false)
        },
        "event re-entry",
    )
    .await;

    // Event stream: the completion carries the parent as trigger, and a
    // fresh stream.start follows for the re-entry turn.
    let mut saw_completion = false;
    let mut stream_starts = 0;
    while let Ok(event) = rx.try_recv() {
        match event.kind() {
            EventKind::TaskCompleted => {
                saw_completion = true;
                assert_eq!(
                    event.metadata.trigger_session_id.as_deref(),
                    Some(parent.as_str())
                );
            }
            EventKind::StreamStart => stream_starts += 1,
            _ => {}
        }
    }
    assert!(saw_completion);
    assert!(stream_starts >= 2);

    // The task registry shows the completed task under the parent.
    let (_, body) = request(&state, "GET", &format!("/tasks?session={parent}"), None).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["tasks"][0]["status"], "completed");
}

#[tokio::test]
async fn stopping_a_prompt_turn_publishes_stream_error() {
    // A transient-failure script makes the turn retry (slowly enough to
    // observe), but cancellation must win.
    let scripts = (0..50)
        .map(|_| Script::Fail {
            message: "rate limited".into(),
            transient: true,
        })
        .collect::<Vec<_>>();
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.server.api_token_env = "SB_TEST_NO_TOKEN".into();
    config.runtime.retry_base_delay_ms = 50;
    config.runtime.retry_max_attempts = 50;
    let state = bootstrap::build_state(Arc::new(config), Arc::new(MockProvider::new(scripts)))
        .unwrap();

    let (_, created) = request(&state, "POST", "/sessions", None).await;
    let id = created["id"].as_str().unwrap().to_owned();

    let (_sub, mut rx) = state.bus.subscribe_channel(Filter::session(&id), 256);

    let (status, _) = request(
        &state,
        "POST",
        &format!("/sessions/{id}/prompt"),
        Some(serde_json::json!({ "content": "never finishes" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let (status, body) = request(&state, "POST", &format!("/sessions/{id}/stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], true);

    let mut saw_error = false;
    for _ in 0..100 {
        if let Ok(event) = rx.try_recv() {
            if event.kind() == EventKind::StreamError {
                saw_error = true;
                break;
            }
            continue;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_error);
}
