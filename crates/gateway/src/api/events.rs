//! The SSE endpoint — `GET /events?session=<id>&client=<id>`.
//!
//! Each bus event becomes one `data: {type, properties, sessionId?,
//! messageId?}` frame. A `server.heartbeat` frame is emitted every
//! `heartbeat_secs` (default 30 s). The subscription uses a bounded queue:
//! a client that stops reading falls behind, its queue overflows, the bus
//! drops the subscription, and the stream ends — one slow client never
//! stalls the bus or other subscribers.

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use futures_util::stream::Stream;
use serde::Deserialize;

use sb_bus::{Event, EventKind, EventMetadata, EventPayload, Filter};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    /// Scope the stream to one session. Omitted = the full firehose.
    #[serde(default)]
    pub session: Option<String>,
    /// Caller-chosen client ID, recorded for event re-entry routing.
    #[serde(default)]
    pub client: Option<String>,
}

pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> impl IntoResponse {
    let client_id = query
        .client
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Remember which session this client watches (event re-entry fallback).
    if let Some(session) = &query.session {
        state.active_sessions.set_active(&client_id, session);
    }

    let filter = match &query.session {
        Some(session) => Filter::session(session),
        None => Filter::default(),
    };
    let (subscription, rx) = state
        .bus
        .subscribe_channel(filter, state.config.server.sse_queue_len);

    // Announce the connection on the bus (scoped, so session subscribers —
    // including this one — see it).
    state.bus.publish(
        EventPayload::ServerConnected {
            client_id: Some(client_id.clone()),
        },
        EventMetadata {
            session_id: query.session.clone(),
            client_id: Some(client_id.clone()),
            ..EventMetadata::default()
        },
    );

    tracing::debug!(client_id = %client_id, session = ?query.session, "SSE stream opened");

    let heartbeat = std::time::Duration::from_secs(state.config.server.heartbeat_secs.max(1));
    Sse::new(make_event_stream(subscription, rx, heartbeat, client_id))
}

fn frame(event: &Event) -> SseEvent {
    SseEvent::default().data(event.to_wire().to_string())
}

fn make_event_stream(
    subscription: sb_bus::Subscription,
    mut rx: tokio::sync::mpsc::Receiver<Event>,
    heartbeat: std::time::Duration,
    client_id: String,
) -> impl Stream<Item = Result<SseEvent, std::convert::Infallible>> {
    async_stream::stream! {
        // Owned by the generator so disconnect (drop) releases the bus
        // subscription in the connection's cleanup path.
        let _subscription = subscription;
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(event) => {
                            let is_exit = event.kind() == EventKind::ApplicationExit;
                            yield Ok(frame(&event));
                            if is_exit {
                                break;
                            }
                        }
                        // Queue overflowed (subscriber dropped by the bus)
                        // or the bus is gone: close the connection.
                        None => {
                            tracing::debug!(client_id = %client_id, "SSE stream closed (queue dropped)");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let beat = Event::new(
                        EventPayload::ServerHeartbeat {},
                        EventMetadata::default(),
                    );
                    yield Ok(frame(&beat));
                }
            }
        }
    }
}
