//! Typed event definitions — the closed set of everything the bus carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sb_domain::ident;
use sb_domain::stream::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tag of every event variant, used for subscription matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StreamStart,
    StreamText,
    StreamReasoning,
    StreamToolCall,
    StreamToolResult,
    StreamCompleted,
    StreamError,
    TaskCompleted,
    TaskFailed,
    TaskTimeout,
    TaskStopped,
    ServerConnected,
    ServerHeartbeat,
    ApplicationExit,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::StreamStart => "stream.start",
            EventKind::StreamText => "stream.text",
            EventKind::StreamReasoning => "stream.reasoning",
            EventKind::StreamToolCall => "stream.tool.call",
            EventKind::StreamToolResult => "stream.tool.result",
            EventKind::StreamCompleted => "stream.completed",
            EventKind::StreamError => "stream.error",
            EventKind::TaskCompleted => "background_task.completed",
            EventKind::TaskFailed => "background_task.failed",
            EventKind::TaskTimeout => "background_task.timeout",
            EventKind::TaskStopped => "background_task.stopped",
            EventKind::ServerConnected => "server.connected",
            EventKind::ServerHeartbeat => "server.heartbeat",
            EventKind::ApplicationExit => "application.exit",
        }
    }

    /// Every `background_task.*` kind.
    pub const TASK_KINDS: [EventKind; 4] = [
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
        EventKind::TaskTimeout,
        EventKind::TaskStopped,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every event payload the core publishes. The set is closed: adding a kind
/// means adding a variant here, and subscribers match on [`EventKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "stream.start")]
    StreamStart {
        session_id: String,
        message_id: String,
        model: String,
    },

    /// Incremental text: `content` is cumulative, `delta` the new chunk.
    #[serde(rename = "stream.text")]
    StreamText {
        session_id: String,
        message_id: String,
        content: String,
        delta: String,
    },

    /// Reasoning is cumulative only — providers re-send it in full.
    #[serde(rename = "stream.reasoning")]
    StreamReasoning {
        session_id: String,
        message_id: String,
        content: String,
    },

    #[serde(rename = "stream.tool.call")]
    StreamToolCall {
        session_id: String,
        message_id: String,
        tool_call_id: String,
        tool_name: String,
        tool_args: serde_json::Value,
    },

    #[serde(rename = "stream.tool.result")]
    StreamToolResult {
        session_id: String,
        message_id: String,
        tool_call_id: String,
        tool_name: String,
        result: String,
        success: bool,
    },

    #[serde(rename = "stream.completed")]
    StreamCompleted {
        session_id: String,
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    #[serde(rename = "stream.error")]
    StreamError {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        error: String,
    },

    #[serde(rename = "background_task.completed")]
    TaskCompleted {
        task_id: String,
        sub_session_id: String,
        description: String,
        result: String,
        execution_time_ms: u64,
        subagent_type: String,
    },

    #[serde(rename = "background_task.failed")]
    TaskFailed {
        task_id: String,
        sub_session_id: String,
        description: String,
        error: String,
        execution_time_ms: u64,
        subagent_type: String,
    },

    #[serde(rename = "background_task.timeout")]
    TaskTimeout {
        task_id: String,
        sub_session_id: String,
        description: String,
        message: String,
        execution_time_ms: u64,
    },

    #[serde(rename = "background_task.stopped")]
    TaskStopped {
        task_id: String,
        sub_session_id: String,
        message: String,
        execution_time_ms: u64,
    },

    #[serde(rename = "server.connected")]
    ServerConnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    #[serde(rename = "server.heartbeat")]
    ServerHeartbeat {},

    #[serde(rename = "application.exit")]
    ApplicationExit {},
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::StreamStart { .. } => EventKind::StreamStart,
            EventPayload::StreamText { .. } => EventKind::StreamText,
            EventPayload::StreamReasoning { .. } => EventKind::StreamReasoning,
            EventPayload::StreamToolCall { .. } => EventKind::StreamToolCall,
            EventPayload::StreamToolResult { .. } => EventKind::StreamToolResult,
            EventPayload::StreamCompleted { .. } => EventKind::StreamCompleted,
            EventPayload::StreamError { .. } => EventKind::StreamError,
            EventPayload::TaskCompleted { .. } => EventKind::TaskCompleted,
            EventPayload::TaskFailed { .. } => EventKind::TaskFailed,
            EventPayload::TaskTimeout { .. } => EventKind::TaskTimeout,
            EventPayload::TaskStopped { .. } => EventKind::TaskStopped,
            EventPayload::ServerConnected { .. } => EventKind::ServerConnected,
            EventPayload::ServerHeartbeat {} => EventKind::ServerHeartbeat,
            EventPayload::ApplicationExit {} => EventKind::ApplicationExit,
        }
    }

    /// Session the payload itself is scoped to, when it carries one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            EventPayload::StreamStart { session_id, .. }
            | EventPayload::StreamText { session_id, .. }
            | EventPayload::StreamReasoning { session_id, .. }
            | EventPayload::StreamToolCall { session_id, .. }
            | EventPayload::StreamToolResult { session_id, .. }
            | EventPayload::StreamCompleted { session_id, .. }
            | EventPayload::StreamError { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            EventPayload::StreamStart { message_id, .. }
            | EventPayload::StreamText { message_id, .. }
            | EventPayload::StreamReasoning { message_id, .. }
            | EventPayload::StreamToolCall { message_id, .. }
            | EventPayload::StreamToolResult { message_id, .. }
            | EventPayload::StreamCompleted { message_id, .. } => Some(message_id),
            EventPayload::StreamError { message_id, .. } => message_id.as_deref(),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routing metadata attached to a published event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Session an asynchronous event should re-enter (event processor).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Free-form guidance for the agent shown alongside the event summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_guide: Option<String>,
}

/// A published event. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: EventMetadata,
    pub payload: EventPayload,
}

impl Event {
    /// Build an event with a fresh ID and current timestamp. The session
    /// scope defaults to the payload's own session when the metadata does
    /// not name one.
    pub fn new(payload: EventPayload, mut metadata: EventMetadata) -> Self {
        if metadata.session_id.is_none() {
            metadata.session_id = payload.session_id().map(str::to_owned);
        }
        Self {
            id: ident::ascending(ident::EVENT),
            timestamp: Utc::now(),
            metadata,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.metadata.session_id.as_deref()
    }

    /// SSE wire projection: `{type, properties, sessionId?, messageId?}`.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut properties = match serde_json::to_value(&self.payload) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        properties.remove("type");

        let mut wire = serde_json::Map::new();
        wire.insert("type".into(), self.kind().as_str().into());
        wire.insert("properties".into(), serde_json::Value::Object(properties));
        if let Some(session_id) = self.session_id() {
            wire.insert("sessionId".into(), session_id.into());
        }
        if let Some(message_id) = self.payload.message_id() {
            wire.insert("messageId".into(), message_id.into());
        }
        serde_json::Value::Object(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_payload() -> EventPayload {
        EventPayload::StreamText {
            session_id: "ses_1".into(),
            message_id: "msg_1".into(),
            content: "hel".into(),
            delta: "l".into(),
        }
    }

    #[test]
    fn event_fills_session_scope_from_payload() {
        let event = Event::new(text_payload(), EventMetadata::default());
        assert_eq!(event.session_id(), Some("ses_1"));
        assert!(event.id.starts_with("evt_"));
    }

    #[test]
    fn explicit_metadata_scope_wins() {
        let event = Event::new(
            text_payload(),
            EventMetadata {
                session_id: Some("ses_other".into()),
                ..EventMetadata::default()
            },
        );
        assert_eq!(event.session_id(), Some("ses_other"));
    }

    #[test]
    fn serde_roundtrip_preserves_type_and_payload() {
        let event = Event::new(
            EventPayload::TaskCompleted {
                task_id: "tsk_1".into(),
                sub_session_id: "ses_sub".into(),
                description: "scan".into(),
                result: "done".into(),
                execution_time_ms: 42,
                subagent_type: "general".into(),
            },
            EventMetadata {
                trigger_session_id: Some("ses_parent".into()),
                ..EventMetadata::default()
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), EventKind::TaskCompleted);
        assert_eq!(
            serde_json::to_value(&back.payload).unwrap(),
            serde_json::to_value(&event.payload).unwrap()
        );
        assert_eq!(
            back.metadata.trigger_session_id.as_deref(),
            Some("ses_parent")
        );
    }

    #[test]
    fn wire_shape() {
        let event = Event::new(text_payload(), EventMetadata::default());
        let wire = event.to_wire();
        assert_eq!(wire["type"], "stream.text");
        assert_eq!(wire["sessionId"], "ses_1");
        assert_eq!(wire["messageId"], "msg_1");
        assert_eq!(wire["properties"]["delta"], "l");
        assert!(wire["properties"].get("type").is_none());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(EventKind::StreamToolCall.as_str(), "stream.tool.call");
        assert_eq!(EventKind::TaskTimeout.as_str(), "background_task.timeout");
        assert_eq!(EventKind::ApplicationExit.as_str(), "application.exit");
    }
}
