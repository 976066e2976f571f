//! The streaming bridge — translates executor streaming callbacks into bus
//! publications scoped to one (session, message) pair, and mirrors them into
//! the session so the persisted history reflects what the client saw.
//!
//! A bridge covers exactly one stream: `open` publishes `stream.start` for a
//! fresh assistant message, and either `complete` or `fail` publishes the
//! single terminal event for that message.

use std::sync::Arc;

use sb_bus::{EventBus, EventMetadata, EventPayload};
use sb_domain::error::Result;
use sb_domain::stream::Usage;
use sb_sessions::SessionManager;

pub struct StreamBridge {
    sessions: Arc<SessionManager>,
    bus: Arc<EventBus>,
    session_id: String,
    message_id: String,
    /// Cumulative assistant text for this stream.
    content: String,
}

impl StreamBridge {
    /// Start a stream: create the assistant message and publish
    /// `stream.start`.
    pub fn open(
        sessions: Arc<SessionManager>,
        bus: Arc<EventBus>,
        session_id: &str,
        model: &str,
    ) -> Result<Self> {
        let message = sessions.new_assistant_message(session_id)?;
        bus.publish(
            EventPayload::StreamStart {
                session_id: session_id.to_owned(),
                message_id: message.id.clone(),
                model: model.to_owned(),
            },
            EventMetadata::default(),
        );
        Ok(Self {
            sessions,
            bus,
            session_id: session_id.to_owned(),
            message_id: message.id,
            content: String::new(),
        })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// A new text chunk: `stream.text` carries both the cumulative content
    /// and the delta.
    pub fn on_text_delta(&mut self, delta: &str) -> Result<()> {
        self.content.push_str(delta);
        self.sessions
            .update_message_text(&self.session_id, &self.message_id, &self.content)?;
        self.bus.publish(
            EventPayload::StreamText {
                session_id: self.session_id.clone(),
                message_id: self.message_id.clone(),
                content: self.content.clone(),
                delta: delta.to_owned(),
            },
            EventMetadata::default(),
        );
        Ok(())
    }

    /// Reasoning content (cumulative — providers re-send it in full).
    pub fn on_reasoning(&self, content: &str) -> Result<()> {
        self.sessions
            .update_reasoning(&self.session_id, &self.message_id, content)?;
        self.bus.publish(
            EventPayload::StreamReasoning {
                session_id: self.session_id.clone(),
                message_id: self.message_id.clone(),
                content: content.to_owned(),
            },
            EventMetadata::default(),
        );
        Ok(())
    }

    /// The model invoked a tool: record a pending tool part on the anchor
    /// message and announce the call.
    pub fn on_tool_call(
        &self,
        call_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<()> {
        self.sessions.add_tool_call_to_message(
            &self.session_id,
            &self.message_id,
            call_id,
            tool_name,
            arguments.clone(),
        )?;
        self.bus.publish(
            EventPayload::StreamToolCall {
                session_id: self.session_id.clone(),
                message_id: self.message_id.clone(),
                tool_call_id: call_id.to_owned(),
                tool_name: tool_name.to_owned(),
                tool_args: arguments.clone(),
            },
            EventMetadata::default(),
        );
        Ok(())
    }

    /// A tool finished: flip the pending part, append the tool-role message,
    /// and publish the result.
    pub fn on_tool_result(
        &self,
        call_id: &str,
        tool_name: &str,
        result: &str,
        success: bool,
    ) -> Result<()> {
        let error = (!success).then(|| result.to_owned());
        self.sessions
            .update_tool_result(&self.session_id, call_id, result, error)?;
        self.sessions.add_tool_message(
            &self.session_id,
            tool_name,
            call_id,
            result,
            serde_json::Value::Null,
        )?;
        self.bus.publish(
            EventPayload::StreamToolResult {
                session_id: self.session_id.clone(),
                message_id: self.message_id.clone(),
                tool_call_id: call_id.to_owned(),
                tool_name: tool_name.to_owned(),
                result: result.to_owned(),
                success,
            },
            EventMetadata::default(),
        );
        Ok(())
    }

    /// Terminal success: publish `stream.completed` exactly once.
    pub fn complete(self, usage: Option<Usage>) -> String {
        self.bus.publish(
            EventPayload::StreamCompleted {
                session_id: self.session_id.clone(),
                message_id: self.message_id.clone(),
                usage,
            },
            EventMetadata::default(),
        );
        self.content
    }

    /// Terminal failure: mark any still-pending tool parts as errored and
    /// publish `stream.error` exactly once.
    pub fn fail(self, error: &str) {
        if let Err(e) = self.sessions.fail_pending_tools(&self.session_id, error) {
            tracing::warn!(session_id = %self.session_id, error = %e, "failed to mark pending tools");
        }
        self.bus.publish(
            EventPayload::StreamError {
                session_id: self.session_id.clone(),
                message_id: Some(self.message_id.clone()),
                error: error.to_owned(),
            },
            EventMetadata::default(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_bus::{EventKind, Filter};
    use sb_domain::config::SessionsConfig;
    use sb_sessions::{CreateSession, MemoryStorage};

    fn setup() -> (Arc<SessionManager>, Arc<EventBus>, String) {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemoryStorage::new()),
            SessionsConfig::default(),
        ));
        let bus = Arc::new(EventBus::new());
        let id = sessions.create(CreateSession::default()).unwrap().id;
        (sessions, bus, id)
    }

    #[tokio::test]
    async fn stream_start_then_text_then_completed() {
        let (sessions, bus, sid) = setup();
        let (_sub, mut rx) = bus.subscribe_channel(Filter::session(&sid), 64);

        let mut bridge = StreamBridge::open(sessions.clone(), bus.clone(), &sid, "mock").unwrap();
        bridge.on_text_delta("4").unwrap();
        bridge.on_text_delta("2").unwrap();
        let text = bridge.complete(None);
        assert_eq!(text, "42");

        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::StreamStart,
                EventKind::StreamText,
                EventKind::StreamText,
                EventKind::StreamCompleted,
            ]
        );

        // The session mirrors what the client saw.
        let last = sessions.get_last_message(&sid).unwrap().unwrap();
        assert_eq!(last.text(), "42");
    }

    #[tokio::test]
    async fn fail_marks_pending_tools_and_publishes_error() {
        let (sessions, bus, sid) = setup();
        let (_sub, mut rx) = bus.subscribe_channel(Filter::session(&sid), 64);

        let bridge = StreamBridge::open(sessions.clone(), bus.clone(), &sid, "mock").unwrap();
        bridge
            .on_tool_call("call_1", "slow_tool", &serde_json::json!({}))
            .unwrap();
        bridge.fail("query cancelled");

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if event.kind() == EventKind::StreamError {
                saw_error = true;
            }
        }
        assert!(saw_error);

        let messages = sessions.get_messages(&sid, None).unwrap();
        let part = messages
            .iter()
            .find_map(|m| m.tool_part("call_1"))
            .unwrap();
        match &part.kind {
            sb_sessions::PartKind::Tool { state, .. } => {
                assert_eq!(*state, sb_sessions::ToolState::Error);
            }
            _ => panic!("expected tool part"),
        }
    }

    #[tokio::test]
    async fn tool_roundtrip_writes_both_sides() {
        let (sessions, bus, sid) = setup();

        let bridge = StreamBridge::open(sessions.clone(), bus.clone(), &sid, "mock").unwrap();
        bridge
            .on_tool_call("call_1", "get_weather", &serde_json::json!({"city": "Beijing"}))
            .unwrap();
        bridge
            .on_tool_result("call_1", "get_weather", "sunny", true)
            .unwrap();
        bridge.complete(None);

        let messages = sessions.get_messages(&sid, None).unwrap();
        // Assistant anchor with the (now completed) tool part, plus the
        // tool-role result message.
        assert_eq!(messages.len(), 2);
        match &messages[0].tool_part("call_1").unwrap().kind {
            sb_sessions::PartKind::Tool { state, output, .. } => {
                assert_eq!(*state, sb_sessions::ToolState::Completed);
                assert_eq!(output.as_deref(), Some("sunny"));
            }
            _ => panic!("expected tool part"),
        }
        assert_eq!(messages[1].role, sb_sessions::MessageRole::Tool);
    }
}
