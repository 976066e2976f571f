//! Event-driven re-entry — replays an asynchronous event into a session as
//! a synthetic tool round-trip and re-invokes the query loop.
//!
//! The agent sees the event as if it had called an introspection tool: a
//! user message summarising the event, an assistant message with one pending
//! `get_event_info` call, and the tool result carrying the full event JSON.
//! `handle_query` then continues on top of that round-trip, producing a
//! fresh `stream.start`.
//!
//! When a background task completes after its parent was compacted, the
//! `trigger_session_id` still names the pre-compaction parent — compaction
//! forks a child rather than replacing the parent, so clients that moved to
//! the child only see the re-entry if they also subscribe to the parent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use sb_bus::Event;
use sb_domain::capability::{QueryContext, QueryInvoker};
use sb_domain::error::Result;
use sb_sessions::SessionManager;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Active-session registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maps client IDs to the session they are currently attached to. The SSE
/// adapter records a client's most recent session subscription here so
/// events carrying only a `client_id` can still find their session.
#[derive(Default)]
pub struct ActiveSessionRegistry {
    active: RwLock<HashMap<String, String>>,
}

impl ActiveSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, client_id: &str, session_id: &str) {
        self.active
            .write()
            .insert(client_id.to_owned(), session_id.to_owned());
    }

    pub fn get_active(&self, client_id: &str) -> Option<String> {
        self.active.read().get(client_id).cloned()
    }

    pub fn clear(&self, client_id: &str) {
        self.active.write().remove(client_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event processor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ProcessEventOptions {
    /// Prompt for the re-entry query; defaults to `Process event: <type>`.
    pub prompt: Option<String>,
    /// When false, only the user summary message is injected.
    pub include_tool_call: bool,
    /// Tool name the synthetic round-trip is attributed to.
    pub tool_name: String,
}

impl Default for ProcessEventOptions {
    fn default() -> Self {
        Self {
            prompt: None,
            include_tool_call: true,
            tool_name: "get_event_info".into(),
        }
    }
}

pub struct EventProcessor {
    sessions: Arc<SessionManager>,
    invoker: Arc<dyn QueryInvoker>,
    registry: Arc<ActiveSessionRegistry>,
}

impl EventProcessor {
    pub fn new(
        sessions: Arc<SessionManager>,
        invoker: Arc<dyn QueryInvoker>,
        registry: Arc<ActiveSessionRegistry>,
    ) -> Self {
        Self {
            sessions,
            invoker,
            registry,
        }
    }

    /// Inject `event` into its trigger session as a synthetic tool
    /// round-trip and re-invoke the query loop. Events that resolve to no
    /// known session are logged and dropped.
    pub async fn process_event(&self, event: &Event, options: ProcessEventOptions) -> Result<()> {
        let Some(session_id) = self.resolve_session(event) else {
            tracing::info!(event_id = %event.id, kind = %event.kind(), "event has no resolvable session, dropped");
            return Ok(());
        };
        if self.sessions.get(&session_id).is_err() {
            tracing::info!(event_id = %event.id, session_id = %session_id, "event session no longer exists, dropped");
            return Ok(());
        }

        // ── Synthetic round-trip ────────────────────────────────────
        let mut summary = format!(
            "Observed event: {}\nEvent ID: {}\nTime: {}",
            event.kind(),
            event.id,
            event.timestamp.to_rfc3339(),
        );
        if let Some(guide) = &event.metadata.agent_guide {
            summary.push_str("\n\n");
            summary.push_str(guide);
        }
        self.sessions.add_user_message(&session_id, &summary)?;

        if options.include_tool_call {
            let call_id = format!("call_{}", event.id);
            let args = serde_json::json!({ "event_ids": [event.id] });
            self.sessions.add_assistant_message_with_tool(
                &session_id,
                &call_id,
                &options.tool_name,
                args.clone(),
            )?;
            let event_json = serde_json::to_string(event)?;
            self.sessions.update_tool_result(&session_id, &call_id, &event_json, None)?;
            self.sessions.add_tool_message(
                &session_id,
                &options.tool_name,
                &call_id,
                &event_json,
                args,
            )?;
        }

        // ── Re-enter the query loop ─────────────────────────────────
        let prompt = options
            .prompt
            .clone()
            .unwrap_or_else(|| format!("Process event: {}", event.kind()));
        let history = self.sessions.to_history(&session_id)?;
        let ctx = QueryContext::for_session(&session_id);

        if let Err(e) = self.invoker.handle_query(&prompt, ctx, history).await {
            tracing::warn!(event_id = %event.id, session_id = %session_id, error = %e, "event re-entry query failed");
        }
        Ok(())
    }

    /// `trigger_session_id` wins; otherwise fall back to the client's
    /// active session.
    fn resolve_session(&self, event: &Event) -> Option<String> {
        if let Some(sid) = &event.metadata.trigger_session_id {
            return Some(sid.clone());
        }
        event
            .metadata
            .client_id
            .as_deref()
            .and_then(|cid| self.registry.get_active(cid))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sb_bus::{EventMetadata, EventPayload};
    use sb_domain::config::SessionsConfig;
    use sb_domain::tool::Message as HistoryMessage;
    use sb_sessions::{MemoryStorage, MessageRole, PartKind, ToolState};

    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<(String, Option<String>, usize)>>,
    }

    #[async_trait::async_trait]
    impl QueryInvoker for RecordingInvoker {
        async fn handle_query(
            &self,
            prompt: &str,
            ctx: QueryContext,
            history: Vec<HistoryMessage>,
        ) -> Result<String> {
            self.calls
                .lock()
                .push((prompt.to_owned(), ctx.session_id.clone(), history.len()));
            Ok("acknowledged".into())
        }
    }

    fn fixture() -> (Arc<SessionManager>, Arc<RecordingInvoker>, EventProcessor) {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemoryStorage::new()),
            SessionsConfig::default(),
        ));
        let invoker = Arc::new(RecordingInvoker::default());
        let processor = EventProcessor::new(
            sessions.clone(),
            invoker.clone(),
            Arc::new(ActiveSessionRegistry::new()),
        );
        (sessions, invoker, processor)
    }

    fn task_event(trigger: Option<&str>) -> Event {
        Event::new(
            EventPayload::TaskCompleted {
                task_id: "tsk_1".into(),
                sub_session_id: "ses_sub".into(),
                description: "scan".into(),
                result: "all clear".into(),
                execution_time_ms: 10,
                subagent_type: "general".into(),
            },
            EventMetadata {
                trigger_session_id: trigger.map(str::to_owned),
                ..EventMetadata::default()
            },
        )
    }

    #[tokio::test]
    async fn injects_triple_and_reinvokes() {
        let (sessions, invoker, processor) = fixture();
        let s = sessions.create(Default::default()).unwrap();

        let event = task_event(Some(&s.id));
        processor
            .process_event(&event, ProcessEventOptions::default())
            .await
            .unwrap();

        let messages = sessions.get_messages(&s.id, None).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::User);
        assert!(messages[0].text().contains("Observed event: background_task.completed"));
        assert!(messages[0].text().contains(&event.id));

        assert_eq!(messages[1].role, MessageRole::Assistant);
        let call_id = format!("call_{}", event.id);
        match &messages[1].tool_part(&call_id).unwrap().kind {
            PartKind::Tool { tool, state, .. } => {
                assert_eq!(tool, "get_event_info");
                assert_eq!(*state, ToolState::Completed);
            }
            _ => panic!("expected tool part"),
        }

        assert_eq!(messages[2].role, MessageRole::Tool);
        // The tool result is the full event JSON.
        assert!(messages[2].parts.iter().any(|p| matches!(
            &p.kind,
            PartKind::Tool { output: Some(o), .. } if o.contains("all clear")
        )));

        let calls = invoker.calls.lock();
        assert_eq!(calls.len(), 1);
        let (prompt, session, history_len) = &calls[0];
        assert_eq!(prompt, "Process event: background_task.completed");
        assert_eq!(session.as_deref(), Some(s.id.as_str()));
        // The executor sees the synthetic round-trip in its history.
        assert!(*history_len >= 3);
    }

    #[tokio::test]
    async fn resolves_session_via_client_registry() {
        let (sessions, invoker, _) = fixture();
        let registry = Arc::new(ActiveSessionRegistry::new());
        let processor = EventProcessor::new(sessions.clone(), invoker.clone(), registry.clone());

        let s = sessions.create(Default::default()).unwrap();
        registry.set_active("client_7", &s.id);

        let mut event = task_event(None);
        event.metadata.client_id = Some("client_7".into());

        processor
            .process_event(&event, ProcessEventOptions::default())
            .await
            .unwrap();
        assert_eq!(invoker.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_event_is_dropped_quietly() {
        let (sessions, invoker, processor) = fixture();
        let _ = sessions;

        let event = task_event(None);
        processor
            .process_event(&event, ProcessEventOptions::default())
            .await
            .unwrap();
        assert!(invoker.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn unknown_trigger_session_is_dropped_quietly() {
        let (_sessions, invoker, processor) = fixture();
        let event = task_event(Some("ses_gone"));
        processor
            .process_event(&event, ProcessEventOptions::default())
            .await
            .unwrap();
        assert!(invoker.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn include_tool_call_false_injects_single_message() {
        let (sessions, _invoker, processor) = fixture();
        let s = sessions.create(Default::default()).unwrap();

        let event = task_event(Some(&s.id));
        processor
            .process_event(
                &event,
                ProcessEventOptions {
                    include_tool_call: false,
                    ..ProcessEventOptions::default()
                },
            )
            .await
            .unwrap();

        let messages = sessions.get_messages(&s.id, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn agent_guide_is_appended_to_summary() {
        let (sessions, _invoker, processor) = fixture();
        let s = sessions.create(Default::default()).unwrap();

        let mut event = task_event(Some(&s.id));
        event.metadata.agent_guide = Some("Tell the user what the task found.".into());
        processor
            .process_event(&event, ProcessEventOptions::default())
            .await
            .unwrap();

        let messages = sessions.get_messages(&s.id, None).unwrap();
        assert!(messages[0].text().contains("Tell the user what the task found."));
    }
}
