//! The query executor — implements the `handle_query` contract.
//!
//! One query means one stream: a fresh assistant message, a `stream.start`,
//! then model/tool rounds until the model returns no tool calls, and exactly
//! one terminal `stream.completed` or `stream.error`. Transient provider
//! errors are retried with exponential backoff before they surface.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;

use sb_bus::EventBus;
use sb_domain::capability::{QueryContext, QueryInvoker};
use sb_domain::config::RuntimeConfig;
use sb_domain::error::{Error, Result};
use sb_domain::stream::{StreamEvent, Usage};
use sb_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall};
use sb_providers::{ChatRequest, LlmProvider};
use sb_sessions::SessionManager;

use crate::bridge::StreamBridge;
use crate::tools::{ToolContext, ToolRegistry};

pub struct QueryExecutor {
    sessions: Arc<SessionManager>,
    bus: Arc<EventBus>,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    config: RuntimeConfig,
}

impl QueryExecutor {
    pub fn new(
        sessions: Arc<SessionManager>,
        bus: Arc<EventBus>,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            sessions,
            bus,
            provider,
            tools,
            config,
        }
    }

    // ── Retry ───────────────────────────────────────────────────────

    /// Bounded exponential backoff around a provider call. Only errors the
    /// provider marks transient (rate limits, timeouts, resets) are retried,
    /// and cancellation interrupts the backoff sleep.
    async fn with_retry<T, F, Fut>(
        &self,
        cancel: Option<&tokio_util::sync::CancellationToken>,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(Error::Cancelled("query cancelled".into()));
            }
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.config.retry_max_attempts => {
                    let delay =
                        (self.config.retry_base_delay_ms * 2u64.saturating_pow(attempt)).min(10_000);
                    tracing::warn!(attempt, delay_ms = delay, error = %e, "transient provider error, retrying");
                    let sleep = tokio::time::sleep(std::time::Duration::from_millis(delay));
                    match cancel {
                        Some(token) => {
                            tokio::select! {
                                _ = sleep => {}
                                _ = token.cancelled() => {
                                    return Err(Error::Cancelled("query cancelled".into()));
                                }
                            }
                        }
                        None => sleep.await,
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Detached one-shot (no session, no events) ───────────────────

    async fn one_shot(&self, prompt: &str, mut history: Vec<Message>) -> Result<String> {
        history.push(Message::user(prompt));
        let req = ChatRequest {
            messages: history,
            ..ChatRequest::default()
        };
        let resp = self
            .with_retry(None, || self.provider.chat(req.clone()))
            .await?;
        Ok(resp.content)
    }

    // ── Streaming session query ─────────────────────────────────────

    async fn run_streaming(
        &self,
        prompt: &str,
        ctx: &QueryContext,
        session_id: &str,
        mut messages: Vec<Message>,
    ) -> Result<String> {
        self.sessions.add_user_message(session_id, prompt)?;
        messages.push(Message::user(prompt));

        let tool_defs = self.tools.definitions();
        let tool_ctx = ToolContext {
            session_id: Some(session_id.to_owned()),
        };
        let cancel = ctx.cancel.clone().unwrap_or_default();

        let mut bridge = StreamBridge::open(
            self.sessions.clone(),
            self.bus.clone(),
            session_id,
            self.provider.model_name(),
        )?;

        let mut total_usage = Usage::default();
        let mut have_usage = false;

        for loop_idx in 0..self.config.max_tool_loops {
            tracing::debug!(loop_idx, "tool loop iteration");
            if cancel.is_cancelled() {
                return Self::cancelled(bridge);
            }

            let req = ChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
                temperature: Some(0.2),
                ..ChatRequest::default()
            };
            let mut stream = match self
                .with_retry(Some(&cancel), || self.provider.chat_stream(req.clone()))
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    bridge.fail(&e.to_string());
                    return Err(e);
                }
            };

            let mut round_text = String::new();
            let mut pending: Vec<ToolCall> = Vec::new();
            // call_id -> (tool_name, partial args JSON)
            let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();
            let mut was_cancelled = false;

            while let Some(event) = stream.next().await {
                if cancel.is_cancelled() {
                    was_cancelled = true;
                    break;
                }
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        bridge.fail(&e.to_string());
                        return Err(e);
                    }
                };
                match event {
                    StreamEvent::Token { text } => {
                        round_text.push_str(&text);
                        bridge.on_text_delta(&text)?;
                    }
                    StreamEvent::Thinking { text } => {
                        bridge.on_reasoning(&text)?;
                    }
                    StreamEvent::ToolCallStarted { call_id, tool_name } => {
                        tc_bufs.insert(call_id, (tool_name, String::new()));
                    }
                    StreamEvent::ToolCallDelta { call_id, delta } => {
                        if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                            args.push_str(&delta);
                        }
                    }
                    StreamEvent::ToolCallFinished {
                        call_id,
                        tool_name,
                        arguments,
                    } => {
                        tc_bufs.remove(&call_id);
                        pending.push(ToolCall {
                            call_id,
                            tool_name,
                            arguments,
                        });
                    }
                    StreamEvent::Done { usage, .. } => {
                        if let Some(u) = usage {
                            total_usage.add(&u);
                            have_usage = true;
                        }
                    }
                    StreamEvent::Error { message } => {
                        bridge.fail(&message);
                        return Err(Error::Other(message));
                    }
                }
            }

            if was_cancelled {
                return Self::cancelled(bridge);
            }

            // Assemble calls that came through start/delta but never
            // finished explicitly (some providers only use start+delta).
            for (call_id, (tool_name, args)) in tc_bufs.drain() {
                let arguments = if args.trim().is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    match serde_json::from_str(&args) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!(
                                call_id = %call_id,
                                tool = %tool_name,
                                error = %e,
                                "tool call arguments are not valid JSON, defaulting to empty object"
                            );
                            serde_json::Value::Object(Default::default())
                        }
                    }
                };
                pending.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }

            // No tool calls: this round's text is the final answer.
            if pending.is_empty() {
                let usage = have_usage.then_some(total_usage);
                return Ok(bridge.complete(usage));
            }

            // ── Tool dispatch ───────────────────────────────────────
            messages.push(assistant_tool_message(&round_text, &pending));

            for tc in &pending {
                if cancel.is_cancelled() {
                    return Self::cancelled(bridge);
                }
                bridge.on_tool_call(&tc.call_id, &tc.tool_name, &tc.arguments)?;
            }

            // All tools run concurrently; results are emitted in call order.
            let futures: Vec<_> = pending
                .iter()
                .map(|tc| {
                    self.tools
                        .dispatch(&tc.tool_name, tc.arguments.clone(), &tool_ctx)
                })
                .collect();
            let results = futures_util::future::join_all(futures).await;

            for (tc, (content, success)) in pending.iter().zip(results) {
                bridge.on_tool_result(&tc.call_id, &tc.tool_name, &content, success)?;
                messages.push(Message::tool_result(&tc.call_id, &content));
            }
        }

        let message = format!(
            "tool loop limit reached ({} iterations)",
            self.config.max_tool_loops
        );
        bridge.fail(&message);
        Err(Error::Other(message))
    }

    fn cancelled(bridge: StreamBridge) -> Result<String> {
        bridge.fail("query cancelled");
        Err(Error::Cancelled("query cancelled".into()))
    }
}

/// The assistant turn as the model context sees it: round text plus one
/// `tool_use` part per pending call.
fn assistant_tool_message(text: &str, calls: &[ToolCall]) -> Message {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(ContentPart::Text {
            text: text.to_owned(),
        });
    }
    for tc in calls {
        parts.push(ContentPart::ToolUse {
            id: tc.call_id.clone(),
            name: tc.tool_name.clone(),
            input: tc.arguments.clone(),
        });
    }
    Message {
        role: Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}

#[async_trait::async_trait]
impl QueryInvoker for QueryExecutor {
    async fn handle_query(
        &self,
        prompt: &str,
        ctx: QueryContext,
        history: Vec<Message>,
    ) -> Result<String> {
        match ctx.session_id.clone() {
            None => self.one_shot(prompt, history).await,
            Some(session_id) => {
                let span = tracing::info_span!("query", session_id = %session_id);
                tracing::Instrument::instrument(
                    self.run_streaming(prompt, &ctx, &session_id, history),
                    span,
                )
                .await
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use sb_bus::{EventKind, EventPayload, Filter};
    use sb_domain::config::SessionsConfig;
    use sb_providers::mock::{MockProvider, Script};
    use sb_sessions::{MemoryStorage, MessageRole};

    struct GetWeather;

    #[async_trait::async_trait]
    impl Tool for GetWeather {
        fn name(&self) -> &str {
            "get_weather"
        }
        fn description(&self) -> &str {
            "Report the weather for a city"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            })
        }
        async fn execute(
            &self,
            arguments: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<String> {
            let city = arguments["city"].as_str().unwrap_or("somewhere");
            Ok(format!("22C and sunny in {city}"))
        }
    }

    struct Fixture {
        sessions: Arc<SessionManager>,
        bus: Arc<EventBus>,
        executor: QueryExecutor,
        session_id: String,
    }

    fn fixture(provider: MockProvider) -> Fixture {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemoryStorage::new()),
            SessionsConfig::default(),
        ));
        let bus = Arc::new(EventBus::new());
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(GetWeather));
        let config = RuntimeConfig {
            retry_base_delay_ms: 1,
            ..RuntimeConfig::default()
        };
        let executor = QueryExecutor::new(
            sessions.clone(),
            bus.clone(),
            Arc::new(provider),
            tools,
            config,
        );
        let session_id = sessions.create(Default::default()).unwrap().id;
        Fixture {
            sessions,
            bus,
            executor,
            session_id,
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<sb_bus::Event>) -> Vec<sb_bus::Event> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn simple_prompt_streams_start_text_completed() {
        let f = fixture(MockProvider::always_text("4"));
        let (_sub, mut rx) = f.bus.subscribe_channel(Filter::session(&f.session_id), 256);

        let text = f
            .executor
            .handle_query(
                "What is 2+2?",
                QueryContext::for_session(&f.session_id),
                Vec::new(),
            )
            .await
            .unwrap();
        assert_eq!(text, "4");

        let events = drain(&mut rx);
        assert_eq!(events.first().unwrap().kind(), EventKind::StreamStart);
        assert_eq!(events.last().unwrap().kind(), EventKind::StreamCompleted);

        // Concatenated deltas equal the returned text.
        let deltas: String = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::StreamText { delta, .. } => Some(delta.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "4");

        // Session: user question + assistant answer.
        let messages = f.sessions.get_messages(&f.session_id, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].text(), "What is 2+2?");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].text(), "4");
    }

    #[tokio::test]
    async fn tool_roundtrip_event_order_and_part_state() {
        let f = fixture(MockProvider::tool_then_text(
            "call_1",
            "get_weather",
            serde_json::json!({"city": "Beijing"}),
            "It is sunny in Beijing.",
        ));
        let (_sub, mut rx) = f.bus.subscribe_channel(Filter::session(&f.session_id), 256);

        let text = f
            .executor
            .handle_query(
                "How's the weather in Beijing?",
                QueryContext::for_session(&f.session_id),
                Vec::new(),
            )
            .await
            .unwrap();
        assert_eq!(text, "It is sunny in Beijing.");

        let kinds: Vec<EventKind> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        let call_pos = kinds
            .iter()
            .position(|k| *k == EventKind::StreamToolCall)
            .unwrap();
        let result_pos = kinds
            .iter()
            .position(|k| *k == EventKind::StreamToolResult)
            .unwrap();
        let text_pos = kinds
            .iter()
            .position(|k| *k == EventKind::StreamText)
            .unwrap();
        assert_eq!(kinds[0], EventKind::StreamStart);
        assert!(call_pos < result_pos);
        assert!(result_pos < text_pos);
        assert_eq!(*kinds.last().unwrap(), EventKind::StreamCompleted);

        // The assistant message's tool part went pending -> completed.
        let messages = f.sessions.get_messages(&f.session_id, None).unwrap();
        let part = messages
            .iter()
            .find_map(|m| {
                (m.role == MessageRole::Assistant)
                    .then(|| m.tool_part("call_1"))
                    .flatten()
            })
            .unwrap();
        match &part.kind {
            sb_sessions::PartKind::Tool { state, output, .. } => {
                assert_eq!(*state, sb_sessions::ToolState::Completed);
                assert!(output.as_deref().unwrap().contains("sunny"));
            }
            _ => panic!("expected tool part"),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let f = fixture(MockProvider::new(vec![
            Script::Fail {
                message: "rate limited".into(),
                transient: true,
            },
            MockProvider::text_script("recovered"),
        ]));

        let text = f
            .executor
            .handle_query("hi", QueryContext::for_session(&f.session_id), Vec::new())
            .await
            .unwrap();
        assert_eq!(text, "recovered");
    }

    #[tokio::test]
    async fn retry_exhaustion_publishes_stream_error() {
        let scripts = (0..5)
            .map(|_| Script::Fail {
                message: "rate limited".into(),
                transient: true,
            })
            .collect();
        let f = fixture(MockProvider::new(scripts));
        let (_sub, mut rx) = f.bus.subscribe_channel(Filter::session(&f.session_id), 256);

        let err = f
            .executor
            .handle_query("hi", QueryContext::for_session(&f.session_id), Vec::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("rate limited"));

        let kinds: Vec<EventKind> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.first(), Some(&EventKind::StreamStart));
        assert_eq!(kinds.last(), Some(&EventKind::StreamError));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| matches!(k, EventKind::StreamError | EventKind::StreamCompleted))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let f = fixture(MockProvider::new(vec![
            Script::Fail {
                message: "invalid api key".into(),
                transient: false,
            },
            MockProvider::text_script("should not be reached"),
        ]));

        let err = f
            .executor
            .handle_query("hi", QueryContext::for_session(&f.session_id), Vec::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid api key"));
    }

    #[tokio::test]
    async fn pre_cancelled_query_fails_with_stream_error() {
        let f = fixture(MockProvider::always_text("never"));
        let (_sub, mut rx) = f.bus.subscribe_channel(Filter::session(&f.session_id), 256);

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = QueryContext {
            session_id: Some(f.session_id.clone()),
            client_id: None,
            cancel: Some(token),
        };

        let err = f.executor.handle_query("hi", ctx, Vec::new()).await.err().unwrap();
        assert!(matches!(err, Error::Cancelled(_)));

        let kinds: Vec<EventKind> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.first(), Some(&EventKind::StreamStart));
        assert_eq!(kinds.last(), Some(&EventKind::StreamError));
    }

    #[tokio::test]
    async fn one_shot_skips_sessions_and_events() {
        let f = fixture(MockProvider::always_text("summary text"));
        let (_sub, mut rx) = f.bus.subscribe_channel(Filter::default(), 256);

        let text = f
            .executor
            .handle_query("Summarize", QueryContext::default(), Vec::new())
            .await
            .unwrap();
        assert_eq!(text, "summary text");
        assert!(drain(&mut rx).is_empty());
        // The session was never touched.
        assert!(f.sessions.get_messages(&f.session_id, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn reasoning_is_streamed_but_final_text_excludes_it() {
        let f = fixture(MockProvider::new(vec![Script::Events(vec![
            StreamEvent::Thinking {
                text: "thinking...".into(),
            },
            StreamEvent::Token { text: "answer".into() },
            StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            },
        ])]));
        let (_sub, mut rx) = f.bus.subscribe_channel(Filter::session(&f.session_id), 256);

        let text = f
            .executor
            .handle_query("hi", QueryContext::for_session(&f.session_id), Vec::new())
            .await
            .unwrap();
        assert_eq!(text, "answer");

        let kinds: Vec<EventKind> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert!(kinds.contains(&EventKind::StreamReasoning));

        // History projection drops the reasoning.
        let history = f.sessions.to_history(&f.session_id).unwrap();
        let json = serde_json::to_string(&history).unwrap();
        assert!(!json.contains("thinking..."));
    }
}
