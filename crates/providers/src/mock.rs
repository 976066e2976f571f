//! Pre-scripted mock provider for tests.
//!
//! Each call to `chat`/`chat_stream` pops the next script from the front of
//! the queue, letting tests specify exact event sequences — tool calls,
//! reasoning, transient failures — without network access.

use std::sync::Arc;

use futures_util::stream;
use parking_lot::Mutex;

use sb_domain::error::{Error, Result};
use sb_domain::stream::{BoxStream, StreamEvent, Usage};
use sb_domain::tool::ToolCall;

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

/// One scripted provider call.
#[derive(Debug, Clone)]
pub enum Script {
    /// The call succeeds and streams these events.
    Events(Vec<StreamEvent>),
    /// The call itself fails (before any event is streamed).
    Fail { message: String, transient: bool },
}

pub struct MockProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    /// Every request seen, so tests can assert on what was sent.
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Provider that always returns a single text reply, streamed in
    /// per-character chunks.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// Build a text-reply script (chunked per character, usage, done).
    pub fn text_script(reply: impl Into<String>) -> Script {
        let reply = reply.into();
        let mut events: Vec<StreamEvent> = reply
            .chars()
            .map(|c| StreamEvent::Token {
                text: c.to_string(),
            })
            .collect();
        events.push(StreamEvent::Done {
            usage: Some(Usage {
                prompt_tokens: 5,
                completion_tokens: reply.len() as u32,
                total_tokens: 5 + reply.len() as u32,
            }),
            finish_reason: Some("stop".into()),
        });
        Script::Events(events)
    }

    /// Build a script that emits one tool call and finishes.
    pub fn tool_call_script(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Script {
        let call_id = call_id.into();
        let tool_name = tool_name.into();
        Script::Events(vec![
            StreamEvent::ToolCallStarted {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
            },
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            },
            StreamEvent::Done {
                usage: Some(Usage {
                    prompt_tokens: 5,
                    completion_tokens: 3,
                    total_tokens: 8,
                }),
                finish_reason: Some("tool_calls".into()),
            },
        ])
    }

    /// Convenience: a tool-call round followed by a text reply.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_script(call_id, tool_name, arguments),
            Self::text_script(final_text),
        ])
    }

    fn next_script(&self) -> Script {
        let mut scripts = self.scripts.lock();
        if scripts.is_empty() {
            // Fallback when all scripts are consumed.
            Script::Events(vec![
                StreamEvent::Token {
                    text: "[no more scripts]".into(),
                },
                StreamEvent::Done {
                    usage: None,
                    finish_reason: Some("stop".into()),
                },
            ])
        } else {
            scripts.remove(0)
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req);
        let events = match self.next_script() {
            Script::Events(events) => events,
            Script::Fail { message, transient } => {
                return Err(Error::Provider {
                    provider: "mock".into(),
                    message,
                    transient,
                })
            }
        };

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage = None;
        for event in events {
            match event {
                StreamEvent::Token { text } => content.push_str(&text),
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                }),
                StreamEvent::Done { usage: u, .. } => usage = u,
                _ => {}
            }
        }
        Ok(ChatResponse {
            content,
            tool_calls,
            usage,
            model: self.model_name().to_owned(),
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.requests.lock().push(req);
        match self.next_script() {
            Script::Events(events) => {
                let wrapped: Vec<Result<StreamEvent>> = events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
            Script::Fail { message, transient } => Err(Error::Provider {
                provider: "mock".into(),
                message,
                transient,
            }),
        }
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn provider_id(&self) -> &str {
        "mock"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Echo provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic development provider: echoes the last user message back as
/// the assistant response. The server falls back to this when no concrete
/// provider is wired in, so the full stack stays exercisable end-to-end.
#[derive(Default)]
pub struct EchoProvider;

fn last_user_text(req: &ChatRequest) -> String {
    req.messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, sb_domain::tool::Role::User))
        .and_then(|m| m.content.text())
        .unwrap_or("[no input]")
        .to_owned()
}

#[async_trait::async_trait]
impl LlmProvider for EchoProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: format!("echo: {}", last_user_text(&req)),
            tool_calls: Vec::new(),
            usage: None,
            model: self.model_name().to_owned(),
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let reply = format!("echo: {}", last_user_text(&req));
        let events = vec![
            Ok(StreamEvent::Token { text: reply }),
            Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }

    fn model_name(&self) -> &str {
        "echo"
    }

    fn provider_id(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use sb_domain::tool::Message;

    fn req() -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user("hi")],
            ..ChatRequest::default()
        }
    }

    #[tokio::test]
    async fn streams_scripted_text() {
        let provider = MockProvider::always_text("ok");
        let mut stream = provider.chat_stream(req()).await.unwrap();

        let mut text = String::new();
        let mut done = false;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                StreamEvent::Token { text: t } => text.push_str(&t),
                StreamEvent::Done { .. } => done = true,
                _ => {}
            }
        }
        assert_eq!(text, "ok");
        assert!(done);
    }

    #[tokio::test]
    async fn chat_collects_tool_calls() {
        let provider = MockProvider::tool_then_text(
            "call_1",
            "get_weather",
            serde_json::json!({"city": "Beijing"}),
            "sunny",
        );
        let first = provider.chat(req()).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(first.tool_calls[0].tool_name, "get_weather");

        let second = provider.chat(req()).await.unwrap();
        assert_eq!(second.content, "sunny");
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_provider_error() {
        let provider = MockProvider::new(vec![Script::Fail {
            message: "rate limited".into(),
            transient: true,
        }]);
        let err = provider.chat_stream(req()).await.err().unwrap();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn records_requests() {
        let provider = MockProvider::always_text("x");
        provider.chat(req()).await.unwrap();
        assert_eq!(provider.requests.lock().len(), 1);
    }
}
