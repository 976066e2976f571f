//! Session compaction — summarise a conversation into a child session so
//! clients can move to a shorter context without mutating the parent.
//!
//! The summary is produced by a detached `handle_query` call with an empty
//! history (the summarisation prompt must not pollute the new session's
//! context). The child's first and only message is a system-role text part
//! carrying the summary.

use sb_domain::capability::{QueryContext, QueryInvoker};
use sb_sessions::{CreateSession, Message, PartKind, SessionInfo, SessionManager};

const SUMMARY_INSTRUCTION: &str = "Summarize the conversation below. Capture: \
the main user goals, key decisions made, the current state of the work, and \
concrete next steps. Be concise but preserve all actionable context.";

#[derive(Debug, Clone)]
pub struct CompactOptions {
    /// How many trailing messages are rendered into the summary prompt.
    pub keep_messages: usize,
    /// Replaces the built-in summary instruction when set.
    pub custom_prompt: Option<String>,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            keep_messages: 50,
            custom_prompt: None,
        }
    }
}

#[derive(Debug)]
pub struct CompactionResult {
    pub success: bool,
    /// The summary-bearing child session on success.
    pub session: Option<SessionInfo>,
    pub error: Option<String>,
}

/// Compact `session_id` into a fresh child session. The parent is never
/// mutated; on failure the result carries the error and nothing is created.
pub async fn compact_session(
    sessions: &SessionManager,
    invoker: &dyn QueryInvoker,
    session_id: &str,
    options: CompactOptions,
) -> CompactionResult {
    let outcome = async {
        let messages = sessions.get_messages(session_id, Some(options.keep_messages))?;
        let rendered = render_messages(&messages);

        let instruction = options
            .custom_prompt
            .as_deref()
            .unwrap_or(SUMMARY_INSTRUCTION);
        let prompt = format!("{instruction}\n\nCONVERSATION:\n{rendered}");

        // Detached call: empty context, empty history.
        let summary = invoker
            .handle_query(&prompt, QueryContext::default(), Vec::new())
            .await?;

        let parent = sessions.get(session_id)?;
        let child = sessions.create(CreateSession {
            parent_id: Some(session_id.to_owned()),
            title: Some(parent.title),
            directory: Some(parent.directory),
            ..CreateSession::default()
        })?;
        sessions.add_system_message(&child.id, &summary)?;

        tracing::info!(
            session_id,
            child_id = %child.id,
            summary_len = summary.len(),
            "session compacted"
        );
        sessions.get(&child.id)
    }
    .await;

    match outcome {
        Ok(session) => CompactionResult {
            success: true,
            session: Some(session),
            error: None,
        },
        Err(e) => {
            tracing::warn!(session_id, error = %e, "compaction failed");
            CompactionResult {
                success: false,
                session: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// One line per message: `[role] text` plus a short marker per tool part.
/// Long lines are trimmed head+tail to keep the summary prompt manageable.
fn render_messages(messages: &[Message]) -> String {
    let mut buf = String::new();
    for message in messages {
        let role = match message.role {
            sb_sessions::MessageRole::User => "user",
            sb_sessions::MessageRole::Assistant => "assistant",
            sb_sessions::MessageRole::Tool => "tool",
            sb_sessions::MessageRole::System => "system",
        };
        let mut line = message.text();
        for part in &message.parts {
            if let PartKind::Tool { tool, state, .. } = &part.kind {
                line.push_str(&format!(" [tool:{tool}:{state:?}]"));
            }
        }
        if line.len() > 2000 {
            let head: String = line.chars().take(1000).collect();
            let tail_start = line.chars().count().saturating_sub(500);
            let tail: String = line.chars().skip(tail_start).collect();
            line = format!("{head} [...] {tail}");
        }
        buf.push_str(&format!("[{role}] {line}\n"));
    }
    buf
}
