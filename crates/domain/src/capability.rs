//! Capability interfaces between the runtime and its collaborators.
//!
//! Components depend on these narrow traits instead of a concrete
//! environment object: the executor implements [`QueryInvoker`]; the task
//! manager, event processor, and compaction consume it.

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::tool::Message;

/// Per-query context carried into [`QueryInvoker::handle_query`].
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    /// Session the query runs in. `None` for detached one-shot calls
    /// (compaction summaries) — those must not touch any session.
    pub session_id: Option<String>,
    /// Client that initiated the query, when known.
    pub client_id: Option<String>,
    /// Cancellation signal; the executor aborts in-flight work when fired.
    pub cancel: Option<CancellationToken>,
}

impl QueryContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

/// The query contract the core depends on (spec'd collaborator).
///
/// `handle_query` appends the prompt as a user message (when a session is
/// given), runs the model/tool loop streaming progress through the event
/// bus, and returns the final assistant text — possibly empty when the
/// conversation ended with only tool calls.
#[async_trait::async_trait]
pub trait QueryInvoker: Send + Sync {
    async fn handle_query(
        &self,
        prompt: &str,
        ctx: QueryContext,
        history: Vec<Message>,
    ) -> Result<String>;
}
