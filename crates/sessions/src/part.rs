//! Message parts — the atomic units of conversation content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sb_domain::ident;

/// Start/end timestamps for parts that span time (reasoning, tool calls).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeSpan {
    pub fn open() -> Self {
        Self {
            start: Utc::now(),
            end: None,
        }
    }

    pub fn close(&mut self) {
        self.end = Some(Utc::now());
    }
}

/// Lifecycle of a tool part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    Completed,
    Error,
}

/// One part of a message. Every part carries its own ID and belongs to
/// exactly one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(flatten)]
    pub kind: PartKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartKind {
    Text {
        text: String,
    },
    /// Model thinking trace. Never projected back into model history.
    Reasoning {
        text: String,
        time: TimeSpan,
    },
    File {
        mime: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Tool {
        call_id: String,
        tool: String,
        state: ToolState,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        time: TimeSpan,
    },
}

impl Part {
    fn new(kind: PartKind) -> Self {
        Self {
            id: ident::ascending(ident::PART),
            kind,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(PartKind::Text { text: text.into() })
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::new(PartKind::Reasoning {
            text: text.into(),
            time: TimeSpan::open(),
        })
    }

    pub fn file(url: impl Into<String>, mime: impl Into<String>, filename: Option<String>) -> Self {
        Self::new(PartKind::File {
            mime: mime.into(),
            url: url.into(),
            filename,
        })
    }

    /// A tool part in `pending` state; flipped by `update_tool_result`.
    pub fn tool_pending(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::new(PartKind::Tool {
            call_id: call_id.into(),
            tool: tool.into(),
            state: ToolState::Pending,
            input,
            output: None,
            error: None,
            time: TimeSpan::open(),
        })
    }

    /// A tool part already carrying its result (tool-role messages).
    pub fn tool_completed(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        input: serde_json::Value,
        output: impl Into<String>,
    ) -> Self {
        let mut time = TimeSpan::open();
        time.close();
        Self::new(PartKind::Tool {
            call_id: call_id.into(),
            tool: tool.into(),
            state: ToolState::Completed,
            input,
            output: Some(output.into()),
            error: None,
            time,
        })
    }

    /// Clone this part with a freshly generated ID (used by fork).
    pub fn with_new_id(&self) -> Self {
        Self {
            id: ident::ascending(ident::PART),
            kind: self.kind.clone(),
        }
    }
}
