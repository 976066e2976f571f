//! Messages — append-only units of a session's history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sb_domain::ident;

use crate::part::{Part, PartKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

/// A message within a session. Messages may grow new parts while live (an
/// assistant message's pending tool parts transition to completed); once a
/// message stops being the trailing one it is treated as immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: MessageRole) -> Self {
        Self {
            id: ident::ascending(ident::MESSAGE),
            session_id: session_id.into(),
            role,
            timestamp: Utc::now(),
            metadata: None,
            parts: Vec::new(),
        }
    }

    pub fn with_part(session_id: impl Into<String>, role: MessageRole, part: Part) -> Self {
        let mut msg = Self::new(session_id, role);
        msg.parts.push(part);
        msg
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        let mut buf = String::new();
        for part in &self.parts {
            if let PartKind::Text { text } = &part.kind {
                if !buf.is_empty() {
                    buf.push('\n');
                }
                buf.push_str(text);
            }
        }
        buf
    }

    /// Find a tool part by its call ID.
    pub fn tool_part(&self, call_id: &str) -> Option<&Part> {
        self.parts.iter().find(|p| match &p.kind {
            PartKind::Tool { call_id: id, .. } => id == call_id,
            _ => false,
        })
    }

    /// Copy this message into another session with fresh message/part IDs.
    pub fn remapped_into(&self, session_id: &str) -> Self {
        Self {
            id: ident::ascending(ident::MESSAGE),
            session_id: session_id.to_owned(),
            role: self.role,
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
            parts: self.parts.iter().map(Part::with_new_id).collect(),
        }
    }
}
