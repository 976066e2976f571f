//! Session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Edit statistics attached to a session by `set_summary`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub additions: u64,
    pub deletions: u64,
    pub files: u64,
}

/// A single conversation context. `parent_id` forms a forest: compaction and
/// fork both create children; traversal always goes through the store, never
/// through pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    pub directory: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SessionInfo {
    /// Bump `updated`, keeping it strictly monotonic even when mutations
    /// land within one clock tick.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated = if now > self.updated {
            now
        } else {
            self.updated + chrono::Duration::microseconds(1)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_is_strictly_monotonic() {
        let now = Utc::now();
        let mut info = SessionInfo {
            id: "ses_x".into(),
            parent_id: None,
            title: String::new(),
            directory: String::new(),
            created: now,
            updated: now,
            summary: None,
            metadata: None,
        };
        let mut prev = info.updated;
        for _ in 0..50 {
            info.touch();
            assert!(info.updated > prev);
            prev = info.updated;
        }
    }
}
