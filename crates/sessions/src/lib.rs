//! Session state for Switchboard.
//!
//! A session owns an ordered list of messages; each message is composed of
//! typed parts (text, reasoning, file, tool). Sessions form a forest via
//! `parent_id` and are persisted through the [`storage::Storage`] capability
//! (memory or disk backed). The [`manager::SessionManager`] is the single
//! mutation path and serialises concurrent appends per session.

pub mod manager;
pub mod message;
pub mod part;
pub mod prune;
pub mod session;
pub mod storage;

pub use manager::{CreateSession, SessionManager};
pub use message::{Message, MessageRole};
pub use part::{Part, PartKind, TimeSpan, ToolState};
pub use session::{SessionInfo, SessionStats};
pub use storage::{DiskStorage, MemoryStorage, Storage};
