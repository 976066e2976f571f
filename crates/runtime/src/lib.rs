//! The Switchboard runtime: query execution, streaming, background tasks,
//! and event-driven re-entry.
//!
//! The [`executor::QueryExecutor`] implements the `handle_query` contract —
//! it streams model output through the [`bridge::StreamBridge`] (which
//! mirrors everything into the session and onto the event bus), dispatches
//! tools, and loops until the model stops calling them. The
//! [`tasks::TaskManager`] runs delegated sub-agents detached from their
//! parent session, and the [`processor::EventProcessor`] replays their
//! completion events back into the parent as a synthetic tool round-trip.

pub mod bridge;
pub mod cancel;
pub mod compact;
pub mod executor;
pub mod processor;
pub mod tasks;
pub mod tools;

pub use cancel::CancelMap;
pub use compact::{compact_session, CompactOptions, CompactionResult};
pub use executor::QueryExecutor;
pub use processor::{ActiveSessionRegistry, EventProcessor, ProcessEventOptions};
pub use tasks::{BackgroundTask, CleanupPolicy, CreateTask, TaskManager, TaskStatus};
pub use tools::{Tool, ToolContext, ToolRegistry};
