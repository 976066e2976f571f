use std::sync::Arc;

use sb_bus::{EventBus, Subscription};
use sb_domain::config::Config;
use sb_runtime::{
    ActiveSessionRegistry, CancelMap, EventProcessor, QueryExecutor, TaskManager,
};
use sb_sessions::SessionManager;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, sessions, event bus
/// - **Runtime** — executor, task manager, event processor, cancellation
/// - **Security** — startup-computed bearer token hash
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub bus: Arc<EventBus>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub executor: Arc<QueryExecutor>,
    pub tasks: Arc<TaskManager>,
    pub processor: Arc<EventProcessor>,
    pub active_sessions: Arc<ActiveSessionRegistry>,
    /// Per-session cancellation for in-flight prompt turns.
    pub cancel_map: Arc<CancelMap>,
    /// Keeps the processor's `background_task.*` subscription alive for the
    /// lifetime of the server.
    pub reentry_subscription: Arc<Subscription>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token, read once at startup.
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
}
