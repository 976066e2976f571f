use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Full server configuration, loaded from `config.toml` with env overrides
/// applied afterwards (`PORT`, `HOSTNAME`, `SB_STATE_DIR`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment-variable overrides on top of the file values.
    pub fn apply_env(&mut self) {
        if let Some(port) = env_var("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = env_var("HOSTNAME") {
            self.server.host = host;
        }
        if let Some(dir) = env_var("SB_STATE_DIR") {
            self.storage.path = PathBuf::from(dir);
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Name of the env var holding the shared bearer token. Unset or empty
    /// token means dev mode: no auth enforced.
    #[serde(default = "d_token_env")]
    pub api_token_env: String,
    /// Seconds between SSE heartbeat frames.
    #[serde(default = "d_heartbeat")]
    pub heartbeat_secs: u64,
    /// Per-connection SSE queue capacity; a client that falls this many
    /// events behind is disconnected.
    #[serde(default = "d_sse_queue")]
    pub sse_queue_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            api_token_env: d_token_env(),
            heartbeat_secs: d_heartbeat(),
            sse_queue_len: d_sse_queue(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// In-memory only; state is lost on exit. Used by tests and ephemeral runs.
    Memory,
    /// One JSON file per session/message under `storage.path`.
    #[default]
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Hard cap on in-memory messages per session; the oldest are evicted
    /// first. Persisted copies remain readable through the store.
    #[serde(default = "d_message_cap")]
    pub message_cap: usize,
    /// How many trailing messages compaction renders into the summary prompt.
    #[serde(default = "d_keep_messages")]
    pub compact_keep_messages: usize,
    /// Tool names whose completed outputs pruning never touches.
    #[serde(default = "d_protected_tools")]
    pub prune_protected_tools: Vec<String>,
    /// Estimated-token threshold above which pruning is suggested.
    #[serde(default = "d_prune_threshold")]
    pub prune_token_threshold: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            message_cap: d_message_cap(),
            compact_keep_messages: d_keep_messages(),
            prune_protected_tools: d_protected_tools(),
            prune_token_threshold: d_prune_threshold(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum model/tool round-trips per query before we force-stop.
    #[serde(default = "d_max_tool_loops")]
    pub max_tool_loops: usize,
    /// Bounded retry attempts for transient provider errors.
    #[serde(default = "d_retry_attempts")]
    pub retry_max_attempts: u32,
    /// Base delay for exponential backoff between retries.
    #[serde(default = "d_retry_delay")]
    pub retry_base_delay_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_tool_loops: d_max_tool_loops(),
            retry_max_attempts: d_retry_attempts(),
            retry_base_delay_ms: d_retry_delay(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Background tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Default timeout applied when a task request carries none.
    /// `None` means no timeout.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    /// Terminal task records older than this are evicted from the registry.
    #[serde(default = "d_retain_secs")]
    pub retain_terminal_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            retain_terminal_secs: d_retain_secs(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    4810
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_token_env() -> String {
    "SB_API_TOKEN".into()
}
fn d_heartbeat() -> u64 {
    30
}
fn d_sse_queue() -> usize {
    256
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
fn d_message_cap() -> usize {
    100
}
fn d_keep_messages() -> usize {
    50
}
fn d_protected_tools() -> Vec<String> {
    // `task` outputs carry acceptance records and sub-agent results the
    // agent may still need to refer back to.
    vec!["task".into()]
}
fn d_prune_threshold() -> usize {
    120_000
}
fn d_max_tool_loops() -> usize {
    25
}
fn d_retry_attempts() -> u32 {
    3
}
fn d_retry_delay() -> u64 {
    250
}
fn d_retain_secs() -> u64 {
    3600
}
