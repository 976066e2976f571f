//! Tool registry — the executor dispatches model tool calls through here.
//!
//! Tool-specific logic (bash, files, web) lives outside the core; the
//! runtime ships only the `task` tool, which delegates work to a sub-agent
//! either inline or detached through the task manager.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use sb_domain::error::{Error, Result};
use sb_domain::tool::ToolDefinition;

use crate::tasks::{CleanupPolicy, CreateTask, TaskManager};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait & registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Context a tool executes in.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Session the calling query runs in.
    pub session_id: Option<String>,
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> serde_json::Value;
    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.write().insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    /// Tool definitions exposed to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_owned(),
                description: t.description().to_owned(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool call, converting every failure into `(text, false)`
    /// so the model sees the error and may react — a failing tool is not a
    /// system failure.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> (String, bool) {
        let Some(tool) = self.get(name) else {
            return (format!("unknown tool: {name}"), false);
        };
        match tool.execute(arguments, ctx).await {
            Ok(output) => (output, true),
            Err(e) => {
                tracing::debug!(tool = name, error = %e, "tool returned an error");
                (e.to_string(), false)
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The `task` tool — delegate work to a sub-agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(serde::Deserialize)]
struct TaskArgs {
    description: String,
    prompt: String,
    #[serde(default = "default_subagent")]
    subagent_type: String,
    #[serde(default)]
    background: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    cleanup: Option<CleanupPolicy>,
}

fn default_subagent() -> String {
    "general".into()
}

/// Runs a delegated sub-agent. With `background: true` the work is scheduled
/// on the task manager and the call returns immediately with an acceptance
/// record; completion re-enters the parent session as a
/// `background_task.completed` event.
pub struct TaskTool {
    manager: Arc<TaskManager>,
}

impl TaskTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Delegate a task to a sub-agent. Set background=true to run it \
         detached; you will be notified through an event when it finishes."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "description": { "type": "string", "description": "Short task label" },
                "prompt": { "type": "string", "description": "Full instructions for the sub-agent" },
                "subagent_type": { "type": "string", "description": "Sub-agent flavor", "default": "general" },
                "background": { "type": "boolean", "default": false },
                "timeout_ms": { "type": "integer", "description": "Abort the task after this many milliseconds" },
                "cleanup": { "type": "string", "enum": ["keep", "delete"], "default": "keep" }
            },
            "required": ["description", "prompt"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<String> {
        let args: TaskArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::Invalid(format!("task arguments: {e}")))?;
        let parent = ctx
            .session_id
            .clone()
            .ok_or_else(|| Error::Invalid("task tool requires a session".into()))?;

        let spec = CreateTask {
            parent_session_id: parent,
            description: args.description,
            prompt: args.prompt,
            subagent_type: args.subagent_type,
            timeout: args.timeout_ms.map(std::time::Duration::from_millis),
            cleanup: args.cleanup.unwrap_or(CleanupPolicy::Keep),
        };

        if args.background {
            let (task_id, sub_session_id) = self.manager.create_task(spec)?;
            Ok(serde_json::json!({
                "status": "accepted",
                "task_id": task_id,
                "sub_session_id": sub_session_id,
            })
            .to_string())
        } else {
            self.manager.run_inline(spec).await
        }
    }
}
