//! Background task manager — detached sub-agent executions.
//!
//! A task exclusively owns its sub-session until it reaches a terminal
//! state. The manager schedules execution, races it against cancellation and
//! an optional timeout, and publishes exactly one terminal
//! `background_task.*` event carrying `trigger_session_id = parent` so the
//! event processor can re-enter the parent session. The manager itself never
//! retries; transient-error retry lives in the query executor.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sb_bus::{EventBus, EventMetadata, EventPayload};
use sb_domain::capability::{QueryContext, QueryInvoker};
use sb_domain::config::TasksConfig;
use sb_domain::error::{Error, Result};
use sb_domain::ident;
use sb_sessions::{CreateSession, SessionManager};

use crate::cancel::CancelMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task status & record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Timeout
        )
    }
}

/// What happens to the sub-session once the task is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    Keep,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundTask {
    pub id: String,
    pub parent_session_id: String,
    pub sub_session_id: String,
    pub description: String,
    pub subagent_type: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub cleanup: CleanupPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Input to [`TaskManager::create_task`].
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub parent_session_id: String,
    pub description: String,
    pub prompt: String,
    pub subagent_type: String,
    pub timeout: Option<Duration>,
    pub cleanup: CleanupPolicy,
}

/// Outcome of [`TaskManager::stop_task`].
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub success: bool,
    pub task: Option<BackgroundTask>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TaskManager {
    sessions: Arc<SessionManager>,
    bus: Arc<EventBus>,
    /// Set once at bootstrap, after the executor (which depends on the tool
    /// registry, which depends on this manager) has been built.
    invoker: OnceLock<Arc<dyn QueryInvoker>>,
    tasks: RwLock<HashMap<String, BackgroundTask>>,
    cancel: CancelMap,
    config: TasksConfig,
}

impl TaskManager {
    pub fn new(sessions: Arc<SessionManager>, bus: Arc<EventBus>, config: TasksConfig) -> Self {
        Self {
            sessions,
            bus,
            invoker: OnceLock::new(),
            tasks: RwLock::new(HashMap::new()),
            cancel: CancelMap::new(),
            config,
        }
    }

    pub fn set_invoker(&self, invoker: Arc<dyn QueryInvoker>) {
        let _ = self.invoker.set(invoker);
    }

    fn invoker(&self) -> Result<Arc<dyn QueryInvoker>> {
        self.invoker
            .get()
            .cloned()
            .ok_or_else(|| Error::Other("task manager has no query invoker".into()))
    }

    /// Create the sub-session, register the task, and schedule execution.
    /// Returns immediately with `(task_id, sub_session_id)`.
    pub fn create_task(self: &Arc<Self>, spec: CreateTask) -> Result<(String, String)> {
        let invoker = self.invoker()?;
        // Validate the parent before committing anything.
        self.sessions.get(&spec.parent_session_id)?;

        let sub = self.sessions.create(CreateSession {
            parent_id: Some(spec.parent_session_id.clone()),
            title: Some(format!("Task: {}", spec.description)),
            ..CreateSession::default()
        })?;

        let task_id = ident::ascending(ident::TASK);
        let task = BackgroundTask {
            id: task_id.clone(),
            parent_session_id: spec.parent_session_id.clone(),
            sub_session_id: sub.id.clone(),
            description: spec.description.clone(),
            subagent_type: spec.subagent_type.clone(),
            status: TaskStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            cleanup: spec.cleanup,
            result: None,
            error: None,
        };
        self.tasks.write().insert(task_id.clone(), task);

        let token = self.cancel.register(&task_id);
        let timeout = spec
            .timeout
            .or(self.config.default_timeout_ms.map(Duration::from_millis));

        let manager = self.clone();
        let sub_id = sub.id.clone();
        let returned_id = task_id.clone();
        let span = tracing::info_span!("background_task", task_id = %task_id, sub_session = %sub_id);
        tokio::spawn(tracing::Instrument::instrument(
            async move {
                manager
                    .run_task(invoker, spec, task_id, sub_id, timeout, token)
                    .await;
            },
            span,
        ));

        Ok((returned_id, sub.id))
    }

    /// Run a delegated sub-agent to completion inline (non-background mode
    /// of the `task` tool).
    pub async fn run_inline(&self, spec: CreateTask) -> Result<String> {
        let invoker = self.invoker()?;
        self.sessions.get(&spec.parent_session_id)?;

        let sub = self.sessions.create(CreateSession {
            parent_id: Some(spec.parent_session_id.clone()),
            title: Some(format!("Task: {}", spec.description)),
            ..CreateSession::default()
        })?;

        let ctx = QueryContext::for_session(&sub.id);
        let result = invoker.handle_query(&spec.prompt, ctx, Vec::new()).await;

        if spec.cleanup == CleanupPolicy::Delete {
            if let Err(e) = self.sessions.delete(&sub.id) {
                tracing::warn!(sub_session = %sub.id, error = %e, "inline task cleanup failed");
            }
        }
        result
    }

    /// Signal cancellation for a running task. The transition to `stopped`
    /// (and its event) happens on the task's own execution path.
    pub fn stop_task(&self, task_id: &str) -> Result<StopOutcome> {
        let Some(task) = self.get_task(task_id) else {
            return Err(Error::NotFound(format!("task {task_id}")));
        };
        if task.status.is_terminal() {
            return Ok(StopOutcome {
                success: false,
                task: Some(task),
            });
        }
        self.cancel.cancel(task_id);
        Ok(StopOutcome {
            success: true,
            task: Some(task),
        })
    }

    pub fn get_task(&self, task_id: &str) -> Option<BackgroundTask> {
        self.tasks.read().get(task_id).cloned()
    }

    /// Tasks, newest first, optionally filtered by parent session.
    pub fn list_tasks(&self, parent_session_id: Option<&str>) -> Vec<BackgroundTask> {
        let mut tasks: Vec<BackgroundTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| parent_session_id.is_none_or(|p| t.parent_session_id == p))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        tasks
    }

    /// Remove terminal task records older than the given duration. Called
    /// periodically to bound registry growth.
    pub fn evict_terminal(&self, older_than: chrono::Duration) {
        let cutoff = Utc::now() - older_than;
        self.tasks.write().retain(|_, t| {
            !t.status.is_terminal() || t.ended_at.is_none_or(|ts| ts > cutoff)
        });
    }

    // ── Execution ───────────────────────────────────────────────────

    async fn run_task(
        self: Arc<Self>,
        invoker: Arc<dyn QueryInvoker>,
        spec: CreateTask,
        task_id: String,
        sub_session_id: String,
        timeout: Option<Duration>,
        token: tokio_util::sync::CancellationToken,
    ) {
        let started = Instant::now();
        self.update(&task_id, |t| t.status = TaskStatus::Running);
        tracing::debug!("task running");

        let ctx = QueryContext {
            session_id: Some(sub_session_id.clone()),
            client_id: None,
            cancel: Some(token.clone()),
        };
        let fut = invoker.handle_query(&spec.prompt, ctx, Vec::new());
        tokio::pin!(fut);

        enum Outcome {
            Finished(Result<String>),
            Cancelled,
            TimedOut,
        }

        let outcome = if let Some(limit) = timeout {
            tokio::select! {
                res = &mut fut => Outcome::Finished(res),
                _ = token.cancelled() => Outcome::Cancelled,
                _ = tokio::time::sleep(limit) => Outcome::TimedOut,
            }
        } else {
            tokio::select! {
                res = &mut fut => Outcome::Finished(res),
                _ = token.cancelled() => Outcome::Cancelled,
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let metadata = EventMetadata {
            session_id: Some(spec.parent_session_id.clone()),
            trigger_session_id: Some(spec.parent_session_id.clone()),
            task_id: Some(task_id.clone()),
            source: Some("task_manager".into()),
            ..EventMetadata::default()
        };

        let (status, payload) = match outcome {
            Outcome::Finished(Ok(result)) => {
                self.update(&task_id, |t| t.result = Some(result.clone()));
                (
                    TaskStatus::Completed,
                    EventPayload::TaskCompleted {
                        task_id: task_id.clone(),
                        sub_session_id: sub_session_id.clone(),
                        description: spec.description.clone(),
                        result,
                        execution_time_ms: elapsed_ms,
                        subagent_type: spec.subagent_type.clone(),
                    },
                )
            }
            Outcome::Finished(Err(_)) if token.is_cancelled() => (
                TaskStatus::Stopped,
                EventPayload::TaskStopped {
                    task_id: task_id.clone(),
                    sub_session_id: sub_session_id.clone(),
                    message: "task stopped".into(),
                    execution_time_ms: elapsed_ms,
                },
            ),
            Outcome::Finished(Err(e)) => {
                let error = e.to_string();
                self.update(&task_id, |t| t.error = Some(error.clone()));
                (
                    TaskStatus::Failed,
                    EventPayload::TaskFailed {
                        task_id: task_id.clone(),
                        sub_session_id: sub_session_id.clone(),
                        description: spec.description.clone(),
                        error,
                        execution_time_ms: elapsed_ms,
                        subagent_type: spec.subagent_type.clone(),
                    },
                )
            }
            Outcome::Cancelled => {
                self.abort_sub_stream(&sub_session_id, "task stopped");
                (
                    TaskStatus::Stopped,
                    EventPayload::TaskStopped {
                        task_id: task_id.clone(),
                        sub_session_id: sub_session_id.clone(),
                        message: "task stopped".into(),
                        execution_time_ms: elapsed_ms,
                    },
                )
            }
            Outcome::TimedOut => {
                token.cancel();
                self.abort_sub_stream(&sub_session_id, "task timed out");
                (
                    TaskStatus::Timeout,
                    EventPayload::TaskTimeout {
                        task_id: task_id.clone(),
                        sub_session_id: sub_session_id.clone(),
                        description: spec.description.clone(),
                        message: format!(
                            "task exceeded its {}ms timeout",
                            timeout.map(|t| t.as_millis()).unwrap_or_default()
                        ),
                        execution_time_ms: elapsed_ms,
                    },
                )
            }
        };

        // Exactly one terminal transition and one terminal event per task.
        let transitioned = self.finish(&task_id, status);
        if transitioned {
            self.bus.publish(payload, metadata);
        }

        self.cancel.remove(&task_id);

        if transitioned && spec.cleanup == CleanupPolicy::Delete {
            if let Err(e) = self.sessions.delete(&sub_session_id) {
                tracing::warn!(sub_session = %sub_session_id, error = %e, "task cleanup failed");
            }
        }

        tracing::debug!(status = ?status, elapsed_ms, "task finished");
    }

    /// When a task's query future is dropped mid-flight (stop/timeout), the
    /// executor cannot close its own stream: clear pending tool parts and
    /// publish the terminal `stream.error` for the sub-session here.
    fn abort_sub_stream(&self, sub_session_id: &str, reason: &str) {
        if let Err(e) = self.sessions.fail_pending_tools(sub_session_id, reason) {
            tracing::warn!(sub_session = %sub_session_id, error = %e, "failed to clear pending tools");
        }
        self.bus.publish(
            EventPayload::StreamError {
                session_id: sub_session_id.to_owned(),
                message_id: None,
                error: reason.to_owned(),
            },
            EventMetadata::default(),
        );
    }

    fn update(&self, task_id: &str, f: impl FnOnce(&mut BackgroundTask)) {
        if let Some(task) = self.tasks.write().get_mut(task_id) {
            f(task);
        }
    }

    /// Transition to a terminal status unless already terminal. Returns
    /// whether the transition happened.
    fn finish(&self, task_id: &str, status: TaskStatus) -> bool {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = status;
        task.ended_at = Some(Utc::now());
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
