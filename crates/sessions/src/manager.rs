//! The session manager — single mutation path for all session state.
//!
//! In-memory state is authoritative; every mutation is written through to
//! the [`Storage`] capability (which may persist asynchronously). Concurrent
//! appends to one session are serialised by a per-session mutex held for the
//! duration of the append, including persistence queueing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use sb_domain::config::SessionsConfig;
use sb_domain::error::{Error, Result};
use sb_domain::ident;
use sb_domain::tool::{ContentPart, Message as HistoryMessage, MessageContent, Role};

use crate::message::{Message, MessageRole};
use crate::part::{Part, PartKind, ToolState};
use crate::session::{SessionInfo, SessionStats};
use crate::storage::Storage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Create options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    /// Explicit ID (tests); generated when absent.
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub directory: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SessionState {
    info: SessionInfo,
    messages: Vec<Message>,
}

pub struct SessionManager {
    storage: Arc<dyn Storage>,
    config: SessionsConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>, config: SessionsConfig) -> Self {
        Self {
            storage,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    // ── Session lifecycle ───────────────────────────────────────────

    /// Create a session and save it immediately. Session IDs are descending
    /// so the newest session sorts first in list views.
    pub fn create(&self, opts: CreateSession) -> Result<SessionInfo> {
        let now = chrono::Utc::now();
        let info = SessionInfo {
            id: opts.id.unwrap_or_else(|| ident::descending(ident::SESSION)),
            parent_id: opts.parent_id,
            title: opts.title.unwrap_or_default(),
            directory: opts.directory.unwrap_or_else(|| ".".into()),
            created: now,
            updated: now,
            summary: None,
            metadata: opts.metadata,
        };

        self.sessions.write().insert(
            info.id.clone(),
            Arc::new(Mutex::new(SessionState {
                info: info.clone(),
                messages: Vec::new(),
            })),
        );
        self.storage.save_session(&info)?;

        tracing::debug!(session_id = %info.id, "session created");
        Ok(info)
    }

    pub fn get(&self, id: &str) -> Result<SessionInfo> {
        Ok(self.state(id)?.lock().info.clone())
    }

    /// All sessions, `updated` descending. In-memory state overlays the
    /// stored list so queued (not yet durable) mutations are visible.
    pub fn list(&self) -> Result<Vec<SessionInfo>> {
        let mut by_id: HashMap<String, SessionInfo> = self
            .storage
            .list_sessions()?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        for state in self.sessions.read().values() {
            let info = state.lock().info.clone();
            by_id.insert(info.id.clone(), info);
        }
        let mut sessions: Vec<SessionInfo> = by_id.into_values().collect();
        sessions.sort_by(|a, b| b.updated.cmp(&a.updated));
        Ok(sessions)
    }

    pub fn get_children(&self, parent_id: &str) -> Result<Vec<SessionInfo>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.parent_id.as_deref() == Some(parent_id))
            .collect())
    }

    /// Delete a session and all transitive children.
    pub fn delete(&self, id: &str) -> Result<()> {
        // Ensure the root exists before cascading.
        self.state(id)?;

        let all = self.list()?;
        let mut doomed = vec![id.to_owned()];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i].clone();
            for s in &all {
                if s.parent_id.as_deref() == Some(parent.as_str()) {
                    doomed.push(s.id.clone());
                }
            }
            i += 1;
        }

        let mut sessions = self.sessions.write();
        for sid in &doomed {
            sessions.remove(sid);
            self.storage.delete_session(sid)?;
        }
        tracing::debug!(session_id = %id, cascaded = doomed.len() - 1, "session deleted");
        Ok(())
    }

    // ── Message appends ─────────────────────────────────────────────

    pub fn add_user_message(&self, id: &str, text: &str) -> Result<Message> {
        self.append(id, Message::with_part(id, MessageRole::User, Part::text(text)))
    }

    pub fn add_assistant_message(&self, id: &str, text: &str) -> Result<Message> {
        self.append(
            id,
            Message::with_part(id, MessageRole::Assistant, Part::text(text)),
        )
    }

    pub fn add_system_message(&self, id: &str, text: &str) -> Result<Message> {
        self.append(id, Message::with_part(id, MessageRole::System, Part::text(text)))
    }

    /// An assistant message carrying one pending tool call.
    pub fn add_assistant_message_with_tool(
        &self,
        id: &str,
        call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<Message> {
        self.append(
            id,
            Message::with_part(
                id,
                MessageRole::Assistant,
                Part::tool_pending(call_id, tool_name, arguments),
            ),
        )
    }

    /// A tool-role message carrying a completed tool result.
    pub fn add_tool_message(
        &self,
        id: &str,
        tool_name: &str,
        call_id: &str,
        output: &str,
        input: serde_json::Value,
    ) -> Result<Message> {
        self.append(
            id,
            Message::with_part(
                id,
                MessageRole::Tool,
                Part::tool_completed(call_id, tool_name, input, output),
            ),
        )
    }

    /// Append a reasoning part to the trailing assistant message, or start a
    /// new assistant message when there is none.
    pub fn add_reasoning(&self, id: &str, text: &str) -> Result<()> {
        let state = self.state(id)?;
        let mut guard = state.lock();
        let appended = match guard.messages.last_mut() {
            Some(last) if last.role == MessageRole::Assistant => {
                last.parts.push(Part::reasoning(text));
                Some(last.clone())
            }
            _ => None,
        };
        match appended {
            Some(message) => {
                guard.info.touch();
                self.storage.save_message(id, &message)?;
                self.storage.save_session(&guard.info)
            }
            None => {
                drop(guard);
                self.append(
                    id,
                    Message::with_part(id, MessageRole::Assistant, Part::reasoning(text)),
                )?;
                Ok(())
            }
        }
    }

    pub fn add_file(
        &self,
        id: &str,
        url: &str,
        mime: &str,
        filename: Option<String>,
    ) -> Result<Message> {
        self.append(
            id,
            Message::with_part(id, MessageRole::User, Part::file(url, mime, filename)),
        )
    }

    /// An empty assistant message — the anchor for a streamed response.
    pub fn new_assistant_message(&self, id: &str) -> Result<Message> {
        self.append(id, Message::new(id, MessageRole::Assistant))
    }

    fn append(&self, id: &str, message: Message) -> Result<Message> {
        let state = self.state(id)?;
        let mut guard = state.lock();
        guard.messages.push(message.clone());

        // Hard cap: evict from the head of the in-memory order. Persisted
        // copies remain readable through the store.
        let cap = self.config.message_cap;
        if cap > 0 && guard.messages.len() > cap {
            let excess = guard.messages.len() - cap;
            guard.messages.drain(..excess);
        }

        guard.info.touch();
        self.storage.save_message(id, &message)?;
        self.storage.save_session(&guard.info)?;
        Ok(message)
    }

    // ── Live-message mutations ──────────────────────────────────────

    /// Append a pending tool part to the trailing assistant message.
    /// Fails silently when the trailing message is not assistant-role.
    pub fn add_tool_call(
        &self,
        id: &str,
        call_id: &str,
        tool_name: &str,
        input: serde_json::Value,
    ) -> Result<()> {
        let state = self.state(id)?;
        let mut guard = state.lock();
        let appended = match guard.messages.last_mut() {
            Some(last) if last.role == MessageRole::Assistant => {
                last.parts.push(Part::tool_pending(call_id, tool_name, input));
                Some(last.clone())
            }
            _ => {
                tracing::debug!(session_id = %id, call_id, "trailing message is not assistant, tool call dropped");
                None
            }
        };
        let Some(message) = appended else {
            return Ok(());
        };
        guard.info.touch();
        self.storage.save_message(id, &message)?;
        self.storage.save_session(&guard.info)
    }

    /// Append a pending tool part to a specific live message (the streaming
    /// bridge anchors all of a query's tool calls on one assistant message,
    /// which stops being the trailing message once tool results arrive).
    pub fn add_tool_call_to_message(
        &self,
        id: &str,
        message_id: &str,
        call_id: &str,
        tool_name: &str,
        input: serde_json::Value,
    ) -> Result<()> {
        self.mutate_message(id, message_id, |message| {
            message
                .parts
                .push(Part::tool_pending(call_id, tool_name, input));
        })
    }

    /// Flip a pending tool part to completed (or error), write the output,
    /// and close its time span. Returns whether a matching part was found.
    pub fn update_tool_result(
        &self,
        id: &str,
        call_id: &str,
        output: &str,
        error: Option<String>,
    ) -> Result<bool> {
        let state = self.state(id)?;
        let mut guard = state.lock();
        let mut updated = None;
        'outer: for message in guard.messages.iter_mut().rev() {
            for part in message.parts.iter_mut() {
                if let PartKind::Tool {
                    call_id: cid,
                    state,
                    output: out,
                    error: err,
                    time,
                    ..
                } = &mut part.kind
                {
                    if cid == call_id {
                        *state = if error.is_some() {
                            ToolState::Error
                        } else {
                            ToolState::Completed
                        };
                        *out = Some(output.to_owned());
                        *err = error;
                        time.close();
                        updated = Some(message.clone());
                        break 'outer;
                    }
                }
            }
        }
        let Some(message) = updated else {
            return Ok(false);
        };
        guard.info.touch();
        self.storage.save_message(id, &message)?;
        self.storage.save_session(&guard.info)?;
        Ok(true)
    }

    /// Replace the streamed text of a live message (cumulative content).
    pub fn update_message_text(&self, id: &str, message_id: &str, text: &str) -> Result<()> {
        self.mutate_message(id, message_id, |message| {
            for part in message.parts.iter_mut() {
                if let PartKind::Text { text: t } = &mut part.kind {
                    *t = text.to_owned();
                    return;
                }
            }
            message.parts.push(Part::text(text));
        })
    }

    /// Replace the streamed reasoning of a live message (providers re-send
    /// reasoning cumulatively, so this overwrites rather than appends).
    pub fn update_reasoning(&self, id: &str, message_id: &str, content: &str) -> Result<()> {
        self.mutate_message(id, message_id, |message| {
            for part in message.parts.iter_mut() {
                if let PartKind::Reasoning { text, .. } = &mut part.kind {
                    *text = content.to_owned();
                    return;
                }
            }
            message.parts.push(Part::reasoning(content));
        })
    }

    /// Mark every pending tool part in the session as errored. Used by the
    /// cancellation path so a cancelled query never leaves `pending` parts.
    pub fn fail_pending_tools(&self, id: &str, reason: &str) -> Result<usize> {
        let state = self.state(id)?;
        let mut guard = state.lock();
        let mut touched = Vec::new();
        let mut count = 0;
        for message in guard.messages.iter_mut() {
            let mut changed = false;
            for part in message.parts.iter_mut() {
                if let PartKind::Tool {
                    state: tool_state,
                    error,
                    time,
                    ..
                } = &mut part.kind
                {
                    if *tool_state == ToolState::Pending {
                        *tool_state = ToolState::Error;
                        *error = Some(reason.to_owned());
                        time.close();
                        changed = true;
                        count += 1;
                    }
                }
            }
            if changed {
                touched.push(message.clone());
            }
        }
        if !touched.is_empty() {
            guard.info.touch();
            for message in &touched {
                self.storage.save_message(id, message)?;
            }
            self.storage.save_session(&guard.info)?;
        }
        Ok(count)
    }

    fn mutate_message(
        &self,
        id: &str,
        message_id: &str,
        f: impl FnOnce(&mut Message),
    ) -> Result<()> {
        let state = self.state(id)?;
        let mut guard = state.lock();
        let Some(message) = guard.messages.iter_mut().find(|m| m.id == message_id) else {
            return Err(Error::NotFound(format!("message {message_id}")));
        };
        f(message);
        let message = message.clone();
        guard.info.touch();
        self.storage.save_message(id, &message)?;
        self.storage.save_session(&guard.info)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get_messages(&self, id: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        let state = self.state(id)?;
        let guard = state.lock();
        let messages = &guard.messages;
        let start = limit
            .map(|l| messages.len().saturating_sub(l))
            .unwrap_or(0);
        Ok(messages[start..].to_vec())
    }

    pub fn get_message(&self, id: &str, message_id: &str) -> Result<Option<Message>> {
        let state = self.state(id)?;
        let guard = state.lock();
        Ok(guard.messages.iter().find(|m| m.id == message_id).cloned())
    }

    pub fn get_last_message(&self, id: &str) -> Result<Option<Message>> {
        let state = self.state(id)?;
        let guard = state.lock();
        Ok(guard.messages.last().cloned())
    }

    pub fn message_count(&self, id: &str) -> Result<usize> {
        Ok(self.state(id)?.lock().messages.len())
    }

    /// Project the session into the role-tagged form the model consumes.
    /// Reasoning parts are dropped; text, file, and tool parts survive.
    pub fn to_history(&self, id: &str) -> Result<Vec<HistoryMessage>> {
        let state = self.state(id)?;
        let guard = state.lock();
        Ok(project_history(&guard.messages))
    }

    // ── Fork ────────────────────────────────────────────────────────

    /// Copy this session's messages from `from_message_id` onward (all when
    /// omitted) into a fresh child session with remapped message/part IDs.
    pub fn fork(&self, id: &str, from_message_id: Option<&str>) -> Result<SessionInfo> {
        let (title, directory, tail) = {
            let state = self.state(id)?;
            let guard = state.lock();
            let start = match from_message_id {
                Some(mid) => guard
                    .messages
                    .iter()
                    .position(|m| m.id == mid)
                    .ok_or_else(|| Error::NotFound(format!("message {mid}")))?,
                None => 0,
            };
            (
                guard.info.title.clone(),
                guard.info.directory.clone(),
                guard.messages[start..].to_vec(),
            )
        };

        let child = self.create(CreateSession {
            parent_id: Some(id.to_owned()),
            title: Some(title),
            directory: Some(directory),
            ..CreateSession::default()
        })?;

        for message in tail {
            self.append(&child.id, message.remapped_into(&child.id))?;
        }
        self.get(&child.id)
    }

    // ── Info mutations ──────────────────────────────────────────────

    pub fn set_title(&self, id: &str, title: &str) -> Result<()> {
        self.mutate_info(id, |info| info.title = title.to_owned())
    }

    pub fn set_summary(&self, id: &str, additions: u64, deletions: u64, files: u64) -> Result<()> {
        self.mutate_info(id, |info| {
            info.summary = Some(SessionStats {
                additions,
                deletions,
                files,
            })
        })
    }

    pub fn set_metadata(&self, id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.mutate_info(id, |info| {
            let map = info
                .metadata
                .get_or_insert_with(|| serde_json::Value::Object(Default::default()));
            if let serde_json::Value::Object(obj) = map {
                obj.insert(key.to_owned(), value);
            }
        })
    }

    fn mutate_info(&self, id: &str, f: impl FnOnce(&mut SessionInfo)) -> Result<()> {
        let state = self.state(id)?;
        let mut guard = state.lock();
        f(&mut guard.info);
        guard.info.touch();
        self.storage.save_session(&guard.info)
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    // ── Pruning ─────────────────────────────────────────────────────

    /// Coarse token estimate over the in-memory history.
    pub fn estimate_tokens(&self, id: &str) -> Result<usize> {
        let state = self.state(id)?;
        let guard = state.lock();
        Ok(crate::prune::estimate_tokens(&guard.messages))
    }

    /// Replace completed tool outputs with a placeholder (config-protected
    /// tools excepted). Returns how many parts were rewritten.
    pub fn prune(&self, id: &str) -> Result<usize> {
        let state = self.state(id)?;
        let mut guard = state.lock();
        let pruned =
            crate::prune::prune_tool_outputs(&mut guard.messages, &self.config.prune_protected_tools);
        if pruned > 0 {
            guard.info.touch();
            let touched: Vec<Message> = guard.messages.clone();
            for message in &touched {
                self.storage.save_message(id, message)?;
            }
            self.storage.save_session(&guard.info)?;
        }
        Ok(pruned)
    }

    // ── Hydration ───────────────────────────────────────────────────

    /// Fetch the live state for a session, loading it from storage on first
    /// touch (restart recovery). Unknown sessions are an error — appending
    /// to a deleted session must fail the operation, not invent state.
    fn state(&self, id: &str) -> Result<Arc<Mutex<SessionState>>> {
        if let Some(state) = self.sessions.read().get(id) {
            return Ok(state.clone());
        }

        let info = self
            .storage
            .get_session(id)?
            .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
        let mut messages = self.storage.get_messages(id)?;
        let cap = self.config.message_cap;
        if cap > 0 && messages.len() > cap {
            let excess = messages.len() - cap;
            messages.drain(..excess);
        }

        let mut sessions = self.sessions.write();
        // Another thread may have hydrated while we read storage.
        Ok(sessions
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState { info, messages })))
            .clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History projection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn project_history(messages: &[Message]) -> Vec<HistoryMessage> {
    let mut history = Vec::new();
    for message in messages {
        let role = match message.role {
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
            MessageRole::Tool => Role::Tool,
            MessageRole::System => Role::System,
        };
        let mut parts = Vec::new();
        for part in &message.parts {
            match &part.kind {
                PartKind::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
                PartKind::Reasoning { .. } => {} // never sent back to the model
                PartKind::File {
                    mime,
                    url,
                    filename,
                } => parts.push(ContentPart::File {
                    url: url.clone(),
                    mime: mime.clone(),
                    filename: filename.clone(),
                }),
                PartKind::Tool {
                    call_id,
                    tool,
                    input,
                    output,
                    error,
                    ..
                } => {
                    if message.role == MessageRole::Tool {
                        parts.push(ContentPart::ToolResult {
                            tool_use_id: call_id.clone(),
                            content: error.clone().or_else(|| output.clone()).unwrap_or_default(),
                            is_error: error.is_some(),
                        });
                    } else {
                        parts.push(ContentPart::ToolUse {
                            id: call_id.clone(),
                            name: tool.clone(),
                            input: input.clone(),
                        });
                    }
                }
            }
        }
        if parts.is_empty() {
            continue;
        }
        // Collapse a lone text part into the plain-text form.
        let content = match parts.as_slice() {
            [ContentPart::Text { text }] => MessageContent::Text(text.clone()),
            _ => MessageContent::Parts(parts),
        };
        history.push(HistoryMessage { role, content });
    }
    history
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
