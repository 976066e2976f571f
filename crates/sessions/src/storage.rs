//! Durable session/message storage.
//!
//! [`Storage`] is a capability, not a class hierarchy: the manager works
//! against either the in-memory variant (tests, ephemeral runs) or the disk
//! variant, selected at startup.
//!
//! Disk layout: `sessions/<id>.json` and `messages/<sessionID>/<msgID>.json`.
//! Every write goes through a temp file plus atomic rename so partial writes
//! are never observable. Writes are applied by a background thread — the
//! caller sees the mutation immediately and durability is best-effort;
//! `flush()` drains the queue and surfaces the most recent write error.
//! A malformed JSON file on read is skipped with a logged warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use sb_domain::error::{Error, Result};

use crate::message::Message;
use crate::session::SessionInfo;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage capability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub trait Storage: Send + Sync {
    fn save_session(&self, info: &SessionInfo) -> Result<()>;
    fn get_session(&self, id: &str) -> Result<Option<SessionInfo>>;
    /// All sessions ordered by `updated` descending.
    fn list_sessions(&self) -> Result<Vec<SessionInfo>>;
    /// Delete a session record and all of its messages.
    fn delete_session(&self, id: &str) -> Result<()>;

    fn save_message(&self, session_id: &str, message: &Message) -> Result<()>;
    fn get_message(&self, session_id: &str, message_id: &str) -> Result<Option<Message>>;
    /// All messages for a session ordered by timestamp ascending.
    fn get_messages(&self, session_id: &str) -> Result<Vec<Message>>;
    fn delete_messages(&self, session_id: &str) -> Result<()>;

    /// Block until all queued writes are durable. Surfaces the most recent
    /// background write error, if any.
    fn flush(&self) -> Result<()>;
    /// Drop everything.
    fn clear(&self) -> Result<()>;
}

fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryStorage {
    sessions: RwLock<HashMap<String, SessionInfo>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn save_session(&self, info: &SessionInfo) -> Result<()> {
        self.sessions
            .write()
            .insert(info.id.clone(), info.clone());
        Ok(())
    }

    fn get_session(&self, id: &str) -> Result<Option<SessionInfo>> {
        Ok(self.sessions.read().get(id).cloned())
    }

    fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| b.updated.cmp(&a.updated));
        Ok(sessions)
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        self.sessions.write().remove(id);
        self.messages.write().remove(id);
        Ok(())
    }

    fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut messages = self.messages.write();
        let list = messages.entry(session_id.to_owned()).or_default();
        match list.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => list.push(message.clone()),
        }
        Ok(())
    }

    fn get_message(&self, session_id: &str, message_id: &str) -> Result<Option<Message>> {
        Ok(self
            .messages
            .read()
            .get(session_id)
            .and_then(|list| list.iter().find(|m| m.id == message_id).cloned()))
    }

    fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let mut list = self
            .messages
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        sort_messages(&mut list);
        Ok(list)
    }

    fn delete_messages(&self, session_id: &str) -> Result<()> {
        self.messages.write().remove(session_id);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.sessions.write().clear();
        self.messages.write().clear();
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Disk storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum WriteOp {
    Write { path: PathBuf, json: String },
    RemoveFile { path: PathBuf },
    RemoveDir { path: PathBuf },
    Flush { ack: mpsc::SyncSender<()> },
}

pub struct DiskStorage {
    root: PathBuf,
    queue: Mutex<mpsc::Sender<WriteOp>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("sessions")).map_err(Error::Io)?;
        std::fs::create_dir_all(root.join("messages")).map_err(Error::Io)?;

        let (tx, rx) = mpsc::channel::<WriteOp>();
        let last_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let writer_error = last_error.clone();

        std::thread::Builder::new()
            .name("sb-storage-writer".into())
            .spawn(move || {
                for op in rx {
                    if let Err(e) = apply(op) {
                        tracing::warn!(error = %e, "storage write failed");
                        *writer_error.lock() = Some(e.to_string());
                    }
                }
            })
            .map_err(Error::Io)?;

        tracing::info!(path = %root.display(), "disk storage ready");

        Ok(Self {
            root,
            queue: Mutex::new(tx),
            last_error,
        })
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{id}.json"))
    }

    fn message_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("messages").join(session_id)
    }

    fn message_path(&self, session_id: &str, message_id: &str) -> PathBuf {
        self.message_dir(session_id).join(format!("{message_id}.json"))
    }

    fn enqueue(&self, op: WriteOp) -> Result<()> {
        self.queue
            .lock()
            .send(op)
            .map_err(|_| Error::Storage("storage writer has shut down".into()))
    }
}

/// Execute a queued write. `Flush` acks are sent even when a previous write
/// failed — the error is surfaced separately.
fn apply(op: WriteOp) -> Result<()> {
    match op {
        WriteOp::Write { path, json } => write_atomic(&path, json.as_bytes()),
        WriteOp::RemoveFile { path } => {
            if path.exists() {
                std::fs::remove_file(&path).map_err(Error::Io)?;
            }
            Ok(())
        }
        WriteOp::RemoveDir { path } => {
            if path.exists() {
                std::fs::remove_dir_all(&path).map_err(Error::Io)?;
            }
            Ok(())
        }
        WriteOp::Flush { ack } => {
            let _ = ack.send(());
            Ok(())
        }
    }
}

/// Write via a temp file in the same directory plus atomic rename, so a
/// crash mid-write never leaves a partial record.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(Error::Io)?;
    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}

/// Parse one JSON record, skipping (with a warning) anything malformed.
fn read_record<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "unreadable record skipped");
            }
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed record skipped");
            None
        }
    }
}

impl Storage for DiskStorage {
    fn save_session(&self, info: &SessionInfo) -> Result<()> {
        let json = serde_json::to_string_pretty(info).map_err(Error::Json)?;
        self.enqueue(WriteOp::Write {
            path: self.session_path(&info.id),
            json,
        })
    }

    fn get_session(&self, id: &str) -> Result<Option<SessionInfo>> {
        Ok(read_record(&self.session_path(id)))
    }

    fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let dir = self.root.join("sessions");
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(info) = read_record::<SessionInfo>(&entry.path()) {
                sessions.push(info);
            }
        }
        sessions.sort_by(|a, b| b.updated.cmp(&a.updated));
        Ok(sessions)
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        self.enqueue(WriteOp::RemoveFile {
            path: self.session_path(id),
        })?;
        self.enqueue(WriteOp::RemoveDir {
            path: self.message_dir(id),
        })
    }

    fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let json = serde_json::to_string(message).map_err(Error::Json)?;
        self.enqueue(WriteOp::Write {
            path: self.message_path(session_id, &message.id),
            json,
        })
    }

    fn get_message(&self, session_id: &str, message_id: &str) -> Result<Option<Message>> {
        Ok(read_record(&self.message_path(session_id, message_id)))
    }

    fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let dir = self.message_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut messages = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(message) = read_record::<Message>(&entry.path()) {
                messages.push(message);
            }
        }
        sort_messages(&mut messages);
        Ok(messages)
    }

    fn delete_messages(&self, session_id: &str) -> Result<()> {
        self.enqueue(WriteOp::RemoveDir {
            path: self.message_dir(session_id),
        })
    }

    fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.enqueue(WriteOp::Flush { ack: ack_tx })?;
        ack_rx
            .recv_timeout(std::time::Duration::from_secs(30))
            .map_err(|_| Error::Storage("flush timed out".into()))?;
        match self.last_error.lock().take() {
            Some(e) => Err(Error::Storage(e)),
            None => Ok(()),
        }
    }

    fn clear(&self) -> Result<()> {
        self.flush()?;
        for sub in ["sessions", "messages"] {
            let dir = self.root.join(sub);
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(Error::Io)?;
            }
            std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
