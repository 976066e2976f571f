//! Cancellation signals for in-flight work.
//!
//! Every running prompt turn (keyed by session ID) and background task
//! (keyed by task ID) registers a [`CancellationToken`] here. The stop
//! endpoints fire the token; the executor polls it between stream events
//! and backoff sleeps, and the task runner awaits it in its select loop.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Registry of live cancellation tokens, one per unit of running work.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token for `key`. A stale token left under the same key (a
    /// previous turn that never cleaned up) is replaced, not reused.
    pub fn register(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(key.to_owned(), token.clone());
        token
    }

    /// Fire the token registered under `key`. Returns false when nothing
    /// is currently running under that key.
    pub fn cancel(&self, key: &str) -> bool {
        match self.tokens.lock().get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget the token once its work has finished. Idempotent.
    pub fn remove(&self, key: &str) {
        self.tokens.lock().remove(key);
    }
}
