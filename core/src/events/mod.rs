//! In-memory, per-session system-event queue.
//!
//! Events land here from the cron scheduler and external triggers and are
//! drained by the heartbeat coordinator before each agent turn.

use crate::session::SessionKey;
use crate::util::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

const QUEUE_CAP: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemEvent {
    pub text: String,
    pub ts: i64,
}

#[derive(Default)]
struct SessionQueue {
    queue: Vec<SystemEvent>,
    last_text: Option<String>,
    last_context_key: Option<String>,
}

/// Per-session bounded queue with consecutive-duplicate suppression.
pub struct EventQueue {
    sessions: Mutex<HashMap<String, SessionQueue>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Trim `text`; drop if empty or identical to the last enqueued text for
    /// this key; append `{text, ts=now}`; evict the oldest entry if over cap.
    pub async fn enqueue(&self, key: &SessionKey, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return false;
        }

        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(key.as_str().to_string()).or_default();

        if session.last_text.as_deref() == Some(trimmed) {
            return false;
        }

        session.queue.push(SystemEvent {
            text: trimmed.to_string(),
            ts: now_ms(),
        });
        if session.queue.len() > QUEUE_CAP {
            session.queue.remove(0);
        }
        session.last_text = Some(trimmed.to_string());
        true
    }

    /// Return and remove all queued events for `key`; clears `lastText`.
    pub async fn drain(&self, key: &SessionKey) -> Vec<SystemEvent> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(key.as_str()) {
            Some(session) => {
                session.last_text = None;
                std::mem::take(&mut session.queue)
            }
            None => Vec::new(),
        }
    }

    /// Inspect without removing.
    pub async fn peek(&self, key: &SessionKey) -> Vec<SystemEvent> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(key.as_str())
            .map(|s| s.queue.clone())
            .unwrap_or_default()
    }

    pub async fn len(&self, key: &SessionKey) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.get(key.as_str()).map(|s| s.queue.len()).unwrap_or(0)
    }

    pub async fn is_empty(&self, key: &SessionKey) -> bool {
        self.len(key).await == 0
    }

    pub async fn set_last_context_key(&self, key: &SessionKey, context_key: Option<String>) {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(key.as_str().to_string()).or_default().last_context_key = context_key;
    }

    pub async fn last_context_key(&self, key: &SessionKey) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions.get(key.as_str()).and_then(|s| s.last_context_key.clone())
    }
}
