//! Heartbeat content source backed by the state directory's `HEARTBEAT.md`
//! file and the session store's last-delivery routing fields.

use async_trait::async_trait;
use openclaw_core::session::{SessionKey, SessionStore};
use openclaw_core::heartbeat::gate::HeartbeatContentSource;
use std::path::PathBuf;
use std::sync::Arc;

pub struct FileHeartbeatContentSource {
    state_dir: PathBuf,
    sessions: Arc<SessionStore>,
    main_session_key: SessionKey,
}

impl FileHeartbeatContentSource {
    pub fn new(state_dir: PathBuf, sessions: Arc<SessionStore>, agent_id: &str) -> Self {
        Self {
            state_dir,
            sessions,
            main_session_key: SessionKey::from_parts(&["agent", agent_id, "main"]),
        }
    }

    fn heartbeat_md_path(&self) -> PathBuf {
        self.state_dir.join("HEARTBEAT.md")
    }
}

#[async_trait]
impl HeartbeatContentSource for FileHeartbeatContentSource {
    async fn standard_prompt(&self, _agent_id: &str) -> Option<String> {
        std::fs::read_to_string(self.heartbeat_md_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    async fn has_heartbeat_md(&self, _agent_id: &str) -> bool {
        std::fs::metadata(self.heartbeat_md_path())
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    async fn resolve_delivery_target(&self, _agent_id: &str) -> Option<String> {
        let doc = self.sessions.load().ok()?;
        let entry = doc.entries.get(self.main_session_key.as_str())?;
        entry
            .last_delivery
            .channel
            .clone()
            .or_else(|| entry.last_delivery.recipient.clone())
    }

    fn session_key_for(&self, agent_id: &str) -> SessionKey {
        SessionKey::from_parts(&["agent", agent_id, "main"])
    }
}
