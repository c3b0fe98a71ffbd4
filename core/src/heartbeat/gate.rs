//! Default heartbeat handler: the gate sequence, prompt selection, and
//! duplicate-suppression digest described for the coordinator.

use super::{HeartbeatAgentState, HeartbeatCoordinator, HeartbeatOutcome, HeartbeatStatus, Indicator};
use crate::events::EventQueue;
use crate::facade::{AgentExecutor, RunRequest};
use crate::lanes::LaneDispatcher;
use crate::session::{SessionKey, SessionStore};
use crate::util::{format_hms, now_ms};
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const DIGEST_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
const MAIN_LANE: &str = "main";

/// Resolves the agent's standard/cron/exec-event prompt text and the
/// delivery target; supplied by the caller since both depend on
/// configuration this crate does not own.
#[async_trait]
pub trait HeartbeatContentSource: Send + Sync {
    async fn standard_prompt(&self, agent_id: &str) -> Option<String>;
    async fn has_heartbeat_md(&self, agent_id: &str) -> bool;
    async fn resolve_delivery_target(&self, agent_id: &str) -> Option<String>;
    fn session_key_for(&self, agent_id: &str) -> SessionKey;
}

pub struct DefaultHeartbeatHandler {
    coordinator: std::sync::Weak<HeartbeatCoordinator>,
    agent_id: String,
    events: Arc<EventQueue>,
    lanes: Arc<LaneDispatcher>,
    sessions: Arc<SessionStore>,
    executor: Arc<dyn AgentExecutor>,
    content: Arc<dyn HeartbeatContentSource>,
    digests: Mutex<HashMap<String, (String, i64)>>,
}

impl DefaultHeartbeatHandler {
    pub fn new(
        coordinator: std::sync::Weak<HeartbeatCoordinator>,
        agent_id: impl Into<String>,
        events: Arc<EventQueue>,
        lanes: Arc<LaneDispatcher>,
        sessions: Arc<SessionStore>,
        executor: Arc<dyn AgentExecutor>,
        content: Arc<dyn HeartbeatContentSource>,
    ) -> Self {
        Self {
            coordinator,
            agent_id: agent_id.into(),
            events,
            lanes,
            sessions,
            executor,
            content,
            digests: Mutex::new(HashMap::new()),
        }
    }

    fn within_active_hours(&self, state: &HeartbeatAgentState) -> bool {
        let Some(hours) = &state.config.active_hours else {
            return true;
        };
        let tz: Tz = match hours.timezone.parse() {
            Ok(tz) => tz,
            Err(_) => return true,
        };
        let now_local = Utc::now().with_timezone(&tz);
        use chrono::Timelike;
        let minute_of_day = (now_local.hour() * 60 + now_local.minute()) as u16;
        hours.contains(minute_of_day)
    }

    async fn digest_is_duplicate(&self, target: &str, text: &str) -> bool {
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        let mut digests = self.digests.lock().await;
        let key = format!("{}:{target}", self.agent_id);
        if let Some((existing, ts)) = digests.get(&key) {
            if existing == &digest && now_ms() - ts < DIGEST_WINDOW_MS {
                return true;
            }
        }
        digests.insert(key, (digest, now_ms()));
        false
    }
}

#[async_trait]
impl super::HeartbeatHandler for DefaultHeartbeatHandler {
    async fn handle(&self, reason: &str) -> HeartbeatOutcome {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return HeartbeatOutcome::skipped("coordinator-gone");
        };

        let Some(state) = coordinator.agent_state(&self.agent_id).await else {
            return HeartbeatOutcome::skipped("agent-not-registered");
        };

        if !coordinator.is_globally_enabled() {
            return HeartbeatOutcome::skipped("globally-disabled");
        }
        if !state.config.enabled {
            return HeartbeatOutcome::skipped("disabled");
        }
        if state.interval_ms <= 0 {
            return HeartbeatOutcome::skipped("invalid-interval");
        }
        if !self.within_active_hours(&state) {
            return HeartbeatOutcome::skipped("outside-active-hours");
        }
        if self.lanes.queue_size(MAIN_LANE).await != 0 {
            return HeartbeatOutcome::skipped("requests-in-flight");
        }

        let session_key = self.content.session_key_for(&self.agent_id);
        let has_events = !self.events.is_empty(&session_key).await;
        let has_md = self.content.has_heartbeat_md(&self.agent_id).await;
        if !has_events && !has_md {
            return HeartbeatOutcome::skipped("nothing-to-process");
        }

        let Some(target) = self.content.resolve_delivery_target(&self.agent_id).await else {
            return HeartbeatOutcome::skipped("no-delivery-target");
        };

        if !state.config.visibility_permits_sending() {
            return HeartbeatOutcome::skipped("visibility-disabled");
        }

        let drained = self.events.drain(&session_key).await;
        let prompt = if let Some(event) = drained.iter().find(|e| e.text.starts_with("cron:")) {
            format!("System: [{}] {}", format_hms(event.ts), event.text)
        } else if let Some(event) = drained.first() {
            format!("System: [{}] {}", format_hms(event.ts), event.text)
        } else {
            self.content
                .standard_prompt(&self.agent_id)
                .await
                .unwrap_or_else(|| "heartbeat".to_string())
        };

        if self.digest_is_duplicate(&target, &prompt).await {
            return HeartbeatOutcome::skipped("duplicate-suppressed");
        }

        let session_entry = match self.sessions.clone().upsert_async(session_key.clone(), |_| {}).await {
            Ok(entry) => entry,
            Err(_) => return HeartbeatOutcome::failed(),
        };

        let run_result = self
            .executor
            .run(
                RunRequest {
                    session_id: session_entry.session_id,
                    session_key: session_key.as_str().to_string(),
                    prompt,
                    think_level: None,
                    timeout_ms: 120_000,
                },
                None,
            )
            .await;

        coordinator.mark_ran(&self.agent_id, now_ms()).await;

        match run_result {
            Ok(result) if result.text.trim().is_empty() => HeartbeatOutcome {
                status: HeartbeatStatus::OkEmpty,
                indicator: Indicator::Ok,
                skip_reason: None,
            },
            Ok(_) => HeartbeatOutcome {
                status: HeartbeatStatus::Sent,
                indicator: Indicator::Ok,
                skip_reason: None,
            },
            Err(_) => HeartbeatOutcome::failed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::StubAgentExecutor;
    use crate::heartbeat::HeartbeatConfig;
    use tempfile::TempDir;

    struct StaticContent;

    #[async_trait]
    impl HeartbeatContentSource for StaticContent {
        async fn standard_prompt(&self, _agent_id: &str) -> Option<String> {
            Some("standard heartbeat".into())
        }
        async fn has_heartbeat_md(&self, _agent_id: &str) -> bool {
            true
        }
        async fn resolve_delivery_target(&self, _agent_id: &str) -> Option<String> {
            Some("last".into())
        }
        fn session_key_for(&self, agent_id: &str) -> SessionKey {
            SessionKey::parse(&format!("agent:{agent_id}:main")).unwrap()
        }
    }

    #[tokio::test]
    async fn skips_when_disabled() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let lanes = Arc::new(LaneDispatcher::new());
        let events = Arc::new(EventQueue::new());
        let executor: Arc<dyn AgentExecutor> = Arc::new(StubAgentExecutor);
        let content: Arc<dyn HeartbeatContentSource> = Arc::new(StaticContent);

        let coordinator = HeartbeatCoordinator::new_with_handler(move |weak| {
            Arc::new(DefaultHeartbeatHandler::new(
                weak, "asst1", events, lanes, sessions, executor, content,
            ))
        });

        coordinator
            .register_agent(
                "asst1",
                HeartbeatConfig {
                    enabled: false,
                    every_ms: 10_000,
                    prompt: None,
                    target: None,
                    model: None,
                    ack_max_chars: None,
                    include_reasoning: false,
                    active_hours: None,
                    show_alerts: true,
                    show_ok: true,
                    use_indicator: false,
                },
            )
            .await;

        let outcome = coordinator.handle_directly("test").await;
        assert_eq!(outcome.status, HeartbeatStatus::Skipped);
        assert_eq!(outcome.skip_reason.as_deref(), Some("disabled"));
    }

    #[tokio::test]
    async fn skips_when_globally_disabled_even_if_agent_enabled() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let lanes = Arc::new(LaneDispatcher::new());
        let events = Arc::new(EventQueue::new());
        let executor: Arc<dyn AgentExecutor> = Arc::new(StubAgentExecutor);
        let content: Arc<dyn HeartbeatContentSource> = Arc::new(StaticContent);

        let coordinator = HeartbeatCoordinator::new_with_handler(move |weak| {
            Arc::new(DefaultHeartbeatHandler::new(
                weak, "asst1", events, lanes, sessions, executor, content,
            ))
        });

        coordinator
            .register_agent(
                "asst1",
                HeartbeatConfig {
                    enabled: true,
                    every_ms: 10_000,
                    prompt: None,
                    target: None,
                    model: None,
                    ack_max_chars: None,
                    include_reasoning: false,
                    active_hours: None,
                    show_alerts: true,
                    show_ok: true,
                    use_indicator: false,
                },
            )
            .await;
        coordinator.set_global_enabled(false);

        let outcome = coordinator.handle_directly("test").await;
        assert_eq!(outcome.status, HeartbeatStatus::Skipped);
        assert_eq!(outcome.skip_reason.as_deref(), Some("globally-disabled"));
    }
}
