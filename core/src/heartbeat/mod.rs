//! Heartbeat coordinator: a coalescing wake handler plus an interval
//! scheduler that decides, per agent, whether a heartbeat should run.

pub mod config;
pub mod gate;

pub use config::{ActiveHours, HeartbeatConfig};

use crate::util::now_ms;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Sent,
    OkEmpty,
    OkToken,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Ok,
    Alert,
    Error,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    pub status: HeartbeatStatus,
    pub indicator: Indicator,
    pub skip_reason: Option<String>,
}

impl HeartbeatOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: HeartbeatStatus::Skipped,
            indicator: Indicator::None,
            skip_reason: Some(reason.into()),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: HeartbeatStatus::Failed,
            indicator: Indicator::Error,
            skip_reason: None,
        }
    }
}

/// Invoked once a coalesced wake request resolves to an actual attempt. The
/// handler performs the gate sequence and, if all gates pass, dispatches a
/// turn through the agent executor facade.
#[async_trait]
pub trait HeartbeatHandler: Send + Sync {
    async fn handle(&self, reason: &str) -> HeartbeatOutcome;
}

#[derive(Debug, Clone)]
pub struct HeartbeatAgentState {
    pub agent_id: String,
    pub interval_ms: i64,
    pub last_run_ms: Option<i64>,
    pub next_due_ms: i64,
    pub config: HeartbeatConfig,
}

struct WakeState {
    pending_reason: Option<String>,
    running: bool,
}

const INTERVAL_CLAMP_MS: u64 = 60_000;

pub struct HeartbeatCoordinator {
    agents: Mutex<HashMap<String, HeartbeatAgentState>>,
    wake: Mutex<WakeState>,
    handler: Arc<dyn HeartbeatHandler>,
    global_enabled: AtomicBool,
}

impl HeartbeatCoordinator {
    pub fn new(handler: Arc<dyn HeartbeatHandler>) -> Arc<Self> {
        Arc::new(Self {
            agents: Mutex::new(HashMap::new()),
            wake: Mutex::new(WakeState {
                pending_reason: None,
                running: false,
            }),
            handler,
            global_enabled: AtomicBool::new(true),
        })
    }

    /// Construct a coordinator whose handler needs a back-reference to it
    /// (e.g. to read `agent_state`/`mark_ran`), without the chicken-and-egg
    /// problem of needing the `Arc` before it exists.
    pub fn new_with_handler<F>(build_handler: F) -> Arc<Self>
    where
        F: FnOnce(std::sync::Weak<Self>) -> Arc<dyn HeartbeatHandler>,
    {
        Arc::new_cyclic(|weak| Self {
            agents: Mutex::new(HashMap::new()),
            wake: Mutex::new(WakeState {
                pending_reason: None,
                running: false,
            }),
            handler: build_handler(weak.clone()),
            global_enabled: AtomicBool::new(true),
        })
    }

    /// First gate of the handler's gate sequence: a process-wide kill
    /// switch that short-circuits every agent regardless of its own
    /// config.
    pub fn is_globally_enabled(&self) -> bool {
        self.global_enabled.load(Ordering::SeqCst)
    }

    pub fn set_global_enabled(&self, enabled: bool) {
        self.global_enabled.store(enabled, Ordering::SeqCst);
    }

    pub async fn register_agent(&self, agent_id: &str, config: HeartbeatConfig) {
        let now = now_ms();
        let mut agents = self.agents.lock().await;
        agents.insert(
            agent_id.to_string(),
            HeartbeatAgentState {
                agent_id: agent_id.to_string(),
                interval_ms: config.every_ms,
                last_run_ms: None,
                next_due_ms: now + config.every_ms.max(0),
                config,
            },
        );
    }

    pub async fn unregister_agent(&self, agent_id: &str) {
        self.agents.lock().await.remove(agent_id);
    }

    pub async fn mark_ran(&self, agent_id: &str, ran_at_ms: i64) {
        let mut agents = self.agents.lock().await;
        if let Some(state) = agents.get_mut(agent_id) {
            state.last_run_ms = Some(ran_at_ms);
            state.next_due_ms = ran_at_ms + state.interval_ms.max(0);
        }
    }

    /// Records the reason (an existing pending reason wins) and arms a
    /// coalescing timer for `coalesce_ms`.
    pub async fn request_heartbeat_now(self: &Arc<Self>, reason: &str, coalesce_ms: u64) {
        {
            let mut wake = self.wake.lock().await;
            if wake.pending_reason.is_none() {
                wake.pending_reason = Some(reason.to_string());
            }
        }
        self.arm(coalesce_ms);
    }

    fn arm(self: &Arc<Self>, delay_ms: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            this.attempt(delay_ms.max(250)).await;
        });
    }

    async fn attempt(self: Arc<Self>, coalesce_ms: u64) {
        let reason = {
            let mut wake = self.wake.lock().await;
            if wake.running {
                None
            } else {
                wake.pending_reason.take().map(|r| {
                    wake.running = true;
                    r
                })
            }
        };

        let reason = match reason {
            Some(r) => r,
            None => {
                if self.wake.lock().await.running {
                    self.arm(coalesce_ms);
                }
                return;
            }
        };

        let outcome = self.handler.handle(&reason).await;

        let rearm_delay = {
            let mut wake = self.wake.lock().await;
            wake.running = false;
            if wake.pending_reason.is_some() {
                Some(0)
            } else if outcome.status == HeartbeatStatus::Skipped
                && outcome.skip_reason.as_deref() == Some("requests-in-flight")
            {
                wake.pending_reason = Some(reason.clone());
                Some(1_000)
            } else if outcome.status == HeartbeatStatus::Failed {
                wake.pending_reason = Some("retry".to_string());
                Some(1_000)
            } else {
                None
            }
        };

        if let Some(delay) = rearm_delay {
            self.arm(delay);
        }
    }

    /// Spawn the interval scheduler's timer loop: armed for
    /// `min(nextDueMs)` across enabled agents, clamped to 60 seconds.
    pub fn spawn_interval_timer(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = this.next_timer_delay_ms().await;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                this.request_heartbeat_now("interval", 0).await;
            }
        });
    }

    async fn next_timer_delay_ms(&self) -> u64 {
        let agents = self.agents.lock().await;
        let now = now_ms();
        let min_due = agents
            .values()
            .filter(|a| a.config.enabled)
            .map(|a| a.next_due_ms)
            .min();
        match min_due {
            Some(due) => ((due - now).max(0) as u64).min(INTERVAL_CLAMP_MS),
            None => INTERVAL_CLAMP_MS,
        }
    }

    pub async fn agent_state(&self, agent_id: &str) -> Option<HeartbeatAgentState> {
        self.agents.lock().await.get(agent_id).cloned()
    }

    /// Invoke the handler directly, bypassing coalescing. Used by tests and
    /// by callers that want a synchronous "run now" without the wake timer.
    pub async fn handle_directly(&self, reason: &str) -> HeartbeatOutcome {
        self.handler.handle(reason).await
    }

    pub async fn due_agents(&self) -> Vec<String> {
        let agents = self.agents.lock().await;
        let now = now_ms();
        agents
            .values()
            .filter(|a| a.config.enabled && a.next_due_ms <= now)
            .map(|a| a.agent_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        outcome: HeartbeatOutcome,
    }

    #[async_trait]
    impl HeartbeatHandler for CountingHandler {
        async fn handle(&self, _reason: &str) -> HeartbeatOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    #[tokio::test]
    async fn coalesces_rapid_requests_into_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler {
            calls: calls.clone(),
            outcome: HeartbeatOutcome {
                status: HeartbeatStatus::OkEmpty,
                indicator: Indicator::Ok,
                skip_reason: None,
            },
        });
        let coordinator = HeartbeatCoordinator::new(handler);

        for _ in 0..5 {
            coordinator.request_heartbeat_now("exec-complete", 20).await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn register_and_mark_ran_updates_next_due() {
        let handler = Arc::new(CountingHandler {
            calls: Arc::new(AtomicUsize::new(0)),
            outcome: HeartbeatOutcome {
                status: HeartbeatStatus::OkEmpty,
                indicator: Indicator::Ok,
                skip_reason: None,
            },
        });
        let coordinator = HeartbeatCoordinator::new(handler);
        let config = HeartbeatConfig {
            enabled: true,
            every_ms: 10_000,
            prompt: None,
            target: None,
            model: None,
            ack_max_chars: None,
            include_reasoning: false,
            active_hours: None,
            show_alerts: false,
            show_ok: true,
            use_indicator: false,
        };
        coordinator.register_agent("asst1", config).await;
        let before = coordinator.agent_state("asst1").await.unwrap();

        let ran_at = before.next_due_ms + 1;
        coordinator.mark_ran("asst1", ran_at).await;
        let after = coordinator.agent_state("asst1").await.unwrap();
        assert_eq!(after.next_due_ms, ran_at + 10_000);
    }
}
