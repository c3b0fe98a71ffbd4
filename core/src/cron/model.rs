//! The persistent cron job record and its nested types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    At {
        at_ms: i64,
    },
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    Main,
    Isolated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    Now,
    NextHeartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Payload {
    SystemEvent {
        text: String,
    },
    AgentTurn {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Announce,
    None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryChannel {
    Last,
    Named,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub mode: DeliveryMode,
    #[serde(default)]
    pub channel: Option<DeliveryChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub best_effort: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LastStatus {
    Ok,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<LastStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
    #[serde(default)]
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: JobId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub delete_after_run: bool,
    pub schedule: Schedule,
    pub session_target: SessionTarget,
    pub wake_mode: WakeMode,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<Delivery>,
    #[serde(default)]
    pub state: JobState,
}

fn default_true() -> bool {
    true
}

impl CronJob {
    pub fn new(
        name: impl Into<String>,
        schedule: Schedule,
        session_target: SessionTarget,
        wake_mode: WakeMode,
        payload: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            enabled: true,
            delete_after_run: false,
            schedule,
            session_target,
            wake_mode,
            payload,
            delivery: None,
            state: JobState::default(),
        }
    }

    /// A `runningAtMs` older than 2 hours is treated as stuck.
    pub fn is_stuck(&self, now_ms: i64) -> bool {
        self.state
            .running_at_ms
            .map(|started| now_ms - started > 2 * 60 * 60 * 1000)
            .unwrap_or(false)
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.enabled
            && self.state.running_at_ms.is_none()
            && self
                .state
                .next_run_at_ms
                .map(|t| t <= now_ms)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

fn default_version() -> u32 {
    1
}

/// Observable transitions for a job's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Added,
    Updated,
    Removed,
    Started,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub action: JobAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_detection() {
        let mut job = CronJob::new(
            "x",
            Schedule::Every {
                every_ms: 60_000,
                anchor_ms: None,
            },
            SessionTarget::Main,
            WakeMode::Now,
            Payload::SystemEvent { text: "hi".into() },
        );
        job.state.running_at_ms = Some(0);
        assert!(job.is_stuck(3 * 60 * 60 * 1000));
        assert!(!job.is_stuck(60_000));
    }

    #[test]
    fn due_requires_enabled_and_not_running() {
        let mut job = CronJob::new(
            "x",
            Schedule::At { at_ms: 1_000 },
            SessionTarget::Main,
            WakeMode::Now,
            Payload::SystemEvent { text: "hi".into() },
        );
        job.state.next_run_at_ms = Some(1_000);
        assert!(job.is_due(2_000));

        job.state.running_at_ms = Some(1_500);
        assert!(!job.is_due(2_000));
        job.state.running_at_ms = None;

        job.enabled = false;
        assert!(!job.is_due(2_000));
    }
}
