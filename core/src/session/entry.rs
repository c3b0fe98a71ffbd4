//! Session entry record and its nested value types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
    Channel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionHost {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityMode {
    Trusted,
    Sandboxed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    Debounce,
    Immediate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub mode: QueueMode,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub cap: Option<usize>,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            mode: QueueMode::Immediate,
            debounce_ms: None,
            cap: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCounters {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub compactions: u64,
}

impl TokenCounters {
    pub fn record_turn(&mut self, input: u64, output: u64) {
        self.input += input;
        self.output += output;
        self.total += input + output;
    }

    pub fn record_compaction(&mut self) {
        self.compactions += 1;
    }
}

/// Record stored under a session key. `sessionId` is immutable once
/// assigned; `updatedAt` only moves forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: Uuid,
    pub updated_at_ms: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<ChatType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default)]
    pub last_delivery: DeliveryRoute,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_host: Option<ExecutionHost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_mode: Option<SecurityMode>,

    #[serde(default)]
    pub queue_policy: QueuePolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_tag: Option<String>,

    #[serde(default)]
    pub tokens: TokenCounters,
}

impl SessionEntry {
    pub fn new(now_ms: i64) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            updated_at_ms: now_ms,
            transcript_path: None,
            chat_type: None,
            channel: None,
            group_id: None,
            subject: None,
            last_delivery: DeliveryRoute::default(),
            model_override: None,
            provider_override: None,
            thinking_level: None,
            execution_host: None,
            security_mode: None,
            queue_policy: QueuePolicy::default(),
            display_label: None,
            origin_tag: None,
            tokens: TokenCounters::default(),
        }
    }

    /// Bump `updatedAt`, refusing to move it backward.
    pub fn touch(&mut self, now_ms: i64) {
        if now_ms > self.updated_at_ms {
            self.updated_at_ms = now_ms;
        }
    }
}
