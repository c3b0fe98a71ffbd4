//! Agent Executor Facade: the narrow interface the core calls through for
//! model invocation and context compaction. The implementation (LLM
//! provider selection, tool execution, prompt assembly) lives outside this
//! crate; this module only defines the contract and a test double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnBlock {
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_id: Uuid,
    pub session_key: String,
    pub prompt: String,
    pub think_level: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub text: String,
    pub blocks: Vec<TurnBlock>,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

/// Callback hooks a caller may supply to observe a turn as it streams.
/// Implemented as plain trait objects rather than generic closures so the
/// facade trait itself stays object-safe.
pub trait TurnObserver: Send + Sync {
    fn on_partial(&self, _text: &str) {}
    fn on_tool(&self, _name: &str, _input: &str) {}
    fn on_reasoning(&self, _text: &str) {}
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        observer: Option<&(dyn TurnObserver)>,
    ) -> crate::error::Result<RunResult>;

    async fn compact(&self, session_id: Uuid, min_reserve_tokens: u64) -> crate::error::Result<()>;

    async fn is_busy(&self, session_id: Uuid) -> bool;

    async fn enqueue_follow_up(&self, session_id: Uuid, text: &str) -> bool;

    async fn wait_for_idle(&self, session_id: Uuid, timeout_ms: u64) -> bool;
}

/// Deterministic stand-in used by tests and by `openclaw run` until a real
/// executor is wired in.
pub struct StubAgentExecutor;

#[async_trait]
impl AgentExecutor for StubAgentExecutor {
    async fn run(
        &self,
        request: RunRequest,
        _observer: Option<&(dyn TurnObserver)>,
    ) -> crate::error::Result<RunResult> {
        Ok(RunResult {
            text: format!("[stub reply to: {}]", request.prompt),
            blocks: Vec::new(),
            usage: Usage::default(),
            stop_reason: StopReason::EndTurn,
        })
    }

    async fn compact(&self, _session_id: Uuid, _min_reserve_tokens: u64) -> crate::error::Result<()> {
        Ok(())
    }

    async fn is_busy(&self, _session_id: Uuid) -> bool {
        false
    }

    async fn enqueue_follow_up(&self, _session_id: Uuid, _text: &str) -> bool {
        true
    }

    async fn wait_for_idle(&self, _session_id: Uuid, _timeout_ms: u64) -> bool {
        true
    }
}
