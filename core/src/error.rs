//! Structured error types for the openclaw core.
//!
//! Provides a single error enum used across every subsystem, a mapping to
//! the wire-facing `error.code` taxonomy the gateway speaks, and retry
//! classification used by the cron scheduler and heartbeat coordinator.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for openclaw-core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    // -- Gateway / protocol errors --------------------------------------
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("unauthorized role: {role} cannot invoke {method}")]
    UnauthorizedRole { role: String, method: String },

    #[error("missing scope: {method} requires {required}")]
    MissingScope { method: String, required: String },

    #[error("unsupported protocol version: client supports {client_min}..={client_max}")]
    ProtocolVersion { client_min: u32, client_max: u32 },

    #[error("payload too large: {size} bytes exceeds {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("rate limited")]
    RateLimited,

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("context window exceeded. Max: {max_tokens}, Used: {used_tokens}")]
    ContextOverflow { max_tokens: usize, used_tokens: usize },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    // -- Core-specific errors --------------------------------------------
    #[error("lock timeout acquiring {path:?} after {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("corrupt store: {path:?} ({reason})")]
    CorruptStore { path: PathBuf, reason: String },

    // -- Facade-surfaced provider errors (§4.H) --------------------------
    #[error("auth error: {message}")]
    AuthError { message: String },

    #[error("billing error: {message}")]
    BillingError { message: String },

    // -- Internal / infrastructure ---------------------------------------
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl CoreError {
    /// Wire-facing `error.code` used by the gateway.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid-request",
            Self::UnknownMethod { .. } => "unknown-method",
            Self::Unauthorized { .. } | Self::AuthError { .. } => "unauthorized",
            Self::UnauthorizedRole { .. } => "unauthorized-role",
            Self::MissingScope { .. } => "missing-scope",
            Self::ProtocolVersion { .. } => "protocol-version",
            Self::PayloadTooLarge { .. } => "payload-too-large",
            Self::RateLimited | Self::BillingError { .. } => "rate-limited",
            Self::Timeout { .. } => "timeout",
            Self::ContextOverflow { .. } => "context-overflow",
            Self::NotFound { .. } => "not-found",
            Self::Conflict { .. } => "conflict",
            Self::LockTimeout { .. } => "lock-timeout",
            Self::CorruptStore { .. } => "corrupt-store",
            Self::Internal { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::TomlParse(_)
            | Self::TomlSerialize(_) => "internal",
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RateLimited | Self::LockTimeout { .. }
        ) || matches!(
            self,
            Self::Io(io_err) if matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            )
        )
    }

    /// Suggested retry delay for retryable errors.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited => Some(Duration::from_secs(5)),
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::LockTimeout { .. } => Some(Duration::from_millis(500)),
            _ => None,
        }
    }

    /// Human-readable message suitable for display to a user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Unauthorized { .. } | Self::AuthError { .. } => {
                "Authentication failed. Please check your credentials.".to_string()
            }
            Self::ContextOverflow { .. } => {
                "The conversation is too long. Please start a new session.".to_string()
            }
            Self::CorruptStore { path, .. } => {
                format!("The store at {path:?} was corrupted and has been reset.")
            }
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
