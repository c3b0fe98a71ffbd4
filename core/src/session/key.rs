//! Session key parsing and validation.
//!
//! A session key is a colon-delimited hierarchical identifier. Equality is
//! string equality after trimming; this module only validates shape and
//! exposes a couple of convenience queries the cron reaper and lane
//! resolver need.

use crate::error::{CoreError, Result};
use std::fmt;

/// A validated, trimmed session key.
///
/// Canonical forms:
/// - `agent:{agentId}:main`
/// - `agent:{agentId}:{channel}:{chatType}:{peerId}`
/// - any of the above with a `:thread:{threadId}` suffix
/// - `cron:{jobId}` or `cron:{jobId}:run:{uuid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    /// Parse and validate a raw key string.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidRequest {
                message: "session key must not be empty".into(),
            });
        }

        let parts: Vec<&str> = trimmed.split(':').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(CoreError::InvalidRequest {
                message: format!("session key {trimmed:?} has an empty segment"),
            });
        }

        match parts.first() {
            Some(&"agent") | Some(&"cron") => Ok(Self(trimmed.to_string())),
            _ => Err(CoreError::InvalidRequest {
                message: format!("session key {trimmed:?} has unknown namespace"),
            }),
        }
    }

    /// Construct without validation, for keys built internally from known-good
    /// components (e.g. `cron:{jobId}:run:{uuid}`).
    pub fn from_parts(segments: &[&str]) -> Self {
        Self(segments.join(":"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_cron(&self) -> bool {
        self.0.starts_with("cron:")
    }

    pub fn is_cron_run(&self) -> bool {
        self.0.starts_with("cron:") && self.0.contains(":run:")
    }

    pub fn has_thread(&self) -> bool {
        self.0.contains(":thread:")
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_forms() {
        assert!(SessionKey::parse("agent:asst1:main").is_ok());
        assert!(SessionKey::parse("agent:asst1:slack:group:C123").is_ok());
        assert!(SessionKey::parse("agent:asst1:main:thread:t1").is_ok());
        assert!(SessionKey::parse("cron:job1").is_ok());
        assert!(SessionKey::parse("cron:job1:run:abc-123").is_ok());
    }

    #[test]
    fn rejects_empty_and_unknown_namespace() {
        assert!(SessionKey::parse("").is_err());
        assert!(SessionKey::parse("  ").is_err());
        assert!(SessionKey::parse("agent::main").is_err());
        assert!(SessionKey::parse("widget:1").is_err());
    }

    #[test]
    fn trims_whitespace() {
        let key = SessionKey::parse("  agent:a1:main  ").unwrap();
        assert_eq!(key.as_str(), "agent:a1:main");
    }

    #[test]
    fn cron_run_detection() {
        let plain = SessionKey::parse("cron:job1").unwrap();
        let run = SessionKey::parse("cron:job1:run:u1").unwrap();
        assert!(!plain.is_cron_run());
        assert!(run.is_cron_run());
        assert!(plain.is_cron() && run.is_cron());
    }
}
