//! Application configuration and state-directory resolution.

use crate::error::Result;
use crate::util::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolve the state directory: `OPENCLAW_STATE_DIR` wins; otherwise
/// `$HOME/.openclaw[-<profile>]` where `<profile>` is `OPENCLAW_PROFILE`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("OPENCLAW_STATE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    match std::env::var("OPENCLAW_PROFILE") {
        Ok(profile) if !profile.is_empty() => home.join(format!(".openclaw-{profile}")),
        _ => home.join(".openclaw"),
    }
}

/// Bind scope for the gateway listener.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BindScope {
    Loopback,
    All,
}

impl Default for BindScope {
    fn default() -> Self {
        Self::Loopback
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind: BindScope,
    #[serde(default)]
    pub allowed_web_origins: Vec<String>,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    #[serde(default)]
    pub tailscale_proxy_enabled: bool,
    /// Methods granted to the `node` role in addition to the built-in
    /// default allowlist (`node.invoke.result`, `node.heartbeat`,
    /// `node.register`).
    #[serde(default)]
    pub extra_node_methods: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: BindScope::default(),
            allowed_web_origins: Vec::new(),
            trusted_proxies: Vec::new(),
            tailscale_proxy_enabled: false,
            extra_node_methods: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    18789
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Shared token compared in constant time.
    #[serde(default)]
    pub token: Option<String>,
    /// Shared password compared in constant time.
    #[serde(default)]
    pub password: Option<String>,
    /// Registered device public keys, by deviceId, hex-encoded.
    #[serde(default)]
    pub device_keys: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatsConfig {
    /// Process-wide kill switch checked before any per-agent heartbeat
    /// config; first gate of the handler's gate sequence.
    #[serde(default = "default_true")]
    pub global_enabled: bool,
}

impl Default for HeartbeatsConfig {
    fn default() -> Self {
        Self { global_enabled: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    #[serde(default = "default_main_concurrency")]
    pub main: usize,
    #[serde(default = "default_cron_concurrency")]
    pub cron: usize,
    #[serde(default = "default_subagent_concurrency")]
    pub subagent: usize,
    #[serde(default = "default_session_lane_concurrency")]
    pub session_default: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            main: default_main_concurrency(),
            cron: default_cron_concurrency(),
            subagent: default_subagent_concurrency(),
            session_default: default_session_lane_concurrency(),
        }
    }
}

fn default_main_concurrency() -> usize {
    1
}
fn default_cron_concurrency() -> usize {
    1
}
fn default_subagent_concurrency() -> usize {
    2
}
fn default_session_lane_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub lanes: LaneConfig,
    #[serde(default)]
    pub heartbeats: HeartbeatsConfig,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        atomic_write(path.as_ref(), content.as_bytes())
    }

    pub fn default_path() -> PathBuf {
        state_dir().join("config.toml")
    }

    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            if let Ok(cfg) = Self::load(&path) {
                return cfg;
            }
        }
        Self::default()
    }
}
