//! Method registry: declares the scope each method requires and whether
//! it is reachable by the `node` role.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredScope {
    Read,
    Write,
    Approvals,
    Pairing,
    Admin,
}

impl RequiredScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "operator.read",
            Self::Write => "operator.write",
            Self::Approvals => "operator.approvals",
            Self::Pairing => "operator.pairing",
            Self::Admin => "operator.admin",
        }
    }
}

/// Resolve the scope a method requires, honoring the `config.`/`wizard.`
/// admin-only prefixes before falling back to table lookup.
pub fn required_scope(method: &str) -> RequiredScope {
    if method.starts_with("config.") || method.starts_with("wizard.") {
        return RequiredScope::Admin;
    }
    match method {
        "agents.create" | "agents.update" | "agents.delete" | "cron.create" | "cron.update"
        | "cron.delete" | "sessions.update" | "node.invoke" => RequiredScope::Write,
        "approvals.grant" | "approvals.deny" => RequiredScope::Approvals,
        "pairing.begin" | "pairing.complete" => RequiredScope::Pairing,
        _ => RequiredScope::Read,
    }
}

/// Default methods a `node`-role connection may invoke regardless of
/// scopes; any other method from a node connection is `unauthorized-role`.
/// This is a starting value, not a hardcoded ceiling — callers pass the
/// actual allowlist (usually built from this default, possibly extended by
/// configuration) into `GatewayContext` at construction.
pub fn default_node_allowlist() -> HashSet<String> {
    ["node.invoke.result", "node.heartbeat", "node.register"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn node_role_may_invoke(method: &str, allowlist: &HashSet<String>) -> bool {
    allowlist.contains(method)
}
