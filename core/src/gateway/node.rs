//! Node connections: devices that register capabilities and commands, and
//! the request/result protocol operators use to invoke them.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;
pub const MAX_INVOKE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCommand {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NodeSession {
    pub node_id: String,
    pub conn_id: Uuid,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub caps: Vec<String>,
    pub commands: Vec<NodeCommand>,
    pub permissions: Vec<String>,
    pub connected_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInvokeRequest {
    pub node_id: String,
    pub command: String,
    pub params: serde_json::Value,
    pub timeout_ms: u64,
}

/// Registry of connected nodes and pending `node.invoke` calls awaiting a
/// matching `node.invoke.result`.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, NodeSession>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<serde_json::Value>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: NodeSession) {
        self.nodes.lock().await.insert(session.node_id.clone(), session);
    }

    pub async fn remove_by_conn(&self, conn_id: Uuid) {
        self.nodes.lock().await.retain(|_, s| s.conn_id != conn_id);
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeSession> {
        self.nodes.lock().await.get(node_id).cloned()
    }

    pub async fn list(&self) -> Vec<NodeSession> {
        self.nodes.lock().await.values().cloned().collect()
    }

    /// Invoke a command on a node and wait (up to `timeout_ms`, capped) for
    /// its result. Emits a `node.invoke.request` event on the node's
    /// connection via `send_event`, then awaits the matching
    /// `node.invoke.result` delivered through `complete_invoke`.
    pub async fn invoke(
        &self,
        node_id: &str,
        command: &str,
        params: serde_json::Value,
        timeout_ms: u64,
        send_event: impl FnOnce(&str, serde_json::Value) -> bool,
    ) -> Result<serde_json::Value> {
        let node = self
            .get(node_id)
            .await
            .ok_or_else(|| CoreError::NotFound {
                what: format!("node {node_id}"),
            })?;
        if !node.commands.iter().any(|c| c.name == command) {
            return Err(CoreError::InvalidRequest {
                message: format!("node {node_id} does not declare command {command}"),
            });
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let payload = serde_json::json!({
            "requestId": request_id,
            "nodeId": node_id,
            "command": command,
            "params": params,
        });
        if !send_event("node.invoke.request", payload) {
            self.pending.lock().await.remove(&request_id);
            return Err(CoreError::Conflict {
                message: "node connection is gone".into(),
            });
        }

        let effective_timeout = timeout_ms.min(MAX_INVOKE_TIMEOUT_MS).max(1);
        match tokio::time::timeout(Duration::from_millis(effective_timeout), rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CoreError::Internal {
                message: "node invoke result channel dropped".into(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(CoreError::Timeout {
                    duration: Duration::from_millis(effective_timeout),
                })
            }
        }
    }

    /// Deliver a `node.invoke.result` frame to the waiter for `request_id`.
    pub async fn complete_invoke(&self, request_id: Uuid, result: serde_json::Value) -> bool {
        if let Some(tx) = self.pending.lock().await.remove(&request_id) {
            tx.send(result).is_ok()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node(node_id: &str) -> NodeSession {
        NodeSession {
            node_id: node_id.to_string(),
            conn_id: Uuid::new_v4(),
            display_name: Some("laptop".into()),
            platform: Some("linux".into()),
            caps: vec!["shell".into()],
            commands: vec![NodeCommand {
                name: "run-shell".into(),
                description: None,
            }],
            permissions: vec![],
            connected_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn invoke_unknown_node_fails_fast() {
        let registry = NodeRegistry::new();
        let result = registry
            .invoke("missing", "run-shell", serde_json::json!({}), 1000, |_, _| true)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invoke_rejects_undeclared_command() {
        let registry = NodeRegistry::new();
        registry.register(sample_node("n1")).await;
        let result = registry
            .invoke("n1", "reboot", serde_json::json!({}), 1000, |_, _| true)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invoke_times_out_without_a_result() {
        let registry = NodeRegistry::new();
        registry.register(sample_node("n1")).await;
        let result = registry
            .invoke("n1", "run-shell", serde_json::json!({}), 50, |_, _| true)
            .await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
    }

    #[tokio::test]
    async fn invoke_resolves_when_result_delivered() {
        let registry = Arc::new(NodeRegistry::new());
        registry.register(sample_node("n1")).await;

        let captured_id = Arc::new(Mutex::new(None));
        let captured_clone = captured_id.clone();
        let registry_clone = registry.clone();
        let handle = tokio::spawn(async move {
            registry_clone
                .invoke("n1", "run-shell", serde_json::json!({}), 5000, move |_, payload| {
                    let id = payload["requestId"].as_str().unwrap().to_string();
                    let captured = captured_clone.clone();
                    tokio::spawn(async move {
                        *captured.lock().await = Some(id);
                    });
                    true
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let id_str = captured_id.lock().await.clone().unwrap();
        let request_id: Uuid = id_str.parse().unwrap();
        let delivered = registry
            .complete_invoke(request_id, serde_json::json!({"ok": true}))
            .await;
        assert!(delivered);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn remove_by_conn_drops_node() {
        let registry = NodeRegistry::new();
        let node = sample_node("n1");
        let conn_id = node.conn_id;
        registry.register(node).await;
        registry.remove_by_conn(conn_id).await;
        assert!(registry.get("n1").await.is_none());
    }
}
