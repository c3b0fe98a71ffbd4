//! Connection registry: one entry per active websocket connection.

use crate::gateway::frame::{EventFrame, OutgoingFrame};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Operator,
    Node,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientIdentity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub client_id: String,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub signed_at_ms: i64,
    pub token: String,
    pub signature: String,
}

/// Per-connection context: identity, role, and granted scopes.
pub struct ConnectionContext {
    pub conn_id: Uuid,
    pub role: Role,
    pub scopes: HashSet<String>,
    pub client: ClientIdentity,
    pub device: Option<DeviceIdentity>,
    pub authenticated: bool,
    pub challenge_nonce: Vec<u8>,
    seq: AtomicU64,
    outbox: mpsc::UnboundedSender<OutgoingFrame>,
}

impl ConnectionContext {
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains("operator.admin") || self.scopes.contains(scope)
    }

    pub fn send_event(&self, event: &str, payload: serde_json::Value) -> bool {
        let seq = self.next_seq();
        self.outbox
            .send(OutgoingFrame::Event(EventFrame {
                event: event.to_string(),
                payload,
                seq,
            }))
            .is_ok()
    }

    pub fn send(&self, frame: OutgoingFrame) -> bool {
        self.outbox.send(frame).is_ok()
    }

    /// Rebuild a context with post-handshake identity while keeping the
    /// original outbox channel and sequence counter.
    pub(crate) fn rebuild(
        previous: &ConnectionContext,
        conn_id: Uuid,
        role: Role,
        scopes: HashSet<String>,
        client: ClientIdentity,
        device: Option<DeviceIdentity>,
        authenticated: bool,
    ) -> Self {
        Self {
            conn_id,
            role,
            scopes,
            client,
            device,
            authenticated,
            challenge_nonce: previous.challenge_nonce.clone(),
            seq: AtomicU64::new(previous.seq.load(Ordering::SeqCst)),
            outbox: previous.outbox.clone(),
        }
    }
}

/// Registry of active connections, keyed by connection id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Uuid, Arc<ConnectionContext>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        client: ClientIdentity,
        challenge_nonce: Vec<u8>,
        outbox: mpsc::UnboundedSender<OutgoingFrame>,
    ) -> Arc<ConnectionContext> {
        let ctx = Arc::new(ConnectionContext {
            conn_id: Uuid::new_v4(),
            role: Role::Operator,
            scopes: HashSet::new(),
            client,
            device: None,
            authenticated: false,
            challenge_nonce,
            seq: AtomicU64::new(1),
            outbox,
        });
        self.connections.lock().await.insert(ctx.conn_id, ctx.clone());
        ctx
    }

    pub async fn remove(&self, conn_id: Uuid) {
        self.connections.lock().await.remove(&conn_id);
    }

    pub async fn insert(&self, ctx: Arc<ConnectionContext>) {
        self.connections.lock().await.insert(ctx.conn_id, ctx);
    }

    pub async fn get(&self, conn_id: Uuid) -> Option<Arc<ConnectionContext>> {
        self.connections.lock().await.get(&conn_id).cloned()
    }

    pub async fn broadcast(&self, event: &str, payload: serde_json::Value) {
        let connections = self.connections.lock().await;
        for ctx in connections.values() {
            ctx.send_event(event, payload.clone());
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_remove_round_trip() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = registry
            .register(ClientIdentity::default(), vec![1, 2, 3], tx)
            .await;
        assert_eq!(registry.len().await, 1);
        registry.remove(ctx.conn_id).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn seq_is_monotonic_starting_at_one() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = registry
            .register(ClientIdentity::default(), vec![], tx)
            .await;

        ctx.send_event("tick", serde_json::json!({}));
        ctx.send_event("tick", serde_json::json!({}));

        let OutgoingFrame::Event(first) = rx.recv().await.unwrap() else {
            panic!("expected event frame");
        };
        let OutgoingFrame::Event(second) = rx.recv().await.unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }
}
