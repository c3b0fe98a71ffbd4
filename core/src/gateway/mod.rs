//! Bidirectional JSON-RPC gateway: accepts websocket connections, performs
//! the handshake/authentication, and routes requests to method handlers.

pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod node;

use crate::config::AppConfig;
use crate::cron::CronScheduler;
use crate::error::CoreError;
use crate::events::EventQueue;
use crate::facade::AgentExecutor;
use crate::heartbeat::HeartbeatCoordinator;
use crate::lanes::LaneDispatcher;
use crate::session::SessionStore;
use crate::util::now_ms;
use auth::{authenticate, PeerInfo, Principal};
use connection::{ClientIdentity, ConnectionContext, ConnectionRegistry, DeviceIdentity, Role};
use dispatch::required_scope;
#[cfg(test)]
use dispatch::RequiredScope;
use frame::{IncomingFrame, OutgoingFrame, ResFrame, WireError, MAX_FRAME_BYTES, PROTOCOL_MAX, PROTOCOL_MIN};
use futures_util::{SinkExt, StreamExt};
use node::NodeRegistry;
use rand::RngCore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state handed to every connection's dispatch loop.
pub struct GatewayContext {
    pub config: AppConfig,
    pub connections: Arc<ConnectionRegistry>,
    pub nodes: Arc<NodeRegistry>,
    pub sessions: Arc<SessionStore>,
    pub events: Arc<EventQueue>,
    pub lanes: Arc<LaneDispatcher>,
    pub cron: Arc<CronScheduler>,
    pub heartbeat: Arc<HeartbeatCoordinator>,
    pub executor: Arc<dyn AgentExecutor>,
    /// Methods a `node`-role connection may invoke regardless of scopes.
    /// Configuration, not a hardcoded constant — built from
    /// `dispatch::default_node_allowlist()` plus whatever
    /// `config.gateway.extra_node_methods` names, at construction time.
    pub node_allowlist: std::collections::HashSet<String>,
}

/// How long `serve` waits for in-flight connection handlers to drain once
/// shutdown is signaled before it aborts whatever is left.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct GatewayServer {
    ctx: Arc<GatewayContext>,
    shutdown: CancellationToken,
}

impl GatewayServer {
    pub fn new(ctx: Arc<GatewayContext>, shutdown: CancellationToken) -> Self {
        Self { ctx, shutdown }
    }

    pub async fn serve(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "gateway listening");
        let mut handlers = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let ctx = self.ctx.clone();
                    let shutdown = self.shutdown.clone();
                    handlers.spawn(async move {
                        match accept_async(stream).await {
                            Ok(ws_stream) => {
                                handle_connection(ws_stream, ctx, peer_addr.ip().is_loopback(), shutdown).await
                            }
                            Err(err) => tracing::warn!(%err, "websocket handshake failed"),
                        }
                    });
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("gateway no longer accepting new connections");
                    break;
                }
            }
        }

        let drain = async {
            while handlers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!(grace = ?SHUTDOWN_GRACE, "shutdown grace period elapsed, forcing remaining connections closed");
            handlers.shutdown().await;
        }
        Ok(())
    }
}

async fn handle_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ctx: Arc<GatewayContext>,
    is_loopback: bool,
    shutdown: CancellationToken,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<OutgoingFrame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&frame) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let _ = outbox_tx.send(OutgoingFrame::Event(frame::EventFrame {
        event: "challenge".to_string(),
        payload: serde_json::json!({ "nonce": hex::encode(nonce) }),
        seq: 0,
    }));

    let conn = ctx
        .connections
        .register(ClientIdentity::default(), nonce.to_vec(), outbox_tx.clone())
        .await;

    let mut handshake_done = false;
    let mut conn = conn;

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = shutdown.cancelled() => break,
        };
        let Some(Ok(msg)) = msg else { break };

        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        if text.len() > MAX_FRAME_BYTES {
            continue;
        }
        let incoming: IncomingFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%err, "malformed frame");
                continue;
            }
        };
        let IncomingFrame::Req(req) = incoming;

        if !handshake_done {
            match perform_handshake(&ctx, &conn, &req, is_loopback).await {
                Ok(authenticated) => {
                    handshake_done = true;
                    conn = authenticated;
                    let _ = conn.send(OutgoingFrame::Res(ResFrame::ok(
                        req.id.clone(),
                        serde_json::json!({
                            "event": "hello-ok",
                            "protocolVersion": PROTOCOL_MAX,
                            "serverVersion": env!("CARGO_PKG_VERSION"),
                            "capabilities": { "streaming": true },
                        }),
                    )));
                    spawn_tick_loop(conn.clone());
                }
                Err(err) => {
                    let _ = conn.send(OutgoingFrame::Res(ResFrame::err(req.id.clone(), WireError::from(&err))));
                    break;
                }
            }
            continue;
        }

        dispatch_request(&ctx, &conn, req).await;
    }

    ctx.connections.remove(conn.conn_id).await;
    ctx.nodes.remove_by_conn(conn.conn_id).await;
    send_task.abort();
}

async fn perform_handshake(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<ConnectionContext>,
    req: &frame::ReqFrame,
    is_loopback: bool,
) -> Result<Arc<ConnectionContext>, CoreError> {
    let client_min = req.params["protocolMin"].as_u64().unwrap_or(1) as u32;
    let client_max = req.params["protocolMax"].as_u64().unwrap_or(1) as u32;
    if client_max < PROTOCOL_MIN || client_min > PROTOCOL_MAX {
        return Err(CoreError::ProtocolVersion { client_min, client_max });
    }

    let host_header = req.params["host"].as_str().map(str::to_string);
    let forwarded_for = req.params["forwardedFor"].as_str().map(str::to_string);
    let peer = PeerInfo {
        is_loopback,
        host_header,
        forwarded_for,
        direct_peer_is_trusted_proxy: false,
        tailscale_user: None,
    };

    let device: Option<DeviceIdentity> = req
        .params
        .get("device")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let token = req.params["auth"]["token"].as_str();
    let password = req.params["auth"]["password"].as_str();

    let principal = authenticate(
        &peer,
        ctx.config.gateway.tailscale_proxy_enabled,
        device.as_ref(),
        &conn.challenge_nonce,
        token,
        password,
        &ctx.config.auth,
    )?;

    let requested_role = req.params["role"].as_str().unwrap_or("operator");
    let role = if requested_role == "node" { Role::Node } else { Role::Operator };

    let scopes: std::collections::HashSet<String> = match &principal {
        Principal::LocalBypass => req
            .params
            .get("scopes")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| ["operator.admin".to_string()].into()),
        _ => req
            .params
            .get("scopes")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
    };

    let client: ClientIdentity = req
        .params
        .get("client")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    ctx.connections.remove(conn.conn_id).await;
    let replaced = Arc::new(ConnectionContextBuilder {
        conn_id: conn.conn_id,
        role,
        scopes,
        client,
        device,
        authenticated: true,
    }
    .build(conn));
    ctx.connections.insert(replaced.clone()).await;
    Ok(replaced)
}

/// Helper to rebuild a `ConnectionContext` with post-handshake identity
/// while preserving the outbox and sequence counter.
struct ConnectionContextBuilder {
    conn_id: Uuid,
    role: Role,
    scopes: std::collections::HashSet<String>,
    client: ClientIdentity,
    device: Option<DeviceIdentity>,
    authenticated: bool,
}

impl ConnectionContextBuilder {
    fn build(self, previous: &Arc<ConnectionContext>) -> ConnectionContext {
        ConnectionContext::rebuild(
            previous,
            self.conn_id,
            self.role,
            self.scopes,
            self.client,
            self.device,
            self.authenticated,
        )
    }
}

fn spawn_tick_loop(conn: Arc<ConnectionContext>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            if !conn.send_event("tick", serde_json::json!({ "ts": now_ms() })) {
                break;
            }
        }
    });
}

async fn dispatch_request(ctx: &Arc<GatewayContext>, conn: &Arc<ConnectionContext>, req: frame::ReqFrame) {
    if conn.role == Role::Node && !dispatch::node_role_may_invoke(&req.method, &ctx.node_allowlist) {
        let _ = conn.send(OutgoingFrame::Res(ResFrame::err(
            req.id,
            WireError::from(&CoreError::UnauthorizedRole {
                role: "node".to_string(),
                method: req.method,
            }),
        )));
        return;
    }

    let required = required_scope(&req.method);
    if conn.role != Role::Node && !conn.has_scope(required.as_str()) {
        let _ = conn.send(OutgoingFrame::Res(ResFrame::err(
            req.id,
            WireError::from(&CoreError::MissingScope {
                method: req.method.clone(),
                required: required.as_str().to_string(),
            }),
        )));
        return;
    }

    let result = route_method(ctx, conn, &req.method, req.params).await;
    match result {
        Ok(payload) => {
            let _ = conn.send(OutgoingFrame::Res(ResFrame::ok(req.id, payload)));
        }
        Err(err) => {
            let _ = conn.send(OutgoingFrame::Res(ResFrame::err(req.id, WireError::from(&err))));
        }
    }
}

async fn route_method(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<ConnectionContext>,
    method: &str,
    params: Value,
) -> Result<Value, CoreError> {
    match method {
        "ping" => Ok(serde_json::json!({ "pong": now_ms() })),
        "node.register" => {
            let node_id = params["nodeId"].as_str().ok_or_else(|| CoreError::InvalidRequest {
                message: "nodeId is required".into(),
            })?;
            let commands: Vec<node::NodeCommand> = params
                .get("commands")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            ctx.nodes
                .register(node::NodeSession {
                    node_id: node_id.to_string(),
                    conn_id: conn.conn_id,
                    display_name: params["displayName"].as_str().map(str::to_string),
                    platform: params["platform"].as_str().map(str::to_string),
                    caps: params["caps"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default(),
                    commands,
                    permissions: vec![],
                    connected_at_ms: now_ms(),
                })
                .await;
            Ok(serde_json::json!({ "registered": true }))
        }
        "node.invoke.result" => {
            let request_id: Uuid = params["requestId"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| CoreError::InvalidRequest {
                    message: "requestId is required".into(),
                })?;
            let delivered = ctx
                .nodes
                .complete_invoke(request_id, params["result"].clone())
                .await;
            Ok(serde_json::json!({ "delivered": delivered }))
        }
        "node.invoke" => {
            let node_id = params["nodeId"].as_str().ok_or_else(|| CoreError::InvalidRequest {
                message: "nodeId is required".into(),
            })?;
            let command = params["command"].as_str().ok_or_else(|| CoreError::InvalidRequest {
                message: "command is required".into(),
            })?;
            let timeout_ms = params["timeoutMs"]
                .as_u64()
                .unwrap_or(node::DEFAULT_INVOKE_TIMEOUT_MS);
            let target_conn = ctx.nodes.get(node_id).await.ok_or_else(|| CoreError::NotFound {
                what: format!("node {node_id}"),
            })?;
            let target = ctx.connections.get(target_conn.conn_id).await;
            ctx.nodes
                .invoke(node_id, command, params["params"].clone(), timeout_ms, |event, payload| {
                    target.as_ref().is_some_and(|t| t.send_event(event, payload))
                })
                .await
        }
        "sessions.list" => {
            let doc = ctx.sessions.load()?;
            Ok(serde_json::to_value(doc.entries)?)
        }
        "cron.list" => {
            let jobs = ctx.cron.list_jobs().await;
            Ok(serde_json::to_value(jobs)?)
        }
        _ => Err(CoreError::UnknownMethod { method: method.to_string() }),
    }
}
