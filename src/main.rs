//! `openclaw` — concurrency and scheduling core for a personal
//! AI-assistant runtime: command lanes, a durable cron scheduler, a
//! heartbeat coordinator, a session store, and a gateway router.

mod cli;
mod content;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use content::FileHeartbeatContentSource;
use openclaw_core::config::{state_dir, AppConfig};
use openclaw_core::cron::{CronScheduler, JobStore};
use openclaw_core::events::EventQueue;
use openclaw_core::facade::StubAgentExecutor;
use openclaw_core::gateway::connection::ConnectionRegistry;
use openclaw_core::gateway::node::NodeRegistry;
use openclaw_core::gateway::{GatewayContext, GatewayServer};
use openclaw_core::heartbeat::config::HeartbeatConfig;
use openclaw_core::heartbeat::gate::DefaultHeartbeatHandler;
use openclaw_core::heartbeat::HeartbeatCoordinator;
use openclaw_core::lanes::LaneDispatcher;
use openclaw_core::session::SessionStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const MAIN_AGENT_ID: &str = "main";

fn init_logging() {
    let filter = EnvFilter::try_from_env("OPENCLAW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            init_logging();
            run().await
        }
        Commands::Start => cli::service::start(),
        Commands::Stop => cli::service::stop(),
        Commands::Restart => cli::service::restart(),
        Commands::Status => cli::service::status(),
    }
}

async fn run() -> Result<()> {
    let dir = state_dir();
    std::fs::create_dir_all(&dir)?;
    let config = AppConfig::load_or_default();

    let sessions = Arc::new(SessionStore::new(dir.join("sessions.json")));
    let events = Arc::new(EventQueue::new());
    let lanes = Arc::new(LaneDispatcher::new());
    let executor = Arc::new(StubAgentExecutor);

    let content = Arc::new(FileHeartbeatContentSource::new(
        dir.clone(),
        sessions.clone(),
        MAIN_AGENT_ID,
    ));
    let heartbeat = HeartbeatCoordinator::new_with_handler({
        let events = events.clone();
        let lanes = lanes.clone();
        let sessions = sessions.clone();
        let executor: Arc<dyn openclaw_core::facade::AgentExecutor> = executor.clone();
        move |weak| {
            Arc::new(DefaultHeartbeatHandler::new(
                weak,
                MAIN_AGENT_ID,
                events,
                lanes,
                sessions,
                executor,
                content,
            ))
        }
    });
    heartbeat
        .register_agent(MAIN_AGENT_ID, HeartbeatConfig::default())
        .await;
    heartbeat.set_global_enabled(config.heartbeats.global_enabled);
    heartbeat.spawn_interval_timer();

    let job_store = JobStore::new(dir.join("cron.json"));
    let cron = CronScheduler::new(
        job_store,
        lanes.clone(),
        sessions.clone(),
        events.clone(),
        heartbeat.clone(),
        executor.clone(),
    );
    cron.recover_on_startup().await?;
    cron.spawn_timer();

    let mut node_allowlist = openclaw_core::gateway::dispatch::default_node_allowlist();
    node_allowlist.extend(config.gateway.extra_node_methods.iter().cloned());

    let ctx = Arc::new(GatewayContext {
        config: config.clone(),
        connections: Arc::new(ConnectionRegistry::new()),
        nodes: Arc::new(NodeRegistry::new()),
        sessions,
        events,
        lanes,
        cron,
        heartbeat,
        executor,
        node_allowlist,
    });

    let shutdown = CancellationToken::new();
    let server = GatewayServer::new(ctx, shutdown.clone());
    let addr = format!("127.0.0.1:{}", config.gateway.port);

    let serve_fut = server.serve(&addr);
    tokio::pin!(serve_fut);

    loop {
        tokio::select! {
            res = &mut serve_fut => return res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, draining connections");
                shutdown.cancel();
            }
        }
    }
}
