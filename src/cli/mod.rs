//! Command-line surface for the openclaw daemon.

use clap::{Parser, Subcommand};

pub mod service;

#[derive(Parser)]
#[command(name = "openclaw")]
#[command(about = "Concurrency and scheduling core for a personal AI-assistant runtime")]
#[command(version)]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (build ", env!("BUILD_NUMBER"), ", ", env!("GIT_HASH"), ")"
))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway/cron/heartbeat runtime in the foreground.
    Run,
    /// Spawn the runtime detached and write a PID file.
    Start,
    /// Stop a previously started daemon.
    Stop,
    /// Restart a previously started daemon.
    Restart,
    /// Report whether a daemon is running and reachable.
    Status,
}
