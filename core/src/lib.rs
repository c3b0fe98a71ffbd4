//! Core library for openclaw: the concurrency and scheduling runtime
//! behind a personal AI-assistant daemon.
//!
//! The daemon itself holds no model-invocation logic; it coordinates
//! command lanes, a durable cron scheduler, a heartbeat coordinator, a
//! session store, and a gateway router, and calls out to an agent
//! executor through [`facade::AgentExecutor`].

#![deny(unsafe_code)]

pub mod config;
pub mod cron;
pub mod error;
pub mod events;
pub mod facade;
pub mod gateway;
pub mod heartbeat;
pub mod lanes;
pub mod session;
pub mod util;

pub use error::{CoreError, Result};
