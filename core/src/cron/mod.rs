//! Durable cron scheduler: job store, schedule computation, backoff, and
//! the timer-driven dispatch engine.

pub mod backoff;
pub mod model;
pub mod schedule;
pub mod scheduler;
pub mod store;

pub use model::{CronJob, JobId, Payload, Schedule, SessionTarget, WakeMode};
pub use scheduler::CronScheduler;
pub use store::JobStore;
