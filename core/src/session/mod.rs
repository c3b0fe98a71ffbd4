//! Session key, session entry, and the durable session store.

pub mod entry;
pub mod key;
mod lock;
pub mod store;

pub use entry::{ChatType, DeliveryRoute, ExecutionHost, QueueMode, QueuePolicy, SecurityMode, SessionEntry, TokenCounters};
pub use key::SessionKey;
pub use store::{SessionDocument, SessionStore};
