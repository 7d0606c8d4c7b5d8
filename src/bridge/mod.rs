//! Cross-Thread Bridge
//!
//! Handoff between the blocking simulation thread and the transport
//! scheduler, plus the scheduler's own lifecycle.
//!
//! - `link`: bounded command/event queues and the latest-snapshot cell
//! - `lifecycle`: scheduler thread, port binding, start/stop
//! - `error`: failures on either side of the boundary

pub mod error;
pub mod lifecycle;
pub mod link;

pub use error::BridgeError;
pub use lifecycle::{bind_with_retry, SyncBridge};
pub use link::{link, link_with_capacity, BridgedEvent, SimCommand, SimulationLink, TransportLink};
