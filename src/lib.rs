//! # Pong Bridge
//!
//! Real-time sync bridge between a frame-based game simulation and browser
//! clients over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  simulation thread          │  transport scheduler thread   │
//! │  (blocking tick loop)       │  (tokio current_thread)       │
//! ├─────────────────────────────┼───────────────────────────────┤
//! │  game/runner.rs             │  network/server.rs            │
//! │   apply commands ◄──────────┼── challenge.rs (submit)       │
//! │   tick                      │                               │
//! │   publish snapshot ─────────┼─► polling.rs (snapshot)       │
//! │   emit events ──────────────┼─► polling.rs (drain)          │
//! │                             │    └─► broadcast.rs           │
//! │                             │         └─► session.rs        │
//! └─────────────────────────────┴───────────────────────────────┘
//!                         bridge/link.rs
//! ```
//!
//! ## Threading
//!
//! Exactly two execution contexts. The simulation thread never suspends
//! mid-tick and never touches transport state; configuration reaches it as
//! whole-value commands applied between ticks. The transport side is a
//! single cooperative scheduler hosting the accept loop, every connection,
//! authentication timeouts, and the polling loop.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use bridge::{link, BridgeError, SimCommand, SimulationLink, SyncBridge, TransportLink};
pub use config::BridgeConfig;
pub use game::{GameModifiers, GameSnapshot, RallySimulation, SimEvent, Simulation, SimulationRunner};
pub use network::{Authenticator, ServerSecret};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
