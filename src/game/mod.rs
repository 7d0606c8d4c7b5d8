//! Game Module
//!
//! The simulation side of the bridge.
//!
//! ## Module Structure
//!
//! - `state`: snapshot, modifiers and challenge types
//! - `simulation`: the `Simulation` interface and the scripted stand-in
//! - `runner`: the blocking tick loop thread

pub mod runner;
pub mod simulation;
pub mod state;

pub use runner::{SimulationRunner, FRAME_INTERVAL};
pub use simulation::{RallyConfig, RallySimulation, SimEvent, Simulation};
pub use state::{ChallengeDescriptor, ChallengeDifficulty, GameModifiers, GameSnapshot};
