//! Network Layer
//!
//! WebSocket transport for browser clients. Everything here runs on the
//! transport scheduler; simulation state is only reached through the bridge.

pub mod auth;
pub mod broadcast;
pub mod challenge;
pub mod polling;
pub mod protocol;
pub mod server;
pub mod session;

pub use auth::{AuthError, Authenticator, ServerSecret};
pub use broadcast::{Broadcaster, ConnectionError};
pub use challenge::{ApplicationError, ChallengeController};
pub use polling::PollingLoop;
pub use protocol::{ClientMessage, Envelope, ErrorCode, ErrorPayload, ProtocolError, ServerEvent};
pub use server::BridgeServer;
pub use session::{AuthStatus, ConnectionId, Session, SessionRegistry};
