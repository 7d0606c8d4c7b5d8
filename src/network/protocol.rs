//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON text envelope `{type, payload, timestamp}`.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::game::state::GameSnapshot;

// =============================================================================
// ENVELOPE
// =============================================================================

/// Outbound frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind, e.g. `score:updated`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific body.
    pub payload: Value,
    /// ISO-8601 creation time.
    pub timestamp: String,
}

impl Envelope {
    /// Wrap `payload` with the current time.
    pub fn new(kind: ServerEvent, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
            timestamp: now_iso8601(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Current time as RFC 3339 UTC with millisecond precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Inbound frame before dispatch on `type`.
#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

/// Message kinds sent from server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Client must authenticate before the deadline.
    #[serde(rename = "auth:required")]
    AuthRequired,
    /// Credentials accepted.
    #[serde(rename = "auth:success")]
    AuthSuccess,
    /// Credentials rejected.
    #[serde(rename = "auth:failed")]
    AuthFailed,
    /// Deadline passed without authentication.
    #[serde(rename = "auth:timeout")]
    AuthTimeout,
    /// Full snapshot.
    #[serde(rename = "game:state")]
    GameState,
    /// A game began.
    #[serde(rename = "game:started")]
    GameStarted,
    /// A game finished.
    #[serde(rename = "game:ended")]
    GameEnded,
    /// Score counters changed.
    #[serde(rename = "score:updated")]
    ScoreUpdated,
    /// Ball touched a paddle.
    #[serde(rename = "ball:hit")]
    BallHit,
    /// A power-up was picked up.
    #[serde(rename = "powerup:collected")]
    PowerUpCollected,
    /// A challenge was applied.
    #[serde(rename = "challenge:loaded")]
    ChallengeLoaded,
    /// Difficulty was changed.
    #[serde(rename = "difficulty:updated")]
    DifficultyUpdated,
    /// A modifier was applied.
    #[serde(rename = "modifier:applied")]
    ModifierApplied,
    /// A request was rejected.
    #[serde(rename = "error")]
    Error,
}

impl ServerEvent {
    /// Wire name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ServerEvent::AuthRequired => "auth:required",
            ServerEvent::AuthSuccess => "auth:success",
            ServerEvent::AuthFailed => "auth:failed",
            ServerEvent::AuthTimeout => "auth:timeout",
            ServerEvent::GameState => "game:state",
            ServerEvent::GameStarted => "game:started",
            ServerEvent::GameEnded => "game:ended",
            ServerEvent::ScoreUpdated => "score:updated",
            ServerEvent::BallHit => "ball:hit",
            ServerEvent::PowerUpCollected => "powerup:collected",
            ServerEvent::ChallengeLoaded => "challenge:loaded",
            ServerEvent::DifficultyUpdated => "difficulty:updated",
            ServerEvent::ModifierApplied => "modifier:applied",
            ServerEvent::Error => "error",
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `auth:required` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequiredPayload {
    /// Human-readable instruction.
    pub message: String,
    /// Seconds the client has to authenticate.
    pub timeout: u64,
    /// Absolute deadline (ISO-8601).
    pub deadline: String,
}

/// `auth:success` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSuccessPayload {
    /// Connection identifier assigned by the server.
    pub session_id: String,
    /// Human-readable confirmation.
    pub message: String,
}

/// `auth:failed` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailedPayload {
    /// What was wrong with the credentials.
    pub reason: String,
    /// What the client should do next.
    pub action: String,
}

/// `score:updated` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    /// Current score.
    pub score: u64,
    /// Current hit count.
    pub balls_hit: u64,
    /// Current power-up count.
    pub power_ups_collected: u64,
    /// Seconds of play.
    pub game_time: f64,
    /// Change since the previous update.
    pub delta: ScoreDelta,
}

/// Counter increments between two `score:updated` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreDelta {
    /// Score change.
    pub score: i64,
    /// Hit count change.
    pub balls_hit: i64,
    /// Power-up count change.
    pub power_ups_collected: i64,
}

/// `modifier:applied` payload (also the `modifier:apply` request body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifierPayload {
    /// Modifier name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Modifier value.
    pub value: Value,
}

/// `difficulty:updated` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyPayload {
    /// Clamped level.
    pub level: u8,
    /// Speed multiplier derived from the level.
    pub ball_speed_multiplier: f64,
}

/// Structured rejection sent as an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// What failed and why.
    pub message: String,
    /// What the client can do about it.
    pub action: String,
}

impl ErrorPayload {
    /// Build an error payload.
    pub fn new(code: ErrorCode, message: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            action: action.into(),
        }
    }

    /// Rejection for a session that has not authenticated.
    pub fn not_authenticated() -> Self {
        Self::new(
            ErrorCode::NotAuthenticated,
            "this request requires an authenticated session",
            "send auth:token with a valid signature first",
        )
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Session has not authenticated.
    NotAuthenticated,
    /// Session failed authentication.
    AuthFailed,
    /// Challenge payload was rejected.
    InvalidChallenge,
    /// Difficulty payload was rejected.
    InvalidDifficulty,
    /// Modifier payload was rejected.
    InvalidModifier,
    /// The simulation did not accept the change in time.
    SimulationUnavailable,
}

/// Serialize a snapshot as a payload.
pub fn snapshot_payload(snapshot: &GameSnapshot) -> Value {
    serde_json::to_value(snapshot).unwrap_or(Value::Null)
}

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

/// `auth:token` body. Every field is optional on the wire so that a missing
/// field is reported as an authentication failure, not a protocol error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthCredentials {
    /// Opaque client token.
    pub token: Option<String>,
    /// Unix seconds, as a JSON number or numeric string.
    pub timestamp: Option<Value>,
    /// Hex HMAC-SHA256 over `token:timestamp`.
    pub signature: Option<String>,
}

/// Messages sent from client to server.
///
/// Configuration bodies stay as raw JSON; the challenge controller owns their
/// validation so that bad values produce an `error` reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `auth:token`
    AuthToken(AuthCredentials),
    /// `challenge:load`
    ChallengeLoad(Value),
    /// `difficulty:update`
    DifficultyUpdate(Value),
    /// `modifier:apply`
    ModifierApply(Value),
    /// `game:request_state`
    RequestState,
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let frame: IncomingFrame = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

        match frame.kind.as_str() {
            "auth:token" => {
                let payload = if frame.payload.is_null() {
                    Value::Object(Default::default())
                } else {
                    frame.payload
                };
                serde_json::from_value(payload)
                    .map(ClientMessage::AuthToken)
                    .map_err(|source| ProtocolError::MalformedPayload {
                        kind: frame.kind.clone(),
                        source,
                    })
            }
            "challenge:load" => Ok(ClientMessage::ChallengeLoad(frame.payload)),
            "difficulty:update" => Ok(ClientMessage::DifficultyUpdate(frame.payload)),
            "modifier:apply" => Ok(ClientMessage::ModifierApply(frame.payload)),
            "game:request_state" => Ok(ClientMessage::RequestState),
            _ => Err(ProtocolError::UnknownType(frame.kind.clone())),
        }
    }

    /// Wire name.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::AuthToken(_) => "auth:token",
            ClientMessage::ChallengeLoad(_) => "challenge:load",
            ClientMessage::DifficultyUpdate(_) => "difficulty:update",
            ClientMessage::ModifierApply(_) => "modifier:apply",
            ClientMessage::RequestState => "game:request_state",
        }
    }
}

/// Frames that cannot be dispatched. Logged and dropped; the connection stays up.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, or no `type` field.
    #[error("invalid frame: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// `type` is not a known client message.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Payload has the wrong shape for its type.
    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        /// Message type.
        kind: String,
        /// Decode error.
        #[source]
        source: serde_json::Error,
    },
}
