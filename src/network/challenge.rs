//! Challenge / Modifier Controller
//!
//! Validates remote configuration and hands it to the simulation through the
//! bridge. Validation happens entirely before submission, so a rejected
//! request never changes anything. Accepted changes are echoed to every
//! authenticated session.

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::bridge::error::BridgeError;
use crate::bridge::link::{SimCommand, TransportLink};
use crate::game::state::{
    clamp_difficulty, speed_multiplier_for, ChallengeDescriptor, ChallengeDifficulty,
    GameModifiers, MAX_MODIFIER,
};
use crate::network::broadcast::Broadcaster;
use crate::network::protocol::{
    DifficultyPayload, ErrorCode, ErrorPayload, ModifierPayload, ServerEvent,
};

/// Rejected configuration requests.
#[derive(Debug, thiserror::Error)]
pub enum ApplicationError {
    /// `challenge:load` payload failed validation.
    #[error("invalid challenge: {0}")]
    InvalidChallenge(String),
    /// `difficulty:update` payload failed validation.
    #[error("invalid difficulty: {0}")]
    InvalidDifficulty(String),
    /// `modifier:apply` payload failed validation.
    #[error("invalid modifier: {0}")]
    InvalidModifier(String),
    /// The simulation did not apply the change.
    #[error("simulation did not apply the change: {0}")]
    Bridge(#[from] BridgeError),
}

impl ApplicationError {
    /// Wire form of this error.
    pub fn to_payload(&self) -> ErrorPayload {
        let (code, action) = match self {
            ApplicationError::InvalidChallenge(_) => (
                ErrorCode::InvalidChallenge,
                "fix the challenge payload and send challenge:load again",
            ),
            ApplicationError::InvalidDifficulty(_) => (
                ErrorCode::InvalidDifficulty,
                "send difficulty:update with a numeric level between 1 and 5",
            ),
            ApplicationError::InvalidModifier(_) => (
                ErrorCode::InvalidModifier,
                "send modifier:apply with a type and a value of the right kind",
            ),
            ApplicationError::Bridge(_) => (
                ErrorCode::SimulationUnavailable,
                "retry shortly; the previous configuration is still in effect",
            ),
        };
        ErrorPayload::new(code, self.to_string(), action)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ChallengeRequest {
    id: Option<String>,
    objectives: Option<Vec<Value>>,
    game_modifiers: Option<ModifierRequest>,
    difficulty: Option<ChallengeDifficulty>,
    time_limit: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ModifierRequest {
    ball_speed_multiplier: Option<f64>,
    paddle_size_multiplier: Option<f64>,
    gravity_enabled: Option<bool>,
    power_up_frequency: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DifficultyRequest {
    level: f64,
}

/// Validate a `challenge:load` payload.
///
/// Unknown keys are ignored. Modifier keys that are absent take their
/// defaults; a challenge replaces the previous one as a whole.
pub fn parse_challenge(payload: Value) -> Result<ChallengeDescriptor, ApplicationError> {
    let request: ChallengeRequest = serde_json::from_value(payload)
        .map_err(|e| ApplicationError::InvalidChallenge(e.to_string()))?;

    let id = request
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApplicationError::InvalidChallenge("id is required".into()))?;

    let requested = request.game_modifiers.unwrap_or_default();
    let defaults = GameModifiers::default();
    let game_modifiers = GameModifiers {
        ball_speed_multiplier: positive(
            "ballSpeedMultiplier",
            requested.ball_speed_multiplier,
            defaults.ball_speed_multiplier,
        )?,
        paddle_size_multiplier: positive(
            "paddleSizeMultiplier",
            requested.paddle_size_multiplier,
            defaults.paddle_size_multiplier,
        )?,
        gravity_enabled: requested.gravity_enabled.unwrap_or(defaults.gravity_enabled),
        power_up_frequency: non_negative(
            "powerUpFrequency",
            requested.power_up_frequency,
            defaults.power_up_frequency,
        )?,
    };

    let time_limit = match request.time_limit {
        Some(limit) if !limit.is_finite() || limit < 0.0 => {
            return Err(ApplicationError::InvalidChallenge(format!(
                "timeLimit must be a non-negative number, got {}",
                limit
            )))
        }
        other => other,
    };

    Ok(ChallengeDescriptor {
        id,
        objectives: request.objectives.unwrap_or_default(),
        game_modifiers,
        difficulty: request.difficulty,
        time_limit,
    })
}

fn positive(name: &str, value: Option<f64>, default: f64) -> Result<f64, ApplicationError> {
    match value {
        None => Ok(default),
        Some(v) if v > 0.0 && v <= MAX_MODIFIER => Ok(v),
        Some(v) => Err(ApplicationError::InvalidChallenge(format!(
            "{} must be in (0, {}], got {}",
            name, MAX_MODIFIER, v
        ))),
    }
}

fn non_negative(name: &str, value: Option<f64>, default: f64) -> Result<f64, ApplicationError> {
    match value {
        None => Ok(default),
        Some(v) if (0.0..=MAX_MODIFIER).contains(&v) => Ok(v),
        Some(v) => Err(ApplicationError::InvalidChallenge(format!(
            "{} must be in [0, {}], got {}",
            name, MAX_MODIFIER, v
        ))),
    }
}

/// Validate a `difficulty:update` payload into a clamped level.
pub fn parse_difficulty(payload: Value) -> Result<DifficultyPayload, ApplicationError> {
    let request: DifficultyRequest = serde_json::from_value(payload)
        .map_err(|e| ApplicationError::InvalidDifficulty(e.to_string()))?;
    let level = clamp_difficulty(request.level);
    Ok(DifficultyPayload {
        level,
        ball_speed_multiplier: speed_multiplier_for(level),
    })
}

/// Validate a `modifier:apply` payload. Unknown types pass through untouched.
pub fn parse_modifier(payload: Value) -> Result<ModifierPayload, ApplicationError> {
    let modifier: ModifierPayload = serde_json::from_value(payload)
        .map_err(|e| ApplicationError::InvalidModifier(e.to_string()))?;

    let valid = match modifier.kind.as_str() {
        "speed_boost" | "paddle_size" | "power_up_frequency" => modifier
            .value
            .as_f64()
            .is_some_and(|v| v > 0.0 && v <= MAX_MODIFIER),
        "gravity" => modifier.value.is_boolean(),
        _ => true,
    };

    if valid {
        Ok(modifier)
    } else {
        Err(ApplicationError::InvalidModifier(format!(
            "unsupported value {} for {}",
            modifier.value, modifier.kind
        )))
    }
}

/// Applies validated configuration to the simulation and announces it.
#[derive(Clone)]
pub struct ChallengeController {
    link: TransportLink,
    broadcaster: Broadcaster,
}

impl ChallengeController {
    /// Create a controller.
    pub fn new(link: TransportLink, broadcaster: Broadcaster) -> Self {
        Self { link, broadcaster }
    }

    /// Handle `challenge:load`.
    pub async fn load_challenge(&self, payload: Value) -> Result<ChallengeDescriptor, ApplicationError> {
        let challenge = parse_challenge(payload)?;

        self.submit(SimCommand::LoadChallenge(Box::new(challenge.clone())))
            .await?;
        info!(id = %challenge.id, "Challenge loaded");

        self.broadcaster
            .broadcast(ServerEvent::ChallengeLoaded, &challenge, true)
            .await;
        Ok(challenge)
    }

    /// Handle `difficulty:update`.
    pub async fn update_difficulty(&self, payload: Value) -> Result<DifficultyPayload, ApplicationError> {
        let difficulty = parse_difficulty(payload)?;

        self.submit(SimCommand::SetDifficulty(difficulty.level)).await?;
        info!(level = difficulty.level, "Difficulty updated");

        self.broadcaster
            .broadcast(ServerEvent::DifficultyUpdated, &difficulty, true)
            .await;
        Ok(difficulty)
    }

    /// Handle `modifier:apply`.
    pub async fn apply_modifier(&self, payload: Value) -> Result<ModifierPayload, ApplicationError> {
        let modifier = parse_modifier(payload)?;

        self.submit(SimCommand::ApplyModifier {
            kind: modifier.kind.clone(),
            value: modifier.value.clone(),
        })
        .await?;
        info!(kind = %modifier.kind, "Modifier applied");

        self.broadcaster
            .broadcast(ServerEvent::ModifierApplied, &modifier, true)
            .await;
        Ok(modifier)
    }

    async fn submit(&self, command: SimCommand) -> Result<(), ApplicationError> {
        self.link.submit(command).await.map_err(|e| {
            warn!(error = %e, "Simulation rejected configuration");
            ApplicationError::Bridge(e)
        })
    }
}
