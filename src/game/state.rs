//! Game State Types
//!
//! Values that cross between the simulation thread and the transport.
//! Everything here is plain data: cloned when it crosses, never shared.

use serde::{Deserialize, Serialize};

/// Lowest accepted difficulty level.
pub const MIN_DIFFICULTY: u8 = 1;

/// Highest accepted difficulty level.
pub const MAX_DIFFICULTY: u8 = 5;

/// Ball speed gained per difficulty level above the minimum.
pub const SPEED_PER_LEVEL: f64 = 0.25;

/// Largest accepted value for any modifier multiplier or frequency.
pub const MAX_MODIFIER: f64 = 10.0;

/// Immutable point-in-time copy of the simulation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    /// Current score.
    pub score: u64,
    /// Paddle contacts this game.
    pub balls_hit: u64,
    /// Power-ups collected this game.
    pub power_ups_collected: u64,
    /// Seconds of play elapsed.
    pub game_time: f64,
    /// Whether a game is in progress.
    pub is_playing: bool,
    /// Whether a challenge is currently loaded.
    pub challenge_active: bool,
    /// Modifiers the simulation is running with.
    pub challenge_modifiers: GameModifiers,
}

impl Default for GameSnapshot {
    fn default() -> Self {
        Self {
            score: 0,
            balls_hit: 0,
            power_ups_collected: 0,
            game_time: 0.0,
            is_playing: false,
            challenge_active: false,
            challenge_modifiers: GameModifiers::default(),
        }
    }
}

/// Tunable parameters perturbing the simulation.
///
/// Always replaced as a whole value; no code path edits one field of the
/// live struct in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameModifiers {
    /// Ball speed relative to base speed.
    pub ball_speed_multiplier: f64,
    /// Paddle size relative to base size.
    pub paddle_size_multiplier: f64,
    /// Whether the ball is pulled downwards.
    pub gravity_enabled: bool,
    /// Power-up spawn rate relative to base rate (0 disables).
    pub power_up_frequency: f64,
}

impl Default for GameModifiers {
    fn default() -> Self {
        Self {
            ball_speed_multiplier: 1.0,
            paddle_size_multiplier: 1.0,
            gravity_enabled: false,
            power_up_frequency: 1.0,
        }
    }
}

/// Difficulty attached to a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChallengeDifficulty {
    /// Numeric level.
    Level(f64),
    /// Named level such as `"hard"`.
    Named(String),
}

/// A named bundle of objectives and modifiers, active until replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeDescriptor {
    /// Challenge identifier chosen by the client.
    pub id: String,
    /// Objectives, interpreted by the simulation.
    pub objectives: Vec<serde_json::Value>,
    /// Modifiers to run the challenge with.
    pub game_modifiers: GameModifiers,
    /// Optional difficulty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<ChallengeDifficulty>,
    /// Optional time limit in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<f64>,
}

/// Clamp an arbitrary level input into `[MIN_DIFFICULTY, MAX_DIFFICULTY]`.
pub fn clamp_difficulty(level: f64) -> u8 {
    if level.is_nan() {
        return MIN_DIFFICULTY;
    }
    level
        .round()
        .clamp(MIN_DIFFICULTY as f64, MAX_DIFFICULTY as f64) as u8
}

/// Ball speed multiplier for a difficulty level.
pub fn speed_multiplier_for(level: u8) -> f64 {
    let level = level.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY);
    1.0 + f64::from(level - MIN_DIFFICULTY) * SPEED_PER_LEVEL
}
