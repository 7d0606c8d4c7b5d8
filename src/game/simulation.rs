//! Simulation Collaborator
//!
//! The interface the bridge drives, plus `RallySimulation`, a scripted
//! stand-in used by the binary and the tests. Ball and paddle physics live
//! outside this crate; the stand-in only produces believable counters.

use std::time::Duration;

use serde_json::Value;

use crate::game::state::{
    speed_multiplier_for, ChallengeDescriptor, GameModifiers, GameSnapshot, MAX_DIFFICULTY,
    MIN_DIFFICULTY,
};

/// Most paddle hits a single frame can produce. Progress beyond this is dropped.
pub const MAX_HITS_PER_TICK: u64 = 32;

/// Something that happened inside the simulation and should reach clients.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// A game began.
    GameStarted {
        /// State at the moment the game began.
        state: GameSnapshot,
    },
    /// A game finished.
    GameEnded {
        /// Final score.
        score: u64,
        /// Final hit count.
        balls_hit: u64,
    },
    /// The ball touched a paddle.
    BallHit {
        /// Hit count after this hit.
        balls_hit: u64,
        /// Ball speed multiplier at the time of the hit.
        speed: f64,
    },
    /// A power-up was picked up.
    PowerUpCollected {
        /// Total collected this game.
        total: u64,
    },
}

/// The simulation as seen by the bridge.
///
/// Every method is called from the simulation thread only, by
/// [`SimulationRunner`](crate::game::runner::SimulationRunner), between ticks.
pub trait Simulation: Send + 'static {
    /// Copy of the current state.
    fn state(&self) -> GameSnapshot;

    /// Make `challenge` the current challenge, replacing any previous one.
    fn apply_challenge(&mut self, challenge: &ChallengeDescriptor);

    /// Change difficulty. `level` is already clamped.
    fn set_difficulty(&mut self, level: u8);

    /// Apply a single named modifier. Unknown kinds are ignored.
    fn apply_modifier(&mut self, kind: &str, value: &Value);

    /// Advance one frame.
    fn tick(&mut self, dt: Duration) -> Vec<SimEvent>;
}

/// Tuning for [`RallySimulation`].
#[derive(Debug, Clone)]
pub struct RallyConfig {
    /// Time between paddle hits at speed multiplier 1.0.
    pub hit_period: Duration,
    /// Points per hit.
    pub points_per_hit: u64,
    /// Hits between power-ups at frequency 1.0.
    pub power_up_every: u64,
    /// Points per power-up.
    pub power_up_points: u64,
}

impl Default for RallyConfig {
    fn default() -> Self {
        Self {
            hit_period: Duration::from_millis(800),
            points_per_hit: 10,
            power_up_every: 5,
            power_up_points: 50,
        }
    }
}

/// Scripted rally: the ball is hit at a steady rate scaled by the speed
/// multiplier, with periodic power-ups.
#[derive(Debug)]
pub struct RallySimulation {
    config: RallyConfig,
    score: u64,
    balls_hit: u64,
    power_ups_collected: u64,
    game_time: f64,
    is_playing: bool,
    modifiers: GameModifiers,
    challenge: Option<ChallengeDescriptor>,
    difficulty: u8,
    hit_progress: f64,
    pending: Vec<SimEvent>,
}

impl RallySimulation {
    /// Create an idle simulation.
    pub fn new(config: RallyConfig) -> Self {
        Self {
            config,
            score: 0,
            balls_hit: 0,
            power_ups_collected: 0,
            game_time: 0.0,
            is_playing: false,
            modifiers: GameModifiers::default(),
            challenge: None,
            difficulty: MIN_DIFFICULTY,
            hit_progress: 0.0,
            pending: Vec::new(),
        }
    }

    /// Reset counters and begin a game. `GameStarted` is reported on the next tick.
    pub fn start_game(&mut self) {
        self.score = 0;
        self.balls_hit = 0;
        self.power_ups_collected = 0;
        self.game_time = 0.0;
        self.hit_progress = 0.0;
        self.is_playing = true;
        let state = self.state();
        self.pending.push(SimEvent::GameStarted { state });
    }

    /// Stop the current game, if any.
    pub fn end_game(&mut self) {
        if self.is_playing {
            self.is_playing = false;
            self.pending.push(SimEvent::GameEnded {
                score: self.score,
                balls_hit: self.balls_hit,
            });
        }
    }

    /// Modifiers currently in force.
    pub fn modifiers(&self) -> GameModifiers {
        self.modifiers
    }

    /// Current difficulty level.
    pub fn difficulty(&self) -> u8 {
        self.difficulty
    }

    /// Currently loaded challenge.
    pub fn challenge(&self) -> Option<&ChallengeDescriptor> {
        self.challenge.as_ref()
    }

    fn hits_per_power_up(&self) -> Option<u64> {
        let frequency = self.modifiers.power_up_frequency;
        if frequency <= 0.0 || self.config.power_up_every == 0 {
            return None;
        }
        Some(((self.config.power_up_every as f64 / frequency).round() as u64).max(1))
    }

    fn time_limit_reached(&self) -> bool {
        self.challenge
            .as_ref()
            .and_then(|c| c.time_limit)
            .map(|limit| limit > 0.0 && self.game_time >= limit)
            .unwrap_or(false)
    }
}

impl Default for RallySimulation {
    fn default() -> Self {
        Self::new(RallyConfig::default())
    }
}

impl Simulation for RallySimulation {
    fn state(&self) -> GameSnapshot {
        GameSnapshot {
            score: self.score,
            balls_hit: self.balls_hit,
            power_ups_collected: self.power_ups_collected,
            game_time: self.game_time,
            is_playing: self.is_playing,
            challenge_active: self.challenge.is_some(),
            challenge_modifiers: self.modifiers,
        }
    }

    fn apply_challenge(&mut self, challenge: &ChallengeDescriptor) {
        self.modifiers = challenge.game_modifiers;
        self.challenge = Some(challenge.clone());
        self.end_game();
        self.start_game();
    }

    fn set_difficulty(&mut self, level: u8) {
        self.difficulty = level.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY);
        self.modifiers = GameModifiers {
            ball_speed_multiplier: speed_multiplier_for(self.difficulty),
            ..self.modifiers
        };
    }

    fn apply_modifier(&mut self, kind: &str, value: &Value) {
        let current = self.modifiers;
        let next = match (kind, value) {
            ("speed_boost", v) => v.as_f64().map(|speed| GameModifiers {
                ball_speed_multiplier: speed,
                ..current
            }),
            ("paddle_size", v) => v.as_f64().map(|size| GameModifiers {
                paddle_size_multiplier: size,
                ..current
            }),
            ("power_up_frequency", v) => v.as_f64().map(|frequency| GameModifiers {
                power_up_frequency: frequency,
                ..current
            }),
            ("gravity", Value::Bool(enabled)) => Some(GameModifiers {
                gravity_enabled: *enabled,
                ..current
            }),
            _ => None,
        };
        if let Some(next) = next {
            self.modifiers = next;
        }
    }

    fn tick(&mut self, dt: Duration) -> Vec<SimEvent> {
        let mut events = std::mem::take(&mut self.pending);
        if !self.is_playing {
            return events;
        }

        let secs = dt.as_secs_f64();
        self.game_time += secs;

        let period = self.config.hit_period.as_secs_f64().max(0.001);
        self.hit_progress += secs * self.modifiers.ball_speed_multiplier / period;
        if !self.hit_progress.is_finite() || self.hit_progress < 0.0 {
            self.hit_progress = 0.0;
        }

        let whole = self.hit_progress.floor();
        self.hit_progress -= whole;
        let hits = (whole as u64).min(MAX_HITS_PER_TICK);

        for _ in 0..hits {
            self.balls_hit += 1;
            self.score += self.config.points_per_hit;
            events.push(SimEvent::BallHit {
                balls_hit: self.balls_hit,
                speed: self.modifiers.ball_speed_multiplier,
            });

            if let Some(every) = self.hits_per_power_up() {
                if self.balls_hit % every == 0 {
                    self.power_ups_collected += 1;
                    self.score += self.config.power_up_points;
                    events.push(SimEvent::PowerUpCollected {
                        total: self.power_ups_collected,
                    });
                }
            }
        }

        if self.time_limit_reached() {
            self.end_game();
            events.append(&mut self.pending);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::ChallengeDifficulty;

    fn challenge(id: &str, speed: f64, time_limit: Option<f64>) -> ChallengeDescriptor {
        ChallengeDescriptor {
            id: id.into(),
            objectives: vec![],
            game_modifiers: GameModifiers {
                ball_speed_multiplier: speed,
                ..GameModifiers::default()
            },
            difficulty: Some(ChallengeDifficulty::Named("normal".into())),
            time_limit,
        }
    }

    #[test]
    fn test_idle_simulation_does_not_score() {
        let mut sim = RallySimulation::default();
        let events = sim.tick(Duration::from_secs(5));
        assert!(events.is_empty());
        assert_eq!(sim.state().score, 0);
        assert_eq!(sim.state().game_time, 0.0);
    }

    #[test]
    fn test_rally_scores_hits() {
        let mut sim = RallySimulation::new(RallyConfig {
            hit_period: Duration::from_secs(1),
            ..Default::default()
        });
        sim.start_game();

        let events = sim.tick(Duration::from_millis(2500));
        assert!(matches!(
            &events[0],
            SimEvent::GameStarted { state } if state.is_playing && state.score == 0
        ));

        let state = sim.state();
        assert_eq!(state.balls_hit, 2);
        assert_eq!(state.score, 20);
        assert!(state.is_playing);
    }

    #[test]
    fn test_power_up_every_fifth_hit() {
        let mut sim = RallySimulation::new(RallyConfig {
            hit_period: Duration::from_secs(1),
            ..Default::default()
        });
        sim.start_game();
        let events = sim.tick(Duration::from_secs(5));

        assert!(events.contains(&SimEvent::PowerUpCollected { total: 1 }));
        assert_eq!(sim.state().score, 5 * 10 + 50);
    }

    #[test]
    fn test_apply_challenge_replaces_modifiers_and_restarts() {
        let mut sim = RallySimulation::default();
        sim.start_game();
        sim.tick(Duration::from_secs(3));

        sim.apply_challenge(&challenge("c1", 1.5, None));

        let state = sim.state();
        assert!(state.challenge_active);
        assert!(state.is_playing);
        assert_eq!(state.score, 0);
        assert_eq!(state.challenge_modifiers.ball_speed_multiplier, 1.5);
        assert_eq!(sim.challenge().map(|c| c.id.as_str()), Some("c1"));
    }

    #[test]
    fn test_time_limit_ends_game() {
        let mut sim = RallySimulation::default();
        sim.apply_challenge(&challenge("timed", 1.0, Some(2.0)));

        let first = sim.tick(Duration::from_secs(1));
        assert!(matches!(
            first.first(),
            Some(SimEvent::GameStarted { state }) if state.challenge_active
        ));

        let second = sim.tick(Duration::from_secs(1));
        assert!(second.iter().any(|e| matches!(e, SimEvent::GameEnded { .. })));
        assert!(!sim.state().is_playing);
    }

    #[test]
    fn test_set_difficulty_derives_speed() {
        let mut sim = RallySimulation::default();
        sim.set_difficulty(5);
        assert_eq!(sim.difficulty(), 5);
        assert_eq!(sim.modifiers().ball_speed_multiplier, 2.0);
        assert_eq!(sim.modifiers().paddle_size_multiplier, 1.0);
    }

    #[test]
    fn test_apply_modifier_known_and_unknown() {
        let mut sim = RallySimulation::default();
        sim.apply_modifier("speed_boost", &serde_json::json!(1.5));
        sim.apply_modifier("gravity", &serde_json::json!(true));
        sim.apply_modifier("confetti", &serde_json::json!("lots"));

        let modifiers = sim.modifiers();
        assert_eq!(modifiers.ball_speed_multiplier, 1.5);
        assert!(modifiers.gravity_enabled);
        assert_eq!(modifiers.power_up_frequency, 1.0);
    }

    #[test]
    fn test_huge_speed_is_bounded_per_tick() {
        let mut sim = RallySimulation::default();
        sim.apply_challenge(&challenge("runaway", 1e20, None));

        let events = sim.tick(Duration::from_millis(17));
        let hits = events
            .iter()
            .filter(|e| matches!(e, SimEvent::BallHit { .. }))
            .count() as u64;
        assert_eq!(hits, MAX_HITS_PER_TICK);
        assert_eq!(sim.state().balls_hit, MAX_HITS_PER_TICK);

        sim.apply_modifier("speed_boost", &serde_json::json!(1e300));
        sim.tick(Duration::from_millis(17));
        assert_eq!(sim.state().balls_hit, 2 * MAX_HITS_PER_TICK);
    }

    #[test]
    fn test_zero_power_up_frequency_disables_power_ups() {
        let mut sim = RallySimulation::new(RallyConfig {
            hit_period: Duration::from_secs(1),
            ..Default::default()
        });
        sim.apply_modifier("power_up_frequency", &serde_json::json!(0.0));
        sim.start_game();
        sim.tick(Duration::from_secs(10));
        assert_eq!(sim.state().power_ups_collected, 0);
    }
}
