//! Polling Loop
//!
//! Runs on the transport scheduler at a fixed cadence. Each iteration drains
//! simulation events and broadcasts them, then pulls the latest snapshot and
//! broadcasts score changes while a game is in progress.
//!
//! This loop is the only producer of simulation-originated broadcasts, so
//! their relative order matches the order the simulation emitted them.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::bridge::error::panic_message;
use crate::bridge::link::TransportLink;
use crate::game::simulation::SimEvent;
use crate::game::state::GameSnapshot;
use crate::network::broadcast::Broadcaster;
use crate::network::protocol::{snapshot_payload, ScoreDelta, ScoreUpdate, ServerEvent};

/// Last broadcast counter values, used to compute `score:updated` deltas.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScoreCache {
    score: u64,
    balls_hit: u64,
    power_ups_collected: u64,
}

impl ScoreCache {
    /// Record `snapshot` and return an update if any counter changed.
    pub fn update(&mut self, snapshot: &GameSnapshot) -> Option<ScoreUpdate> {
        let next = ScoreCache {
            score: snapshot.score,
            balls_hit: snapshot.balls_hit,
            power_ups_collected: snapshot.power_ups_collected,
        };
        if next == *self {
            return None;
        }

        let delta = ScoreDelta {
            score: diff(next.score, self.score),
            balls_hit: diff(next.balls_hit, self.balls_hit),
            power_ups_collected: diff(next.power_ups_collected, self.power_ups_collected),
        };
        *self = next;

        Some(ScoreUpdate {
            score: snapshot.score,
            balls_hit: snapshot.balls_hit,
            power_ups_collected: snapshot.power_ups_collected,
            game_time: snapshot.game_time,
            delta,
        })
    }

    /// Forget cached values (a new game starts from zero).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn diff(now: u64, before: u64) -> i64 {
    (now as i128 - before as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Wire form of a simulation event.
pub fn event_message(event: &SimEvent) -> (ServerEvent, Value) {
    match event {
        SimEvent::GameStarted { state } => (ServerEvent::GameStarted, snapshot_payload(state)),
        SimEvent::GameEnded { score, balls_hit } => (
            ServerEvent::GameEnded,
            json!({ "score": score, "balls_hit": balls_hit }),
        ),
        SimEvent::BallHit { balls_hit, speed } => (
            ServerEvent::BallHit,
            json!({ "balls_hit": balls_hit, "speed": speed }),
        ),
        SimEvent::PowerUpCollected { total } => (
            ServerEvent::PowerUpCollected,
            json!({ "power_ups_collected": total }),
        ),
    }
}

/// Fixed-cadence snapshot pull and broadcast.
pub struct PollingLoop {
    link: TransportLink,
    broadcaster: Broadcaster,
    interval: Duration,
    cache: ScoreCache,
}

impl PollingLoop {
    /// Create a polling loop.
    pub fn new(link: TransportLink, broadcaster: Broadcaster, interval: Duration) -> Self {
        Self {
            link,
            broadcaster,
            interval,
            cache: ScoreCache::default(),
        }
    }

    /// Run until `shutdown` fires. A panicking iteration is logged and the
    /// loop carries on at the next tick.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Polling loop started ({:?} interval)", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Polling loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(message) = guarded(self.poll_once()).await {
                        error!("Polling iteration panicked: {}", message);
                    }
                }
            }
        }
    }

    /// One iteration. Returns the number of frames broadcast.
    pub async fn poll_once(&mut self) -> usize {
        let mut sent = 0;

        for bridged in self.link.drain_events().await {
            if matches!(bridged.event, SimEvent::GameStarted { .. }) {
                self.cache.reset();
            }
            let (kind, payload) = event_message(&bridged.event);
            let delivered = self.broadcaster.broadcast(kind, &payload, true).await;
            bridged.complete(delivered);
            sent += 1;
        }

        let snapshot = self.link.snapshot();
        if snapshot.is_playing {
            if let Some(update) = self.cache.update(&snapshot) {
                debug!(score = update.score, "Score changed");
                self.broadcaster
                    .broadcast(ServerEvent::ScoreUpdated, &update, true)
                    .await;
                sent += 1;
            }
        }

        sent
    }
}

/// Run `work`, converting a panic into its message.
async fn guarded<F, T>(work: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}
