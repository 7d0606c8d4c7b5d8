//! Cross-Thread Link
//!
//! The only channels between the simulation thread and the transport
//! scheduler:
//!
//! ```text
//!   simulation thread                         transport scheduler
//!   ─────────────────                         ───────────────────
//!   SimulationLink::apply_pending  ◄── cmds ── TransportLink::submit
//!   SimulationLink::publish        ── snap ──► TransportLink::snapshot
//!   SimulationLink::emit           ── evts ──► TransportLink::drain_events
//! ```
//!
//! Commands and events travel on bounded queues and are enqueued with
//! `try_send`, so neither side ever blocks the other. Snapshots live in a
//! single-slot latest-value cell; a reader always gets a whole snapshot.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, warn};

use crate::bridge::error::{panic_message, BridgeError};
use crate::game::simulation::{SimEvent, Simulation};
use crate::game::state::{ChallengeDescriptor, GameSnapshot};

/// Default depth of the transport → simulation command queue.
pub const COMMAND_CAPACITY: usize = 64;

/// Default depth of the simulation → transport event queue.
pub const EVENT_CAPACITY: usize = 256;

/// Default time the transport waits for the simulation to apply a command.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// A configuration write requested by the transport.
///
/// Each variant carries complete values; the simulation swaps them in whole.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCommand {
    /// Replace the current challenge and its modifiers.
    LoadChallenge(Box<ChallengeDescriptor>),
    /// Change difficulty (already clamped).
    SetDifficulty(u8),
    /// Apply one named modifier.
    ApplyModifier {
        /// Modifier name, e.g. `speed_boost`.
        kind: String,
        /// Modifier value as sent by the client.
        value: Value,
    },
}

struct PendingCommand {
    command: SimCommand,
    ack: oneshot::Sender<Result<(), BridgeError>>,
}

/// A simulation event on its way to the scheduler.
#[derive(Debug)]
pub struct BridgedEvent {
    /// The event itself.
    pub event: SimEvent,
    reply: Option<std_mpsc::SyncSender<usize>>,
}

impl BridgedEvent {
    /// Report how many sessions received the event to a waiting submitter.
    pub fn complete(self, delivered: usize) {
        if let Some(reply) = self.reply {
            let _ = reply.try_send(delivered);
        }
    }
}

/// Create a connected pair of link ends with default capacities.
pub fn link() -> (SimulationLink, TransportLink) {
    link_with_capacity(COMMAND_CAPACITY, EVENT_CAPACITY)
}

/// Create a connected pair of link ends.
pub fn link_with_capacity(commands: usize, events: usize) -> (SimulationLink, TransportLink) {
    let (command_tx, command_rx) = mpsc::channel(commands.max(1));
    let (event_tx, event_rx) = mpsc::channel(events.max(1));
    let (snapshot_tx, snapshot_rx) = watch::channel(GameSnapshot::default());

    let simulation = SimulationLink {
        commands: command_rx,
        events: event_tx,
        snapshots: snapshot_tx,
    };
    let transport = TransportLink {
        commands: command_tx,
        events: Arc::new(Mutex::new(event_rx)),
        snapshots: snapshot_rx,
        ack_timeout: ACK_TIMEOUT,
    };
    (simulation, transport)
}

// =============================================================================
// SIMULATION SIDE
// =============================================================================

/// The simulation thread's end of the link.
pub struct SimulationLink {
    commands: mpsc::Receiver<PendingCommand>,
    events: mpsc::Sender<BridgedEvent>,
    snapshots: watch::Sender<GameSnapshot>,
}

impl SimulationLink {
    /// Apply every queued command to `sim`, in arrival order.
    ///
    /// Call between ticks. Commands whose submitter has given up waiting are
    /// discarded unapplied. A panicking command is reported to its submitter
    /// and does not stop the remaining commands or the simulation thread.
    pub fn apply_pending<S: Simulation + ?Sized>(&mut self, sim: &mut S) -> usize {
        let mut applied = 0;
        while let Ok(PendingCommand { command, ack }) = self.commands.try_recv() {
            // The submitter stopped waiting and already reported failure.
            if ack.is_closed() {
                warn!("Dropping abandoned simulation command {:?}", command);
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| match &command {
                SimCommand::LoadChallenge(challenge) => sim.apply_challenge(challenge),
                SimCommand::SetDifficulty(level) => sim.set_difficulty(*level),
                SimCommand::ApplyModifier { kind, value } => sim.apply_modifier(kind, value),
            }));

            let result = outcome.map_err(|payload| {
                let message = panic_message(payload.as_ref());
                error!("Simulation command {:?} panicked: {}", command, message);
                BridgeError::WorkPanicked(message)
            });
            if result.is_ok() {
                applied += 1;
            }
            let _ = ack.send(result);
        }
        applied
    }

    /// Replace the published snapshot.
    pub fn publish(&self, snapshot: GameSnapshot) {
        self.snapshots.send_replace(snapshot);
    }

    /// Hand an event to the scheduler without waiting.
    pub fn emit(&self, event: SimEvent) -> Result<(), BridgeError> {
        self.events
            .try_send(BridgedEvent { event, reply: None })
            .map_err(map_try_send)
    }

    /// Hand an event to the scheduler and block until it has been broadcast,
    /// returning the number of sessions reached.
    ///
    /// Must not be called from the scheduler thread.
    pub fn emit_and_wait(&self, event: SimEvent, timeout: Duration) -> Result<usize, BridgeError> {
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        self.events
            .try_send(BridgedEvent {
                event,
                reply: Some(reply_tx),
            })
            .map_err(map_try_send)?;

        reply_rx.recv_timeout(timeout).map_err(|e| match e {
            std_mpsc::RecvTimeoutError::Timeout => BridgeError::Timeout(timeout),
            std_mpsc::RecvTimeoutError::Disconnected => BridgeError::Disconnected,
        })
    }
}

// =============================================================================
// TRANSPORT SIDE
// =============================================================================

/// The scheduler's end of the link. Cheap to clone.
#[derive(Clone)]
pub struct TransportLink {
    commands: mpsc::Sender<PendingCommand>,
    events: Arc<Mutex<mpsc::Receiver<BridgedEvent>>>,
    snapshots: watch::Receiver<GameSnapshot>,
    ack_timeout: Duration,
}

impl TransportLink {
    /// Override how long [`submit`](Self::submit) waits for the simulation.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Queue a command for the simulation and wait until it has been applied.
    pub async fn submit(&self, command: SimCommand) -> Result<(), BridgeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .try_send(PendingCommand {
                command,
                ack: ack_tx,
            })
            .map_err(map_try_send)?;

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Disconnected),
            Err(_) => {
                warn!("Simulation did not apply command within {:?}", self.ack_timeout);
                Err(BridgeError::Timeout(self.ack_timeout))
            }
        }
    }

    /// Copy of the latest published snapshot.
    pub fn snapshot(&self) -> GameSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Take every event queued by the simulation so far.
    pub async fn drain_events(&self) -> Vec<BridgedEvent> {
        let mut events = self.events.lock().await;
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        if !drained.is_empty() {
            debug!("Drained {} simulation events", drained.len());
        }
        drained
    }
}

fn map_try_send<T>(err: TrySendError<T>) -> BridgeError {
    match err {
        TrySendError::Full(_) => BridgeError::Saturated,
        TrySendError::Closed(_) => BridgeError::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::simulation::RallySimulation;
    use crate::game::state::GameModifiers;

    struct PanickySim;

    impl Simulation for PanickySim {
        fn state(&self) -> GameSnapshot {
            GameSnapshot::default()
        }
        fn apply_challenge(&mut self, _challenge: &ChallengeDescriptor) {
            panic!("challenge rejected by physics");
        }
        fn set_difficulty(&mut self, _level: u8) {}
        fn apply_modifier(&mut self, _kind: &str, _value: &Value) {}
        fn tick(&mut self, _dt: Duration) -> Vec<SimEvent> {
            Vec::new()
        }
    }

    fn started() -> SimEvent {
        SimEvent::GameStarted {
            state: GameSnapshot::default(),
        }
    }

    fn challenge(speed: f64) -> SimCommand {
        SimCommand::LoadChallenge(Box::new(ChallengeDescriptor {
            id: "c1".into(),
            objectives: vec![],
            game_modifiers: GameModifiers {
                ball_speed_multiplier: speed,
                ..GameModifiers::default()
            },
            difficulty: None,
            time_limit: None,
        }))
    }

    #[tokio::test]
    async fn test_submit_is_acknowledged_after_apply() {
        let (mut sim_link, transport) = link();
        let mut sim = RallySimulation::default();

        let submit = tokio::spawn({
            let transport = transport.clone();
            async move { transport.submit(challenge(1.5)).await }
        });
        tokio::task::yield_now().await;

        assert_eq!(sim_link.apply_pending(&mut sim), 1);
        submit.await.unwrap().unwrap();
        assert_eq!(sim.modifiers().ball_speed_multiplier, 1.5);
    }

    #[tokio::test]
    async fn test_submit_times_out_without_simulation() {
        let (_sim_link, transport) = link();
        let transport = transport.with_ack_timeout(Duration::from_millis(20));

        let result = transport.submit(SimCommand::SetDifficulty(3)).await;
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_timed_out_command_is_never_applied() {
        let (mut sim_link, transport) = link();
        let transport = transport.with_ack_timeout(Duration::from_millis(20));

        let result = transport.submit(challenge(3.0)).await;
        assert!(matches!(result, Err(BridgeError::Timeout(_))));

        let mut sim = RallySimulation::default();
        assert_eq!(sim_link.apply_pending(&mut sim), 0);
        assert_eq!(sim.modifiers(), GameModifiers::default());
        assert!(sim.challenge().is_none());
    }

    #[tokio::test]
    async fn test_submit_after_simulation_dropped() {
        let (sim_link, transport) = link();
        drop(sim_link);

        let result = transport.submit(SimCommand::SetDifficulty(3)).await;
        assert!(matches!(result, Err(BridgeError::Disconnected)));
    }

    #[tokio::test]
    async fn test_full_command_queue_is_saturated() {
        let (_sim_link, transport) = link_with_capacity(1, 1);
        let transport = transport.with_ack_timeout(Duration::from_millis(50));

        let first = tokio::spawn({
            let transport = transport.clone();
            async move { transport.submit(SimCommand::SetDifficulty(2)).await }
        });
        tokio::task::yield_now().await;

        let second = transport.submit(SimCommand::SetDifficulty(3)).await;
        assert!(matches!(second, Err(BridgeError::Saturated)));
        assert!(first.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_panicking_command_is_contained() {
        let (mut sim_link, transport) = link();
        let mut sim = PanickySim;

        let failing = tokio::spawn({
            let transport = transport.clone();
            async move { transport.submit(challenge(2.0)).await }
        });
        let fine = tokio::spawn({
            let transport = transport.clone();
            async move { transport.submit(SimCommand::SetDifficulty(4)).await }
        });
        tokio::task::yield_now().await;

        assert_eq!(sim_link.apply_pending(&mut sim), 1);
        assert!(matches!(
            failing.await.unwrap(),
            Err(BridgeError::WorkPanicked(msg)) if msg.contains("rejected by physics")
        ));
        assert!(fine.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_publish_and_read() {
        let (sim_link, transport) = link();
        assert_eq!(transport.snapshot(), GameSnapshot::default());

        sim_link.publish(GameSnapshot {
            score: 42,
            is_playing: true,
            ..GameSnapshot::default()
        });

        let snapshot = transport.snapshot();
        assert_eq!(snapshot.score, 42);
        assert!(snapshot.is_playing);
    }

    #[tokio::test]
    async fn test_emit_and_drain() {
        let (sim_link, transport) = link();
        sim_link.emit(started()).unwrap();
        sim_link
            .emit(SimEvent::BallHit {
                balls_hit: 1,
                speed: 1.0,
            })
            .unwrap();

        let events = transport.drain_events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, started());
        assert!(transport.drain_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_emit_on_full_queue_is_saturated() {
        let (sim_link, _transport) = link_with_capacity(1, 1);
        sim_link.emit(started()).unwrap();
        assert!(matches!(
            sim_link.emit(started()),
            Err(BridgeError::Saturated)
        ));
    }

    #[tokio::test]
    async fn test_emit_and_wait_gets_delivery_count() {
        let (sim_link, transport) = link();

        let waiter = std::thread::spawn(move || {
            sim_link.emit_and_wait(started(), Duration::from_secs(2))
        });

        let mut drained = Vec::new();
        for _ in 0..200 {
            drained = transport.drain_events().await;
            if !drained.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let event = drained.pop().unwrap();
        event.complete(3);

        assert_eq!(waiter.join().unwrap().unwrap(), 3);
    }

    #[test]
    fn test_emit_and_wait_times_out() {
        let (sim_link, _transport) = link();
        let result = sim_link.emit_and_wait(started(), Duration::from_millis(20));
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
    }
}
