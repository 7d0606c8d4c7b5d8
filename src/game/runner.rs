//! Simulation Runner
//!
//! Hosts the blocking tick loop on its own thread. Each frame:
//!
//! 1. apply queued configuration commands (tick boundary)
//! 2. advance the simulation
//! 3. publish a fresh snapshot
//! 4. forward events to the transport
//! 5. sleep the remainder of the frame
//!
//! The loop never suspends mid-tick and never touches transport state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::bridge::error::BridgeError;
use crate::bridge::link::SimulationLink;
use crate::game::simulation::Simulation;

/// Default frame interval (60 Hz).
pub const FRAME_INTERVAL: Duration = Duration::from_micros(16_667);

/// Handle to a running simulation thread.
pub struct SimulationRunner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimulationRunner {
    /// Spawn the tick loop for `sim` on a dedicated thread.
    pub fn spawn<S: Simulation>(
        sim: S,
        link: SimulationLink,
        frame: Duration,
    ) -> Result<Self, BridgeError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = thread::Builder::new()
            .name("simulation".into())
            .spawn(move || run_loop(sim, link, frame, flag))?;

        info!("Simulation thread started ({:?} per frame)", frame);
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the tick loop is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Ask the loop to finish its current frame and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Simulation thread panicked");
            } else {
                info!("Simulation thread stopped");
            }
        }
    }
}

impl Drop for SimulationRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<S: Simulation>(mut sim: S, mut link: SimulationLink, frame: Duration, stop: Arc<AtomicBool>) {
    let mut dropped_events = 0u64;
    link.publish(sim.state());

    while !stop.load(Ordering::Acquire) {
        let started = Instant::now();

        let applied = link.apply_pending(&mut sim);
        if applied > 0 {
            debug!("Applied {} commands at tick boundary", applied);
        }

        let events = sim.tick(frame);
        link.publish(sim.state());

        for event in events {
            if let Err(e) = link.emit(event) {
                dropped_events += 1;
                if dropped_events == 1 || dropped_events % 100 == 0 {
                    warn!("Dropped simulation event ({} total): {}", dropped_events, e);
                }
            }
        }

        if let Some(rest) = frame.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }
}
