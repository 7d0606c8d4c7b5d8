//! Pong Bridge
//!
//! Runs the scripted rally simulation on its own thread and serves it to
//! WebSocket clients until interrupted.

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pong_bridge::{
    game::FRAME_INTERVAL, link, Authenticator, BridgeConfig, RallySimulation, SimulationRunner,
    SyncBridge, VERSION,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Pong Bridge v{}", VERSION);

    let config = BridgeConfig::from_env();
    if let Some(warning) = config.unshared_secret_warning() {
        warn!("{}", warning);
    }
    let authenticator = Authenticator::from_config(&config);

    let (sim_link, transport) = link();

    let mut simulation = RallySimulation::default();
    simulation.start_game();
    let mut runner = SimulationRunner::spawn(simulation, sim_link, FRAME_INTERVAL)
        .context("failed to start simulation thread")?;

    let mut bridge = SyncBridge::new(config, transport, authenticator);
    let port = bridge
        .start_configured()
        .context("failed to start bridge")?;
    info!("Serving on port {} (Ctrl-C to stop)", port);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;

    info!("Shutting down");
    bridge.stop();
    runner.stop();
    Ok(())
}
