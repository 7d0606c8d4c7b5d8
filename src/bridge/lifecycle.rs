//! Bridge Lifecycle
//!
//! Owns the transport scheduler: a single-threaded tokio runtime on its own
//! OS thread, hosting the accept loop and the polling loop as independent
//! tasks. `start` binds, spawns, and returns the bound port. `stop` signals
//! shutdown and joins the thread with a bounded timeout.

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bridge::error::BridgeError;
use crate::bridge::link::TransportLink;
use crate::config::BridgeConfig;
use crate::network::auth::Authenticator;
use crate::network::server::BridgeServer;

/// Poll period while waiting for the scheduler thread to exit.
const JOIN_POLL: Duration = Duration::from_millis(10);

struct RunningBridge {
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
    thread: JoinHandle<()>,
    port_file: Option<PathBuf>,
}

/// The transport half of the bridge.
pub struct SyncBridge {
    config: BridgeConfig,
    link: TransportLink,
    authenticator: Authenticator,
    running: Option<RunningBridge>,
}

impl SyncBridge {
    /// Create a stopped bridge.
    pub fn new(config: BridgeConfig, link: TransportLink, authenticator: Authenticator) -> Self {
        Self {
            config,
            link,
            authenticator,
            running: None,
        }
    }

    /// Start on the configured host and port.
    pub fn start_configured(&mut self) -> Result<u16, BridgeError> {
        let host = self.config.host.clone();
        let port = self.config.port;
        self.start(&host, port)
    }

    /// Bind `host:port` (advancing on conflicts), spawn the scheduler thread,
    /// and return the bound port.
    pub fn start(&mut self, host: &str, port: u16) -> Result<u16, BridgeError> {
        if self.running.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }

        let (listener, port) = bind_with_retry(host, port, self.config.port_attempts)?;
        listener.set_nonblocking(true)?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let server = BridgeServer::new(
            self.config.clone(),
            self.link.clone(),
            self.authenticator.clone(),
            shutdown_tx.clone(),
        );
        let polling = server.polling_loop();
        let polling_shutdown = shutdown_tx.subscribe();

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<io::Result<()>>(1);
        let thread = thread::Builder::new()
            .name("bridge-scheduler".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));

                    let polling = tokio::spawn(polling.run(polling_shutdown));
                    server.run(listener).await;
                    let _ = polling.await;
                });
                debug!("Scheduler thread exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(BridgeError::Runtime(e));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(BridgeError::Disconnected);
            }
        }

        let port_file = self.config.port_file.clone();
        if let Some(path) = &port_file {
            write_port_file(path, port);
        }

        info!("Bridge listening on {}:{}", host, port);
        self.running = Some(RunningBridge {
            port,
            shutdown_tx,
            thread,
            port_file,
        });
        Ok(port)
    }

    /// Signal shutdown and wait up to the join timeout for the scheduler
    /// thread. Never panics; calling it on a stopped bridge does nothing.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(());

        let deadline = Instant::now() + self.config.join_timeout;
        while !running.thread.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }

        if running.thread.is_finished() {
            match running.thread.join() {
                Ok(()) => info!("Bridge on port {} stopped", running.port),
                Err(_) => error!("Bridge scheduler thread panicked"),
            }
        } else {
            error!(
                "Bridge scheduler did not stop within {:?}; detaching",
                self.config.join_timeout
            );
        }

        if let Some(path) = running.port_file {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("Could not remove port file {}: {}", path.display(), e);
            }
        }
    }

    /// Whether the scheduler thread is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.thread.is_finished())
            .unwrap_or(false)
    }

    /// Bound port while running.
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the first free port among `attempts` consecutive ports from `first_port`.
///
/// Only `AddrInUse` advances to the next port; any other error fails at once.
pub fn bind_with_retry(
    host: &str,
    first_port: u16,
    attempts: u16,
) -> Result<(StdTcpListener, u16), BridgeError> {
    for offset in 0..attempts.max(1) {
        let Some(port) = first_port.checked_add(offset) else {
            break;
        };

        match StdTcpListener::bind((host, port)) {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                if offset > 0 {
                    info!("Port {} in use, bound {} instead", first_port, bound);
                }
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!("Port {} on {} is in use", port, host);
            }
            Err(e) => {
                return Err(BridgeError::Bind {
                    addr: format!("{}:{}", host, port),
                    source: e,
                });
            }
        }
    }

    Err(BridgeError::PortsExhausted {
        host: host.to_string(),
        first_port,
        attempts,
    })
}

fn write_port_file(path: &Path, port: u16) {
    match std::fs::write(path, port.to_string()) {
        Ok(()) => debug!("Wrote port {} to {}", port, path.display()),
        Err(e) => warn!("Failed to write port file {}: {}", path.display(), e),
    }
}
