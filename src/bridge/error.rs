//! Bridge Errors

use std::any::Any;
use std::time::Duration;

/// Failures crossing between the simulation thread and the transport
/// scheduler, and failures bringing the scheduler up or down.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The other side of the link has gone away.
    #[error("bridge peer disconnected")]
    Disconnected,

    /// The bounded queue is full; the work was not enqueued.
    #[error("bridge queue is full")]
    Saturated,

    /// No result arrived within the allowed time.
    #[error("bridge work timed out after {0:?}")]
    Timeout(Duration),

    /// The submitted work panicked on the receiving side.
    #[error("bridged work panicked: {0}")]
    WorkPanicked(String),

    /// Binding the listener failed for a reason other than a port conflict.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was tried.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Every candidate port was already taken.
    #[error("no free port on {host}: {attempts} consecutive ports from {first_port} are in use")]
    PortsExhausted {
        /// Host that was tried.
        host: String,
        /// First port tried.
        first_port: u16,
        /// Number of consecutive ports tried.
        attempts: u16,
    },

    /// `start` was called on a bridge that is already running.
    #[error("bridge is already running")]
    AlreadyRunning,

    /// Building the scheduler or spawning its thread failed.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
