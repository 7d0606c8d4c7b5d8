//! Broadcast Engine
//!
//! Fan-out of envelopes to session outbound queues. A frame is serialized
//! once and shared by every recipient. A session whose queue is closed or
//! full is logged and skipped; the rest still receive the frame.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::network::protocol::{Envelope, ErrorPayload, ServerEvent};
use crate::network::session::{ConnectionId, SessionRegistry};

/// Per-session delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// No session with this id.
    #[error("unknown session {0}")]
    UnknownSession(ConnectionId),
    /// The session's writer has gone away.
    #[error("session {0} is closed")]
    Closed(ConnectionId),
    /// The session is not draining its queue.
    #[error("session {0} outbound queue is full")]
    QueueFull(ConnectionId),
    /// Payload could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Sends envelopes to sessions in the registry.
#[derive(Clone)]
pub struct Broadcaster {
    sessions: Arc<RwLock<SessionRegistry>>,
}

impl Broadcaster {
    /// Create a broadcaster over `sessions`.
    pub fn new(sessions: Arc<RwLock<SessionRegistry>>) -> Self {
        Self { sessions }
    }

    /// Send `payload` to every authenticated session, or to every session
    /// when `auth_required` is false. Returns the number of sessions reached.
    pub async fn broadcast<P: Serialize>(
        &self,
        kind: ServerEvent,
        payload: &P,
        auth_required: bool,
    ) -> usize {
        let frame = match encode(kind, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%kind, error = %e, "failed to serialize broadcast");
                return 0;
            }
        };

        let recipients = self.sessions.read().await.recipients(auth_required);
        let total = recipients.len();
        let mut delivered = 0;

        for (id, outbound) in recipients {
            match deliver(id, &outbound, Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%kind, error = %e, "broadcast delivery failed"),
            }
        }

        debug!(%kind, delivered, total, "broadcast");
        delivered
    }

    /// Send one envelope to one session.
    pub async fn send_to_client<P: Serialize>(
        &self,
        id: ConnectionId,
        kind: ServerEvent,
        payload: &P,
    ) -> Result<(), ConnectionError> {
        let frame = encode(kind, payload)?;
        let outbound = self
            .sessions
            .read()
            .await
            .get(&id)
            .map(|s| s.outbound().clone())
            .ok_or(ConnectionError::UnknownSession(id))?;
        deliver(id, &outbound, frame)
    }

    /// Send a structured `error` to one session.
    pub async fn send_error(
        &self,
        id: ConnectionId,
        error: ErrorPayload,
    ) -> Result<(), ConnectionError> {
        self.send_to_client(id, ServerEvent::Error, &error).await
    }
}

fn encode<P: Serialize>(kind: ServerEvent, payload: &P) -> Result<Arc<str>, serde_json::Error> {
    let payload: Value = serde_json::to_value(payload)?;
    let json = Envelope::new(kind, payload).to_json()?;
    Ok(Arc::from(json))
}

fn deliver(
    id: ConnectionId,
    outbound: &mpsc::Sender<Arc<str>>,
    frame: Arc<str>,
) -> Result<(), ConnectionError> {
    outbound.try_send(frame).map_err(|e| match e {
        TrySendError::Full(_) => ConnectionError::QueueFull(id),
        TrySendError::Closed(_) => ConnectionError::Closed(id),
    })
}
