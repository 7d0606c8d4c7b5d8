//! Session Registry
//!
//! Bookkeeping for live connections: who is connected, whether they have
//! authenticated, and the handles needed to reach or close them.
//!
//! The registry lives behind an `RwLock` shared by tasks of the transport
//! scheduler only. The simulation thread never sees it.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Authentication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// Waiting for `auth:token`.
    Pending,
    /// Credentials accepted.
    Authenticated,
    /// Credentials rejected. Terminal.
    Failed,
}

/// One live connection.
#[derive(Debug)]
pub struct Session {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Peer address.
    pub addr: SocketAddr,
    /// Authentication state.
    pub status: AuthStatus,
    /// Token presented on successful authentication.
    pub token: Option<String>,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    /// Last inbound frame.
    pub last_activity: Instant,
    outbound: mpsc::Sender<Arc<str>>,
    close: Option<oneshot::Sender<()>>,
    auth_timeout: Option<AbortHandle>,
}

impl Session {
    /// Whether the session passed authentication.
    pub fn is_authenticated(&self) -> bool {
        self.status == AuthStatus::Authenticated
    }

    /// Queue handle for frames bound to this session.
    pub fn outbound(&self) -> &mpsc::Sender<Arc<str>> {
        &self.outbound
    }

    /// Record inbound activity.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn cancel_auth_timeout(&mut self) {
        if let Some(handle) = self.auth_timeout.take() {
            handle.abort();
        }
    }
}

/// Connection → session map.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<ConnectionId, Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection in the `Pending` state.
    pub fn register(
        &mut self,
        addr: SocketAddr,
        outbound: mpsc::Sender<Arc<str>>,
        close: oneshot::Sender<()>,
    ) -> ConnectionId {
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            Session {
                id,
                addr,
                status: AuthStatus::Pending,
                token: None,
                connected_at: Utc::now(),
                last_activity: Instant::now(),
                outbound,
                close: Some(close),
                auth_timeout: None,
            },
        );
        id
    }

    /// Remove a connection and cancel its auth timeout. Removing an unknown
    /// connection is a no-op.
    pub fn unregister(&mut self, id: &ConnectionId) -> Option<Session> {
        let mut session = self.sessions.remove(id)?;
        session.cancel_auth_timeout();
        Some(session)
    }

    /// Look up a session.
    pub fn get(&self, id: &ConnectionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Look up a session for mutation.
    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Ids of every authenticated session.
    pub fn list_authenticated(&self) -> Vec<ConnectionId> {
        self.sessions
            .values()
            .filter(|s| s.is_authenticated())
            .map(|s| s.id)
            .collect()
    }

    /// Outbound queues of every session a broadcast should reach.
    pub fn recipients(&self, auth_required: bool) -> Vec<(ConnectionId, mpsc::Sender<Arc<str>>)> {
        self.sessions
            .values()
            .filter(|s| !auth_required || s.is_authenticated())
            .map(|s| (s.id, s.outbound.clone()))
            .collect()
    }

    /// Attach the task that closes a session left pending too long.
    pub fn set_auth_timeout(&mut self, id: &ConnectionId, handle: AbortHandle) {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.cancel_auth_timeout();
                session.auth_timeout = Some(handle);
            }
            None => handle.abort(),
        }
    }

    /// Move a pending session to `Authenticated` and cancel its timeout.
    /// Returns false if the session is unknown or not pending.
    pub fn mark_authenticated(&mut self, id: &ConnectionId, token: Option<String>) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) if session.status == AuthStatus::Pending => {
                session.status = AuthStatus::Authenticated;
                session.token = token;
                session.cancel_auth_timeout();
                true
            }
            _ => false,
        }
    }

    /// Move a pending session to `Failed`. The auth timeout is kept so the
    /// connection still closes at the original deadline.
    pub fn mark_failed(&mut self, id: &ConnectionId) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) if session.status == AuthStatus::Pending => {
                session.status = AuthStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Take the close signal for a session. Succeeds at most once per session.
    pub fn take_close(&mut self, id: &ConnectionId) -> Option<oneshot::Sender<()>> {
        self.sessions.get_mut(id)?.close.take()
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
