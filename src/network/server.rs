//! WebSocket Bridge Server
//!
//! Accept loop and per-connection handling. Each connection gets an outbound
//! queue drained by its own writer task, a session in the registry, and, when
//! authentication is enabled, a timeout task that closes it if the handshake
//! does not complete in time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::link::TransportLink;
use crate::config::BridgeConfig;
use crate::network::auth::Authenticator;
use crate::network::broadcast::Broadcaster;
use crate::network::challenge::ChallengeController;
use crate::network::polling::PollingLoop;
use crate::network::protocol::{
    snapshot_payload, AuthCredentials, AuthFailedPayload, AuthRequiredPayload,
    AuthSuccessPayload, ClientMessage, ErrorCode, ErrorPayload, ServerEvent,
};
use crate::network::session::{AuthStatus, ConnectionId, SessionRegistry};

/// Time the writer gets to flush queued frames after a connection ends.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a connection handler needs. Cheap to clone.
#[derive(Clone)]
pub struct BridgeServer {
    config: Arc<BridgeConfig>,
    sessions: Arc<RwLock<SessionRegistry>>,
    broadcaster: Broadcaster,
    authenticator: Arc<Authenticator>,
    controller: ChallengeController,
    link: TransportLink,
    shutdown_tx: broadcast::Sender<()>,
}

impl BridgeServer {
    /// Create a server. `shutdown_tx` stops the accept loop, every
    /// connection, and the polling loop.
    pub fn new(
        config: BridgeConfig,
        link: TransportLink,
        authenticator: Authenticator,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let link = link.with_ack_timeout(config.command_timeout);
        let sessions = Arc::new(RwLock::new(SessionRegistry::new()));
        let broadcaster = Broadcaster::new(sessions.clone());
        let controller = ChallengeController::new(link.clone(), broadcaster.clone());

        Self {
            config: Arc::new(config),
            sessions,
            broadcaster,
            authenticator: Arc::new(authenticator),
            controller,
            link,
            shutdown_tx,
        }
    }

    /// Polling loop wired to this server's link and sessions.
    pub fn polling_loop(&self) -> PollingLoop {
        PollingLoop::new(
            self.link.clone(),
            self.broadcaster.clone(),
            self.config.poll_interval,
        )
    }

    /// Accept connections until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn run(self, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let connected = self.sessions.read().await.len();
                            if connected >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
    }

    /// Handle one WebSocket connection from handshake to cleanup.
    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Arc<str>>(self.config.outbound_capacity);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_sender.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let id = self.sessions.write().await.register(addr, out_tx, close_tx);
        debug!(%id, %addr, "Session registered");

        self.on_connect(id).await;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(session) = self.sessions.write().await.get_mut(&id) {
                                session.touch();
                            }
                            match ClientMessage::from_json(&text) {
                                Ok(message) => self.handle_message(id, message).await,
                                Err(e) => debug!(%id, "Ignoring frame: {}", e),
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!(%id, "Ignoring binary frame");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client {} disconnected", addr);
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error for {}: {}", addr, e);
                            break;
                        }
                        _ => {}
                    }
                }
                _ = &mut close_rx => {
                    info!(%id, "Closing session");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        self.sessions.write().await.unregister(&id);

        let abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
            abort.abort();
        }

        info!("Client {} cleaned up", addr);
    }

    async fn on_connect(&self, id: ConnectionId) {
        if !self.config.auth_enabled {
            self.sessions.write().await.mark_authenticated(&id, None);
            self.send_state(id).await;
            return;
        }

        let deadline = self.config.auth_deadline;
        let deadline_at = chrono::Duration::from_std(deadline)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or_else(Utc::now);
        let required = AuthRequiredPayload {
            message: "send auth:token with a signed timestamp".to_string(),
            timeout: deadline.as_secs(),
            deadline: deadline_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        };
        if let Err(e) = self
            .broadcaster
            .send_to_client(id, ServerEvent::AuthRequired, &required)
            .await
        {
            warn!(%id, "Failed to request authentication: {}", e);
        }

        let server = self.clone();
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            server.expire_session(id).await;
        });
        self.sessions
            .write()
            .await
            .set_auth_timeout(&id, timeout.abort_handle());
    }

    /// Close a session whose deadline passed without authentication. The
    /// close signal can be taken once, so this closes a session at most once.
    async fn expire_session(&self, id: ConnectionId) {
        let (status, close) = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&id).map(|s| s.status) {
                None | Some(AuthStatus::Authenticated) => return,
                Some(status) => (status, sessions.take_close(&id)),
            }
        };
        let Some(close) = close else {
            return;
        };

        if status == AuthStatus::Pending {
            let payload = serde_json::json!({
                "message": "authentication deadline passed",
            });
            let _ = self
                .broadcaster
                .send_to_client(id, ServerEvent::AuthTimeout, &payload)
                .await;
            info!(%id, "Authentication timed out");
        } else {
            info!(%id, "Closing session after failed authentication");
        }

        let _ = close.send(());
    }

    async fn handle_message(&self, id: ConnectionId, message: ClientMessage) {
        debug!(%id, kind = message.kind(), "Client message");

        match message {
            ClientMessage::AuthToken(credentials) => self.handle_auth(id, credentials).await,
            ClientMessage::RequestState => {
                if self.require_auth(id).await {
                    self.send_state(id).await;
                }
            }
            ClientMessage::ChallengeLoad(payload) => {
                if self.require_auth(id).await {
                    if let Err(e) = self.controller.load_challenge(payload).await {
                        self.reply_error(id, e.to_payload()).await;
                    }
                }
            }
            ClientMessage::DifficultyUpdate(payload) => {
                if self.require_auth(id).await {
                    if let Err(e) = self.controller.update_difficulty(payload).await {
                        self.reply_error(id, e.to_payload()).await;
                    }
                }
            }
            ClientMessage::ModifierApply(payload) => {
                if self.require_auth(id).await {
                    if let Err(e) = self.controller.apply_modifier(payload).await {
                        self.reply_error(id, e.to_payload()).await;
                    }
                }
            }
        }
    }

    async fn handle_auth(&self, id: ConnectionId, credentials: AuthCredentials) {
        let status = match self.sessions.read().await.get(&id) {
            Some(session) => session.status,
            None => return,
        };

        match status {
            AuthStatus::Authenticated => {
                debug!(%id, "Ignoring auth:token on authenticated session");
            }
            AuthStatus::Failed => {
                self.reply_error(
                    id,
                    ErrorPayload::new(
                        ErrorCode::AuthFailed,
                        "authentication already failed on this connection",
                        "open a new connection and authenticate again",
                    ),
                )
                .await;
            }
            AuthStatus::Pending => match self.authenticator.verify(&credentials) {
                Ok(token) => {
                    self.sessions.write().await.mark_authenticated(&id, Some(token));
                    info!(%id, "Client authenticated");

                    let success = AuthSuccessPayload {
                        session_id: id.to_string(),
                        message: "authenticated".to_string(),
                    };
                    if let Err(e) = self
                        .broadcaster
                        .send_to_client(id, ServerEvent::AuthSuccess, &success)
                        .await
                    {
                        warn!(%id, "Failed to confirm authentication: {}", e);
                    }
                    self.send_state(id).await;
                }
                Err(e) => {
                    self.sessions.write().await.mark_failed(&id);
                    warn!(%id, "Authentication failed: {}", e);

                    let failed = AuthFailedPayload {
                        reason: e.to_string(),
                        action: e.action().to_string(),
                    };
                    let _ = self
                        .broadcaster
                        .send_to_client(id, ServerEvent::AuthFailed, &failed)
                        .await;
                }
            },
        }
    }

    /// Whether `id` may read or change simulation state. Replies with
    /// `not_authenticated` when it may not.
    async fn require_auth(&self, id: ConnectionId) -> bool {
        let authenticated = self
            .sessions
            .read()
            .await
            .get(&id)
            .map(|s| s.is_authenticated())
            .unwrap_or(false);

        if !authenticated {
            self.reply_error(id, ErrorPayload::not_authenticated()).await;
        }
        authenticated
    }

    async fn send_state(&self, id: ConnectionId) {
        let snapshot = self.link.snapshot();
        if let Err(e) = self
            .broadcaster
            .send_to_client(id, ServerEvent::GameState, &snapshot_payload(&snapshot))
            .await
        {
            warn!(%id, "Failed to send state: {}", e);
        }
    }

    async fn reply_error(&self, id: ConnectionId, error: ErrorPayload) {
        if let Err(e) = self.broadcaster.send_error(id, error).await {
            debug!(%id, "Failed to send error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::link::link;
    use crate::network::auth::ServerSecret;
    use serde_json::Value;

    fn server(auth_enabled: bool) -> (crate::bridge::link::SimulationLink, BridgeServer) {
        let (sim_link, transport) = link();
        let config = BridgeConfig {
            auth_enabled,
            auth_deadline: Duration::from_millis(50),
            command_timeout: Duration::from_millis(50),
            port_file: None,
            ..BridgeConfig::default()
        };
        let authenticator = Authenticator::new(
            ServerSecret::from_bytes(b"server-test".to_vec()),
            config.replay_window,
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        (
            sim_link,
            BridgeServer::new(config, transport, authenticator, shutdown_tx),
        )
    }

    async fn attach(
        server: &BridgeServer,
    ) -> (ConnectionId, mpsc::Receiver<Arc<str>>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::channel(16);
        let (close_tx, close_rx) = oneshot::channel();
        let id = server
            .sessions
            .write()
            .await
            .register("127.0.0.1:6000".parse().unwrap(), tx, close_tx);
        (id, rx, close_rx)
    }

    fn next(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_connect_without_auth_sends_state() {
        let (_sim, server) = server(false);
        let (id, mut rx, _close) = attach(&server).await;

        server.on_connect(id).await;

        assert!(server.sessions.read().await.get(&id).unwrap().is_authenticated());
        let msg = next(&mut rx);
        assert_eq!(msg["type"], "game:state");
        assert_eq!(msg["payload"]["score"], 0);
    }

    #[tokio::test]
    async fn test_connect_with_auth_requires_token() {
        let (_sim, server) = server(true);
        let (id, mut rx, _close) = attach(&server).await;

        server.on_connect(id).await;

        let msg = next(&mut rx);
        assert_eq!(msg["type"], "auth:required");
        assert!(msg["payload"]["deadline"].is_string());
        assert_eq!(
            server.sessions.read().await.get(&id).unwrap().status,
            AuthStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_valid_token_authenticates_and_sends_state_once() {
        let (_sim, server) = server(true);
        let (id, mut rx, mut close) = attach(&server).await;
        server.on_connect(id).await;
        let _ = next(&mut rx);

        let credentials = server.authenticator.issue("player").unwrap();
        server
            .handle_message(id, ClientMessage::AuthToken(credentials))
            .await;

        assert_eq!(next(&mut rx)["type"], "auth:success");
        assert_eq!(next(&mut rx)["type"], "game:state");
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(close.try_recv().is_err());
        assert!(server.sessions.read().await.get(&id).unwrap().is_authenticated());
    }

    #[tokio::test]
    async fn test_bad_token_fails_and_closes_at_deadline() {
        let (_sim, server) = server(true);
        let (id, mut rx, close) = attach(&server).await;
        server.on_connect(id).await;
        let _ = next(&mut rx);

        let mut credentials = server.authenticator.issue("player").unwrap();
        credentials.signature = Some("00".repeat(32));
        server
            .handle_message(id, ClientMessage::AuthToken(credentials.clone()))
            .await;
        let failed = next(&mut rx);
        assert_eq!(failed["type"], "auth:failed");
        assert!(failed["payload"]["action"].is_string());

        server
            .handle_message(id, ClientMessage::AuthToken(credentials))
            .await;
        assert_eq!(next(&mut rx)["payload"]["code"], "auth_failed");

        tokio::time::timeout(Duration::from_secs(1), close)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_session_times_out_once() {
        let (_sim, server) = server(true);
        let (id, mut rx, close) = attach(&server).await;
        server.on_connect(id).await;
        let _ = next(&mut rx);

        tokio::time::timeout(Duration::from_secs(1), close)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next(&mut rx)["type"], "auth:timeout");

        server.expire_session(id).await;
        assert!(rx.try_recv().is_err());
        assert!(server.sessions.write().await.take_close(&id).is_none());
    }

    #[tokio::test]
    async fn test_unauthenticated_mutation_rejected() {
        let (mut sim, server) = server(true);
        let (id, mut rx, _close) = attach(&server).await;

        server
            .handle_message(
                id,
                ClientMessage::ChallengeLoad(serde_json::json!({"id": "c1"})),
            )
            .await;
        server.handle_message(id, ClientMessage::RequestState).await;

        let first = next(&mut rx);
        assert_eq!(first["type"], "error");
        assert_eq!(first["payload"]["code"], "not_authenticated");
        assert_eq!(next(&mut rx)["payload"]["code"], "not_authenticated");

        let mut rally = crate::game::simulation::RallySimulation::default();
        assert_eq!(sim.apply_pending(&mut rally), 0);
    }

    #[tokio::test]
    async fn test_invalid_challenge_gets_error_reply() {
        let (_sim, server) = server(false);
        let (id, mut rx, _close) = attach(&server).await;
        server.on_connect(id).await;
        let _ = next(&mut rx);

        server
            .handle_message(id, ClientMessage::ChallengeLoad(serde_json::json!({})))
            .await;

        let msg = next(&mut rx);
        assert_eq!(msg["type"], "error");
        assert_eq!(msg["payload"]["code"], "invalid_challenge");
    }
}
