//! End-to-end scenarios over real WebSocket connections.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use pong_bridge::game::{RallyConfig, RallySimulation, SimulationRunner};
use pong_bridge::{
    link, Authenticator, BridgeConfig, GameSnapshot, SimulationLink, SyncBridge, TransportLink,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Harness {
    port: u16,
    authenticator: Authenticator,
    transport: TransportLink,
    bridge: SyncBridge,
    runner: Option<SimulationRunner>,
}

impl Harness {
    fn start(auth_enabled: bool, playing: bool) -> Self {
        let (sim_link, transport) = link();
        let mut simulation = RallySimulation::new(RallyConfig {
            hit_period: Duration::from_millis(60),
            ..RallyConfig::default()
        });
        if playing {
            simulation.start_game();
        }
        let runner =
            SimulationRunner::spawn(simulation, sim_link, Duration::from_millis(5)).unwrap();

        Self::serve(auth_enabled, transport, Some(runner))
    }

    /// Bridge with no simulation thread; the test drives the link itself.
    fn start_detached(auth_enabled: bool) -> (Self, SimulationLink) {
        let (sim_link, transport) = link();
        (Self::serve(auth_enabled, transport, None), sim_link)
    }

    fn serve(auth_enabled: bool, transport: TransportLink, runner: Option<SimulationRunner>) -> Self {
        let config = BridgeConfig {
            host: "127.0.0.1".into(),
            port: 0,
            auth_enabled,
            auth_deadline: Duration::from_millis(400),
            poll_interval: POLL_INTERVAL,
            port_file: None,
            join_timeout: Duration::from_secs(2),
            ..BridgeConfig::default()
        };
        let authenticator = Authenticator::generate();

        let mut bridge = SyncBridge::new(config, transport.clone(), authenticator.clone());
        let port = bridge.start_configured().unwrap();

        Self {
            port,
            authenticator,
            transport,
            bridge,
            runner,
        }
    }

    async fn connect(&self) -> Ws {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}", self.port))
            .await
            .unwrap();
        ws
    }

    async fn connect_authenticated(&self) -> Ws {
        let mut ws = self.connect().await;
        expect(&mut ws, "auth:required").await;
        let credentials = self.authenticator.issue("scenario-client").unwrap();
        send(&mut ws, "auth:token", serde_json::to_value(credentials).unwrap()).await;
        expect(&mut ws, "auth:success").await;
        expect(&mut ws, "game:state").await;
        ws
    }

    fn shutdown(mut self) {
        self.bridge.stop();
        if let Some(runner) = self.runner.as_mut() {
            runner.stop();
        }
    }
}

async fn send(ws: &mut Ws, kind: &str, payload: Value) {
    let frame = json!({ "type": kind, "payload": payload });
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next JSON frame, or `None` once the server closes the connection.
async fn recv(ws: &mut Ws) -> Option<Value> {
    loop {
        let next = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame");
        match next {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Skip frames until one of type `kind` arrives.
async fn expect(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let frame = recv(ws)
            .await
            .unwrap_or_else(|| panic!("connection closed while waiting for {}", kind));
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Like [`expect`], also reporting when the frame arrived.
async fn expect_timed(ws: &mut Ws, kind: &str) -> (Value, Instant) {
    let frame = expect(ws, kind).await;
    (frame, Instant::now())
}

/// Collect frame types until the server closes the connection.
async fn types_until_close(ws: &mut Ws) -> Vec<String> {
    let mut kinds = Vec::new();
    while let Some(frame) = recv(ws).await {
        kinds.push(frame["type"].as_str().unwrap_or_default().to_string());
    }
    kinds
}

#[tokio::test]
async fn test_auth_disabled_client_gets_default_state() {
    let harness = Harness::start(false, false);
    let mut ws = harness.connect().await;

    let frame = recv(&mut ws).await.unwrap();
    assert_eq!(frame["type"], "game:state");
    assert_eq!(
        frame["payload"],
        serde_json::to_value(GameSnapshot::default()).unwrap()
    );
    assert!(frame["timestamp"].is_string());

    harness.shutdown();
}

#[tokio::test]
async fn test_challenge_load_reaches_simulation() {
    let harness = Harness::start(false, false);
    let mut ws = harness.connect().await;
    expect(&mut ws, "game:state").await;

    send(
        &mut ws,
        "challenge:load",
        json!({"id": "c1", "gameModifiers": {"ballSpeedMultiplier": 1.5}}),
    )
    .await;

    let loaded = expect(&mut ws, "challenge:loaded").await;
    assert_eq!(loaded["payload"]["id"], "c1");
    assert_eq!(loaded["payload"]["gameModifiers"]["ballSpeedMultiplier"], 1.5);

    let mut observed = None;
    for _ in 0..100 {
        let snapshot = harness.transport.snapshot();
        if snapshot.challenge_active {
            observed = Some(snapshot.challenge_modifiers.ball_speed_multiplier);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(observed, Some(1.5));

    harness.shutdown();
}

#[tokio::test]
async fn test_modifier_apply_is_echoed() {
    let harness = Harness::start(false, false);
    let mut ws = harness.connect().await;
    expect(&mut ws, "game:state").await;

    send(
        &mut ws,
        "modifier:apply",
        json!({"type": "speed_boost", "value": 1.5}),
    )
    .await;

    let applied = expect(&mut ws, "modifier:applied").await;
    assert_eq!(applied["payload"], json!({"type": "speed_boost", "value": 1.5}));

    harness.shutdown();
}

#[tokio::test]
async fn test_difficulty_update_is_clamped() {
    let harness = Harness::start(false, false);
    let mut ws = harness.connect().await;
    expect(&mut ws, "game:state").await;

    send(&mut ws, "difficulty:update", json!({"level": 9})).await;

    let updated = expect(&mut ws, "difficulty:updated").await;
    assert_eq!(updated["payload"]["level"], 5);
    assert_eq!(updated["payload"]["ballSpeedMultiplier"], 2.0);

    harness.shutdown();
}

#[tokio::test]
async fn test_score_updates_reach_every_authenticated_client() {
    let (harness, sim_link) = Harness::start_detached(true);
    let mut first = harness.connect_authenticated().await;
    let mut second = harness.connect_authenticated().await;

    let published = Instant::now();
    sim_link.publish(GameSnapshot {
        score: 120,
        balls_hit: 7,
        is_playing: true,
        ..GameSnapshot::default()
    });

    let ((a, a_at), (b, b_at)) = tokio::join!(
        expect_timed(&mut first, "score:updated"),
        expect_timed(&mut second, "score:updated")
    );

    assert_eq!(a["payload"], b["payload"]);
    assert_eq!(a["payload"]["score"], 120);
    assert_eq!(a["payload"]["delta"]["score"], 120);
    assert_eq!(a["payload"]["delta"]["balls_hit"], 7);

    let gap = a_at.max(b_at) - a_at.min(b_at);
    assert!(gap < POLL_INTERVAL, "receipts {:?} apart", gap);
    // One polling interval to pick the snapshot up, plus scheduling slack.
    let slack = Duration::from_millis(50);
    for at in [a_at, b_at] {
        assert!(at - published <= POLL_INTERVAL + slack, "took {:?}", at - published);
    }

    harness.shutdown();
}

#[tokio::test]
async fn test_request_state_after_auth() {
    let harness = Harness::start(true, false);
    let mut ws = harness.connect_authenticated().await;

    send(&mut ws, "game:request_state", json!({})).await;
    let state = expect(&mut ws, "game:state").await;
    assert_eq!(state["payload"]["is_playing"], false);

    harness.shutdown();
}

#[tokio::test]
async fn test_bad_signature_fails_then_closes() {
    let harness = Harness::start(true, false);
    let mut ws = harness.connect().await;
    expect(&mut ws, "auth:required").await;

    let mut credentials = harness.authenticator.issue("intruder").unwrap();
    credentials.signature = Some("ab".repeat(32));
    send(&mut ws, "auth:token", serde_json::to_value(credentials).unwrap()).await;

    let failed = expect(&mut ws, "auth:failed").await;
    assert!(failed["payload"]["reason"].is_string());

    send(&mut ws, "challenge:load", json!({"id": "c1"})).await;
    let rejected = expect(&mut ws, "error").await;
    assert_eq!(rejected["payload"]["code"], "not_authenticated");

    assert!(!types_until_close(&mut ws).await.contains(&"auth:success".to_string()));

    harness.shutdown();
}

#[tokio::test]
async fn test_pending_client_times_out_exactly_once() {
    let harness = Harness::start(true, false);
    let mut ws = harness.connect().await;
    expect(&mut ws, "auth:required").await;

    let kinds = types_until_close(&mut ws).await;
    assert_eq!(
        kinds.iter().filter(|k| k.as_str() == "auth:timeout").count(),
        1
    );
    assert!(!kinds.iter().any(|k| k == "game:state"));

    harness.shutdown();
}

#[tokio::test]
async fn test_unauthenticated_challenge_is_rejected() {
    let harness = Harness::start(true, false);
    let mut ws = harness.connect().await;
    expect(&mut ws, "auth:required").await;

    send(
        &mut ws,
        "challenge:load",
        json!({"id": "c1", "gameModifiers": {"ballSpeedMultiplier": 1.5}}),
    )
    .await;

    let error = expect(&mut ws, "error").await;
    assert_eq!(error["payload"]["code"], "not_authenticated");
    assert!(error["payload"]["action"].is_string());
    assert!(!harness.transport.snapshot().challenge_active);

    harness.shutdown();
}

#[tokio::test]
async fn test_unknown_message_keeps_connection_alive() {
    let harness = Harness::start(false, false);
    let mut ws = harness.connect().await;
    expect(&mut ws, "game:state").await;

    send(&mut ws, "game:cheat", json!({"score": 1_000_000})).await;
    ws.send(Message::Text("not json".into())).await.unwrap();
    send(&mut ws, "game:request_state", json!({})).await;

    let state = expect(&mut ws, "game:state").await;
    assert_eq!(state["payload"]["score"], 0);

    harness.shutdown();
}
