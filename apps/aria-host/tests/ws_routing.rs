//! Broker behavior over real WebSockets: auth gate, level hierarchy,
//! capability gating, screenshot throttling, and the control round-trip.

use std::sync::Arc;

use aria_host::{app::build_router, registry::Broker};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::frame::coding::CloseCode, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

const SECRET: &str = "test-secret";

async fn spawn_host() -> (String, Arc<Broker>) {
    let broker = Arc::new(Broker::new(SECRET));
    let app = build_router(broker.clone(), None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr.to_string(), broker)
}

struct TestPeer {
    write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl TestPeer {
    async fn connect(addr: &str) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let (write, read) = ws.split();
        Self { write, read }
    }

    async fn send(&mut self, frame: Value) {
        self.write
            .send(Message::Text(frame.to_string()))
            .await
            .unwrap();
    }

    /// Next text frame within two seconds, or None.
    async fn recv(&mut self) -> Option<Value> {
        let deadline = Duration::from_secs(2);
        loop {
            match timeout(deadline, self.read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return serde_json::from_str(&text).ok();
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) => return None,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => return None,
            }
        }
    }

    /// Drain frames until the line goes quiet for `quiet`.
    async fn recv_until_quiet(&mut self, quiet: Duration) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            match timeout(quiet, self.read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    if let Ok(value) = serde_json::from_str(&text) {
                        frames.push(value);
                    }
                }
                _ => return frames,
            }
        }
    }

    /// Wait for the close frame, returning (code, reason).
    async fn recv_close(&mut self) -> Option<(CloseCode, String)> {
        loop {
            match timeout(Duration::from_secs(2), self.read.next()).await {
                Ok(Some(Ok(Message::Close(Some(frame))))) => {
                    return Some((frame.code, frame.reason.to_string()));
                }
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    async fn auth(&mut self, role: &str) -> Value {
        self.auth_as(role, None).await
    }

    async fn auth_as(&mut self, role: &str, client_id: Option<&str>) -> Value {
        let mut frame = json!({"type": "auth", "secret": SECRET, "role": role});
        if let Some(id) = client_id {
            frame["clientId"] = Value::String(id.to_string());
        }
        self.send(frame).await;
        let ack = self.recv().await.expect("auth_success");
        assert_eq!(ack["type"], "auth_success");
        ack
    }

    async fn hello(&mut self, capabilities: &[&str]) {
        self.send(json!({
            "type": "hello",
            "capabilities": capabilities,
            "platform": "test",
            "protocol": 2,
        }))
        .await;
        let ack = self.recv().await.expect("hello_ack");
        assert_eq!(ack["type"], "hello_ack");
    }

    async fn subscribe(&mut self, levels: &[&str], capabilities: &[&str], llm_filter: Option<&str>) {
        self.send(json!({
            "type": "subscribe",
            "levels": levels,
            "capabilities": capabilities,
            "llm_filter": llm_filter,
        }))
        .await;
        let ack = self.recv().await.expect("subscribe_ack");
        assert_eq!(ack["type"], "subscribe_ack");
    }
}

fn console(level: &str, message: &str) -> Value {
    json!({"type": "console", "level": level, "message": message, "timestamp": 1u64})
}

#[tokio::test]
async fn bad_secret_closes_with_policy_code() {
    let (addr, _broker) = spawn_host().await;
    let mut peer = TestPeer::connect(&addr).await;
    peer.send(json!({"type": "auth", "secret": "wrong", "role": "bridge"}))
        .await;
    let (code, reason) = peer.recv_close().await.expect("close frame");
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "Invalid secret");
}

#[tokio::test]
async fn non_auth_first_frame_is_rejected() {
    let (addr, _broker) = spawn_host().await;
    let mut peer = TestPeer::connect(&addr).await;
    peer.send(console("info", "sneaky")).await;
    let (code, reason) = peer.recv_close().await.expect("close frame");
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "Authentication required");
}

#[tokio::test]
async fn invalid_role_is_rejected() {
    let (addr, _broker) = spawn_host().await;
    let mut peer = TestPeer::connect(&addr).await;
    peer.send(json!({"type": "auth", "secret": SECRET, "role": "spectator"}))
        .await;
    let (code, reason) = peer.recv_close().await.expect("close frame");
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "Invalid role");
}

#[tokio::test]
async fn level_hierarchy_fan_out() {
    let (addr, _broker) = spawn_host().await;

    let mut bridge = TestPeer::connect(&addr).await;
    bridge.auth("bridge").await;

    // A: default subscription. B: warn+info. C: trace.
    let mut a = TestPeer::connect(&addr).await;
    a.auth("consumer").await;
    let mut b = TestPeer::connect(&addr).await;
    b.auth("consumer").await;
    b.subscribe(&["warn", "info"], &[], None).await;
    let mut c = TestPeer::connect(&addr).await;
    c.auth("consumer").await;
    c.subscribe(&["trace"], &[], None).await;

    for level in ["error", "warn", "info", "debug"] {
        bridge.send(console(level, level)).await;
    }

    let quiet = Duration::from_millis(400);
    let got_a = a.recv_until_quiet(quiet).await;
    let got_b = b.recv_until_quiet(quiet).await;
    let got_c = c.recv_until_quiet(quiet).await;

    assert_eq!(got_a.len(), 1, "default consumer sees errors only: {got_a:?}");
    assert_eq!(got_a[0]["level"], "error");
    assert_eq!(got_b.len(), 3, "warn+info consumer: {got_b:?}");
    assert_eq!(got_c.len(), 4, "trace consumer sees everything: {got_c:?}");

    // Per-consumer order matches emission order.
    let levels_c: Vec<&str> = got_c.iter().map(|v| v["level"].as_str().unwrap()).collect();
    assert_eq!(levels_c, ["error", "warn", "info", "debug"]);
}

#[tokio::test]
async fn capability_gate_checks_both_sides() {
    let (addr, _broker) = spawn_host().await;

    let mut bridge = TestPeer::connect(&addr).await;
    bridge.auth("bridge").await;
    bridge.hello(&["screenshot"]).await;

    let mut consumer = TestPeer::connect(&addr).await;
    consumer.auth("consumer").await;
    consumer.subscribe(&["info"], &["screenshot"], None).await;

    let shot = json!({
        "type": "screenshot",
        "level": "info",
        "mime": "image/png",
        "data": "aGVsbG8=",
        "timestamp": 1u64,
    });
    bridge.send(shot.clone()).await;

    let received = consumer.recv().await.expect("screenshot delivered");
    assert_eq!(received, shot, "screenshot must arrive verbatim");

    // The bridge never advertised pageview, so it is withheld.
    bridge
        .send(json!({"type": "pageview", "level": "info", "url": "/a", "timestamp": 2u64}))
        .await;
    let rest = consumer.recv_until_quiet(Duration::from_millis(400)).await;
    assert!(rest.is_empty(), "pageview should be gated: {rest:?}");
}

#[tokio::test]
async fn control_round_trip_consumer_to_bridge() {
    let (addr, _broker) = spawn_host().await;

    let mut bridge = TestPeer::connect(&addr).await;
    bridge.auth("bridge").await;
    bridge.hello(&["control"]).await;

    let mut consumer = TestPeer::connect(&addr).await;
    consumer.auth("consumer").await;

    consumer
        .send(json!({"type": "control_request", "id": "req-1", "action": "ping"}))
        .await;

    // The bridge receives the request and echoes a result.
    let request = bridge.recv().await.expect("forwarded control_request");
    assert_eq!(request["type"], "control_request");
    assert_eq!(request["id"], "req-1");
    assert_eq!(request["action"], "ping");
    bridge
        .send(json!({"type": "control_result", "id": "req-1", "ok": true, "result": "pong"}))
        .await;

    let forwarded = consumer.recv().await.expect("control_forwarded");
    assert_eq!(forwarded["type"], "control_forwarded");
    assert_eq!(forwarded["id"], "req-1");
    assert_eq!(forwarded["delivered"], 1);

    let result = consumer.recv().await.expect("control_result");
    assert_eq!(result["type"], "control_result");
    assert_eq!(result["id"], "req-1");
    assert_eq!(result["ok"], true);
    assert_eq!(result["result"], "pong");
}

#[tokio::test]
async fn control_without_capable_bridge_fails_immediately() {
    let (addr, _broker) = spawn_host().await;

    let mut consumer = TestPeer::connect(&addr).await;
    consumer.auth("consumer").await;
    consumer
        .send(json!({"type": "control_request", "id": "req-1", "action": "ping"}))
        .await;

    let result = consumer.recv().await.expect("synthesized control_result");
    assert_eq!(result["type"], "control_result");
    assert_eq!(result["ok"], false);
    assert!(result["error"]["message"]
        .as_str()
        .unwrap()
        .contains("No bridge with control capability"));
}

#[tokio::test]
async fn screenshot_rate_limit_and_notices() {
    let (addr, _broker) = spawn_host().await;

    let mut bridge = TestPeer::connect(&addr).await;
    bridge.auth("bridge").await;
    bridge.hello(&["screenshot"]).await;

    let mut consumer = TestPeer::connect(&addr).await;
    consumer.auth("consumer").await;
    consumer.subscribe(&["info"], &["screenshot"], None).await;

    let shot = |ts: u64| {
        json!({
            "type": "screenshot",
            "level": "info",
            "mime": "image/png",
            "data": "aGVsbG8=",
            "timestamp": ts,
        })
    };

    bridge.send(shot(1)).await;
    assert!(consumer.recv().await.is_some(), "first screenshot forwarded");

    // Within the 2 s window: bounced with retryAfterMs.
    bridge.send(shot(2)).await;
    let notice = bridge.recv().await.expect("rate_limit_notice");
    assert_eq!(notice["type"], "rate_limit_notice");
    assert_eq!(notice["reason"], "rate_limit");
    assert!(notice["retryAfterMs"].as_u64().unwrap() <= 2_000);

    // Missing payload: invalid_format.
    bridge
        .send(json!({"type": "screenshot", "level": "info", "mime": "image/png"}))
        .await;
    let notice = bridge.recv().await.expect("invalid_format notice");
    assert_eq!(notice["reason"], "invalid_format");

    let leaked = consumer.recv_until_quiet(Duration::from_millis(300)).await;
    assert!(leaked.is_empty(), "throttled screenshots must not fan out");
}

#[tokio::test]
async fn screenshot_without_bridge_capability_is_bounced() {
    let (addr, _broker) = spawn_host().await;

    let mut bridge = TestPeer::connect(&addr).await;
    bridge.auth("bridge").await;
    bridge.hello(&["console"]).await;

    bridge
        .send(json!({
            "type": "screenshot",
            "level": "info",
            "mime": "image/png",
            "data": "aGVsbG8=",
        }))
        .await;
    let notice = bridge.recv().await.expect("missing_capability notice");
    assert_eq!(notice["type"], "rate_limit_notice");
    assert_eq!(notice["reason"], "missing_capability");
}

#[tokio::test]
async fn screenshot_with_no_interested_consumer_is_bounced() {
    let (addr, _broker) = spawn_host().await;

    let mut bridge = TestPeer::connect(&addr).await;
    bridge.auth("bridge").await;
    bridge.hello(&["screenshot"]).await;

    bridge
        .send(json!({
            "type": "screenshot",
            "level": "info",
            "mime": "image/png",
            "data": "aGVsbG8=",
        }))
        .await;
    let notice = bridge.recv().await.expect("no_consumers notice");
    assert_eq!(notice["reason"], "no_consumers");
}

#[tokio::test]
async fn llm_filter_drops_noise() {
    let (addr, _broker) = spawn_host().await;

    let mut bridge = TestPeer::connect(&addr).await;
    bridge.auth("bridge").await;

    let mut consumer = TestPeer::connect(&addr).await;
    consumer.auth("consumer").await;
    consumer.subscribe(&["trace"], &[], Some("aggressive")).await;

    for level in ["debug", "log", "info", "warn", "error"] {
        bridge.send(console(level, level)).await;
    }
    let got = consumer.recv_until_quiet(Duration::from_millis(400)).await;
    let levels: Vec<&str> = got.iter().map(|v| v["level"].as_str().unwrap()).collect();
    assert_eq!(levels, ["warn", "error"]);
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (addr, _broker) = spawn_host().await;
    let mut bridge = TestPeer::connect(&addr).await;
    bridge.auth("bridge").await;
    bridge.send(json!({"type": "ping"})).await;
    let pong = bridge.recv().await.expect("pong");
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn chosen_client_id_is_echoed() {
    let (addr, _broker) = spawn_host().await;
    let mut bridge = TestPeer::connect(&addr).await;
    let ack = bridge.auth_as("bridge", Some("my-bridge")).await;
    assert_eq!(ack["clientId"], "my-bridge");
}
