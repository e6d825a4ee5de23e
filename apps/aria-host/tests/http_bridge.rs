//! The HTTP bridge-session contract: connect/hello/events/poll/heartbeat/
//! disconnect against a live host, with a WebSocket consumer on the other
//! side verifying fan-out.

use std::sync::Arc;

use aria_host::{app::build_router, registry::Broker};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

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

type WsRead = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Next text frame within two seconds, or None.
async fn next_frame(read: &mut WsRead) -> Option<Value> {
    loop {
        match timeout(Duration::from_secs(2), read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str::<Value>(&text).ok(),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

async fn http_connect(client: &reqwest::Client, addr: &str) -> String {
    let response = client
        .post(format!("http://{addr}/bridge/connect"))
        .json(&json!({"secret": SECRET}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    body["sessionId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn connect_rejects_bad_secret() {
    let (addr, _broker) = spawn_host().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/bridge/connect"))
        .json(&json!({"secret": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn malformed_body_is_a_server_error() {
    let (addr, _broker) = spawn_host().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/bridge/events"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let (addr, _broker) = spawn_host().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/bridge/nope"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn events_are_defaulted_and_fanned_out() {
    let (addr, _broker) = spawn_host().await;
    let client = reqwest::Client::new();

    // WS consumer subscribed to everything.
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (mut write, mut read) = ws.split();
    write
        .send(Message::Text(
            json!({"type": "auth", "secret": SECRET, "role": "consumer"}).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut read).await.unwrap()["type"], "auth_success");
    write
        .send(Message::Text(
            json!({"type": "subscribe", "levels": ["trace"]}).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut read).await.unwrap()["type"], "subscribe_ack");

    // HTTP bridge session.
    let session_id = http_connect(&client, &addr).await;
    let response = client
        .post(format!("http://{addr}/bridge/hello"))
        .json(&json!({
            "sessionId": session_id,
            "capabilities": ["console", "error"],
            "platform": "roblox",
            "protocol": 2,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert!(body["clientId"].as_str().is_some());

    // A bare event gets type/level/timestamp/platform defaults.
    let response = client
        .post(format!("http://{addr}/bridge/events"))
        .json(&json!({
            "sessionId": session_id,
            "events": [{"message": "from http"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let event = next_frame(&mut read).await.expect("event fanned out to ws consumer");
    assert_eq!(event["type"], "console");
    assert_eq!(event["level"], "info");
    assert_eq!(event["message"], "from http");
    assert_eq!(event["platform"], "roblox");
    assert!(event["timestamp"].as_u64().is_some());
}

#[tokio::test]
async fn control_queue_drains_through_poll() {
    let (addr, _broker) = spawn_host().await;
    let client = reqwest::Client::new();

    let session_id = http_connect(&client, &addr).await;
    client
        .post(format!("http://{addr}/bridge/hello"))
        .json(&json!({
            "sessionId": session_id,
            "capabilities": ["control"],
            "platform": "roblox",
        }))
        .send()
        .await
        .unwrap();

    // Consumer issues a control request over WS.
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (mut write, mut read) = ws.split();
    write
        .send(Message::Text(
            json!({"type": "auth", "secret": SECRET, "role": "consumer"}).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut read).await.unwrap()["type"], "auth_success");
    write
        .send(Message::Text(
            json!({"type": "control_request", "id": "req-7", "action": "evaluate", "code": "1+1"})
                .to_string(),
        ))
        .await
        .unwrap();
    let forwarded = next_frame(&mut read).await.expect("control_forwarded");
    assert_eq!(forwarded["type"], "control_forwarded");
    assert_eq!(forwarded["delivered"], 1);

    // The queued request comes out of poll, in order.
    let response = client
        .post(format!("http://{addr}/bridge/control/poll"))
        .json(&json!({"sessionId": session_id, "waitMs": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let commands = body["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["type"], "control_request");
    assert_eq!(commands[0]["id"], "req-7");

    // Second poll finds an empty queue.
    let response = client
        .post(format!("http://{addr}/bridge/control/poll"))
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert!(body["commands"].as_array().unwrap().is_empty());

    // The bridge answers over HTTP; the consumer gets the result.
    let response = client
        .post(format!("http://{addr}/bridge/control/result"))
        .json(&json!({"sessionId": session_id, "id": "req-7", "ok": true, "result": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let result = next_frame(&mut read).await.expect("control_result");
    assert_eq!(result["type"], "control_result");
    assert_eq!(result["id"], "req-7");
    assert_eq!(result["ok"], true);
    assert_eq!(result["result"], 2);
}

#[tokio::test]
async fn heartbeat_and_disconnect_lifecycle() {
    let (addr, broker) = spawn_host().await;
    let client = reqwest::Client::new();

    let session_id = http_connect(&client, &addr).await;
    let response = client
        .post(format!("http://{addr}/bridge/heartbeat"))
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let response = client
        .post(format!("http://{addr}/bridge/disconnect"))
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    // The session is gone: further calls see 404.
    let response = client
        .post(format!("http://{addr}/bridge/heartbeat"))
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // And a direct sweep finds nothing left to remove.
    assert_eq!(
        broker.sweep_stale_http_sessions(Duration::from_millis(0)),
        0
    );
}

#[tokio::test]
async fn stale_sessions_are_swept() {
    let (addr, broker) = spawn_host().await;
    let client = reqwest::Client::new();

    let session_id = http_connect(&client, &addr).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Anything older than 10 ms is stale for this sweep.
    assert_eq!(
        broker.sweep_stale_http_sessions(Duration::from_millis(10)),
        1
    );

    let response = client
        .post(format!("http://{addr}/bridge/heartbeat"))
        .json(&json!({"sessionId": session_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
