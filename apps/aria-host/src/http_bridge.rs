//! HTTP bridge sessions: a polling adapter for bridges that cannot hold a
//! WebSocket open. Sessions ride the same registry and routing engine; the
//! only difference is that host→bridge frames park on a queue until the
//! next `control/poll`.

use std::sync::Arc;
use std::time::Duration;

use aria_protocol::{now_ms, ControlResult, Event, Inbound, SESSION_STALE_MS};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::handle_control_result;
use crate::registry::Broker;
use crate::router::route_event;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub secret: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub session_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub protocol: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    pub ok: bool,
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsRequest {
    pub session_id: String,
    #[serde(default)]
    pub events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResultRequest {
    pub session_id: String,
    pub id: String,
    pub ok: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    pub session_id: String,
    /// Accepted for forward compatibility; the host short-polls.
    #[serde(default)]
    #[allow(dead_code)]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOnly {
    pub session_id: String,
}

/// Malformed bodies surface as 500 per the bridge-session contract.
fn body_error(err: JsonRejection) -> Response {
    warn!(%err, "bad bridge request body");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

fn unknown_session() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

pub async fn connect(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<ConnectRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(err) => return body_error(err),
    };
    if req.secret != broker.secret {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let session_id = Uuid::new_v4().to_string();
    let client_id = format!("http-{}", Uuid::new_v4());
    broker.register_http_bridge(session_id.clone(), client_id.clone());
    info!(%session_id, %client_id, "http bridge connected");
    Json(ConnectResponse { session_id }).into_response()
}

pub async fn hello(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<HelloRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(err) => return body_error(err),
    };
    let Some(client_id) = broker.http_client_id(&req.session_id) else {
        return unknown_session();
    };
    broker.touch_http_session(&req.session_id);
    let frame = aria_protocol::ClientFrame::Hello {
        capabilities: req.capabilities,
        platform: req.platform,
        project_id: req.project_id,
        route: req.route,
        url: req.url,
        protocol: req.protocol.unwrap_or(1),
    };
    broker.record_hello(&client_id, &frame);
    Json(HelloResponse {
        ok: true,
        client_id,
    })
    .into_response()
}

pub async fn events(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<EventsRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(err) => return body_error(err),
    };
    let Some(client_id) = broker.http_client_id(&req.session_id) else {
        return unknown_session();
    };
    broker.touch_http_session(&req.session_id);

    let platform = broker
        .bridge_platform(&client_id)
        .unwrap_or_else(|| "http".to_string());
    for raw in req.events {
        let Some(event) = normalize_http_event(raw, &platform) else {
            debug!(%client_id, "skipping malformed http event");
            continue;
        };
        if let Some(notice) = route_event(&broker, &client_id, &event) {
            // A polling bridge has no push path, so notices join the
            // control queue.
            if let Some(queue) = broker.http_control_queue(&req.session_id) {
                queue.push(notice.to_value());
            }
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

pub async fn control_result(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<ControlResultRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(err) => return body_error(err),
    };
    if !broker.touch_http_session(&req.session_id) {
        return unknown_session();
    }
    let result: ControlResult = match serde_json::from_value(json!({
        "id": req.id,
        "ok": req.ok,
        "result": req.result,
        "error": req.error,
    })) {
        Ok(result) => result,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    handle_control_result(&broker, result);
    StatusCode::NO_CONTENT.into_response()
}

pub async fn control_poll(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<PollRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(err) => return body_error(err),
    };
    if !broker.touch_http_session(&req.session_id) {
        return unknown_session();
    }
    let commands = broker
        .http_control_queue(&req.session_id)
        .map(|queue| queue.drain())
        .unwrap_or_default();
    Json(json!({ "commands": commands })).into_response()
}

pub async fn heartbeat(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<SessionOnly>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(err) => return body_error(err),
    };
    if !broker.touch_http_session(&req.session_id) {
        return unknown_session();
    }
    StatusCode::NO_CONTENT.into_response()
}

pub async fn disconnect(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<SessionOnly>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(err) => return body_error(err),
    };
    broker.remove_http_session(&req.session_id);
    StatusCode::NO_CONTENT.into_response()
}

/// Fill the defaults a polling bridge tends to omit, then classify through
/// the same ingress path WebSocket events take.
fn normalize_http_event(raw: Value, platform: &str) -> Option<Event> {
    let Value::Object(mut map) = raw else {
        return None;
    };
    let has_type = map
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| !t.is_empty());
    if !has_type {
        map.insert("type".into(), Value::String("console".into()));
    }
    map.entry("level").or_insert_with(|| Value::String("info".into()));
    map.entry("message").or_insert_with(|| Value::String(String::new()));
    map.entry("timestamp").or_insert_with(|| Value::from(now_ms()));
    map.entry("platform")
        .or_insert_with(|| Value::String(platform.to_string()));

    match Inbound::parse(&Value::Object(map).to_string()) {
        Some(Inbound::Event(event)) => Some(event),
        // Protocol-reserved types cannot be submitted through the events
        // endpoint.
        _ => None,
    }
}

/// Periodic staleness sweep: HTTP sessions quietly die when their bridge
/// stops heartbeating.
pub fn spawn_staleness_sweep(broker: Arc<Broker>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let max_age = Duration::from_millis(SESSION_STALE_MS);
        let mut interval = tokio::time::interval(max_age);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = broker.sweep_stale_http_sessions(max_age);
            if removed > 0 {
                info!(removed, "swept stale http bridge sessions");
            }
        }
    })
}
