//! WebSocket acceptor: in-band auth gate, then the per-session dispatch
//! loop. One writer task per socket drains an unbounded channel so routing
//! never blocks on a slow peer.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use aria_protocol::{
    close, generate_client_id, ClientFrame, Inbound, Role, ServerFrame, AUTH_TIMEOUT_MS,
    PROTOCOL_VERSION,
};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control::{control_from_bridge, control_from_consumer, handle_control_result};
use crate::registry::{Broker, Subscription};
use crate::router::route_event;

/// WebSocket upgrade handler. The `X-Bridge-Secret` header, when present,
/// is checked before upgrading for a cheap rejection; the in-band `auth`
/// frame remains authoritative.
pub async fn websocket_handler(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(header) = headers.get("x-bridge-secret") {
        if header.to_str().ok() != Some(broker.secret.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
}

async fn handle_socket(socket: WebSocket, broker: Arc<Broker>) {
    let (mut sender, mut receiver) = socket.split();

    let (role, client_id) = match authenticate(&broker, &mut sender, &mut receiver).await {
        Some(identity) => identity,
        None => return,
    };

    // Writer task: everything addressed to this session funnels through one
    // channel so per-consumer ordering matches routing order.
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close::NORMAL,
                reason: Cow::Borrowed("session closed"),
            })))
            .await;
    });

    match role {
        Role::Bridge => broker.register_ws_bridge(client_id.clone(), tx.clone()),
        Role::Consumer => broker.register_consumer(client_id.clone(), tx.clone()),
    }
    let _ = tx.send(
        ServerFrame::AuthSuccess {
            role,
            client_id: client_id.clone(),
        }
        .to_value(),
    );
    info!(%client_id, role = role.as_str(), "session authenticated");

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            // Some SDKs ship JSON in binary frames; accept them the same way.
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Some(inbound) = Inbound::parse(&text) else {
            debug!(%client_id, "ignoring malformed frame");
            continue;
        };
        dispatch(&broker, role, &client_id, &tx, inbound);
    }

    broker.remove_session(&client_id);
    drop(tx);
    let _ = writer.await;
    info!(%client_id, "session closed");
}

fn dispatch(
    broker: &Broker,
    role: Role,
    client_id: &str,
    tx: &mpsc::UnboundedSender<Value>,
    inbound: Inbound,
) {
    match (role, inbound) {
        (_, Inbound::Frame(ClientFrame::Ping)) => {
            let _ = tx.send(ServerFrame::Pong.to_value());
        }
        (_, Inbound::Frame(ClientFrame::Pong)) => {}
        (_, Inbound::Frame(ClientFrame::Auth { .. })) => {
            debug!(client_id, "duplicate auth ignored");
        }
        (_, Inbound::Frame(ClientFrame::ControlResult(result))) => {
            handle_control_result(broker, result);
        }
        (Role::Bridge, Inbound::Frame(hello @ ClientFrame::Hello { .. })) => {
            if broker.record_hello(client_id, &hello) {
                let _ = tx.send(
                    ServerFrame::HelloAck {
                        client_id: client_id.to_string(),
                        protocol: PROTOCOL_VERSION,
                    }
                    .to_value(),
                );
            }
        }
        (Role::Bridge, Inbound::Frame(ClientFrame::ControlRequest(request))) => {
            control_from_bridge(broker, client_id, request);
        }
        (Role::Bridge, Inbound::Event(event)) => {
            if let Some(notice) = route_event(broker, client_id, &event) {
                let _ = tx.send(notice.to_value());
            }
        }
        (Role::Consumer, Inbound::Frame(ClientFrame::Subscribe {
            levels,
            capabilities,
            llm_filter,
        })) => {
            let subscription =
                Subscription::from_frame(&levels, &capabilities, llm_filter.as_deref());
            let ack = ServerFrame::SubscribeAck {
                client_id: client_id.to_string(),
                levels: {
                    let mut names: Vec<String> = subscription
                        .levels
                        .iter()
                        .map(|t| t.as_str().to_string())
                        .collect();
                    names.sort();
                    names
                },
                capabilities: {
                    let mut names: Vec<String> =
                        subscription.capabilities.iter().cloned().collect();
                    names.sort();
                    names
                },
                llm_filter: subscription.llm_filter.as_str().to_string(),
            };
            broker.update_subscription(client_id, subscription);
            let _ = tx.send(ack.to_value());
        }
        (Role::Consumer, Inbound::Frame(ClientFrame::ControlRequest(request))) => {
            control_from_consumer(broker, client_id, request);
        }
        (role, other) => {
            debug!(client_id, role = role.as_str(), ?other, "frame ignored for role");
        }
    }
}

/// The auth gate: the first text frame must be a valid `auth` within
/// [`AUTH_TIMEOUT_MS`], or the socket is closed with a policy-violation
/// code. Returns the authenticated identity.
async fn authenticate(
    broker: &Broker,
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
) -> Option<(Role, String)> {
    let deadline = Duration::from_millis(AUTH_TIMEOUT_MS);
    let first = loop {
        match tokio::time::timeout(deadline, receiver.next()).await {
            Err(_) => {
                reject(sender, "Authentication timeout").await;
                return None;
            }
            Ok(None) => return None,
            Ok(Some(Err(_))) => return None,
            Ok(Some(Ok(Message::Text(text)))) => break text,
            Ok(Some(Ok(Message::Binary(data)))) => match String::from_utf8(data) {
                Ok(text) => break text,
                Err(_) => {
                    reject(sender, "Authentication required").await;
                    return None;
                }
            },
            Ok(Some(Ok(Message::Close(_)))) => return None,
            // Transport ping/pong may precede auth.
            Ok(Some(Ok(_))) => continue,
        }
    };

    // Parse leniently so each failure mode gets its own close reason.
    let value: Value = match serde_json::from_str(&first) {
        Ok(value) => value,
        Err(_) => {
            reject(sender, "Authentication required").await;
            return None;
        }
    };
    if value.get("type").and_then(Value::as_str) != Some("auth") {
        reject(sender, "Authentication required").await;
        return None;
    }
    let secret = value.get("secret").and_then(Value::as_str).unwrap_or("");
    if secret != broker.secret {
        warn!("auth rejected: invalid secret");
        reject(sender, "Invalid secret").await;
        return None;
    }
    let role = match value.get("role").and_then(Value::as_str) {
        Some("bridge") => Role::Bridge,
        Some("consumer") => Role::Consumer,
        _ => {
            reject(sender, "Invalid role").await;
            return None;
        }
    };
    let client_id = value
        .get("clientId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_client_id);
    Some((role, client_id))
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, reason: &'static str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close::POLICY_VIOLATION,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}
