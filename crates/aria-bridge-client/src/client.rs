//! The bridge state machine: connect, authenticate, say hello, drain the
//! buffer, heartbeat, and reconnect with jittered backoff until stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aria_protocol::{now_ms, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::buffer::EventBuffer;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::sanitize;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ControlHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

struct Inner {
    cfg: BridgeConfig,
    buffer: Mutex<EventBuffer>,
    handler: Mutex<Option<ControlHandler>>,
    running: AtomicBool,
    /// Writer channel of the live connection; `None` while disconnected.
    conn: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    /// Flipped to true by `stop()` so a live session loop winds down.
    shutdown: watch::Sender<bool>,
}

/// Handle to one bridge. Cheap to clone; all clones share the same buffer
/// and connection.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<Inner>,
}

impl BridgeClient {
    pub fn new(cfg: BridgeConfig) -> Self {
        let buffer = EventBuffer::new(cfg.buffer_limit);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cfg,
                buffer: Mutex::new(buffer),
                handler: Mutex::new(None),
                running: AtomicBool::new(false),
                conn: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Register the control-request handler. Errors become
    /// `control_result {ok:false}`; they never take the connection down.
    pub fn on_control<F>(&self, handler: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }

    pub fn send_console(&self, level: &str, message: &str) {
        let _ = self.send_event(json!({
            "type": "console",
            "level": level,
            "message": message,
            "timestamp": now_ms(),
        }));
    }

    pub fn send_error(&self, message: &str, stack: Option<&str>) {
        let mut event = json!({
            "type": "error",
            "level": "error",
            "message": message,
            "timestamp": now_ms(),
        });
        if let Some(stack) = stack {
            event["stack"] = Value::String(stack.to_string());
        }
        let _ = self.send_event(event);
    }

    /// Sanitize and ship one event: out the socket when connected, into the
    /// drop-oldest buffer otherwise. Never blocks.
    pub fn send_event(&self, event: Value) -> Result<(), BridgeError> {
        let event = sanitize::prepare(event)?;
        // Buffer lock taken first, same as the drain path, so a send cannot
        // slip between drain and connection publish.
        let mut buffer = self.inner.buffer.lock();
        let leftover = match self.inner.conn.lock().as_ref() {
            Some(tx) => tx.send(event).err().map(|e| e.0),
            None => Some(event),
        };
        if let Some(event) = leftover {
            buffer.push(event);
        }
        Ok(())
    }

    /// Spawn the reconnect loop on the current runtime.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    /// Run until [`stop`](Self::stop): connect, serve the session, then back
    /// off and retry. The backoff doubles per failed attempt, caps at the
    /// configured maximum, and resets after a session that completed its
    /// handshake.
    pub async fn run(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.shutdown.send_replace(false);
        let initial = Duration::from_millis(self.inner.cfg.reconnect_initial_delay_ms);
        let max = Duration::from_millis(self.inner.cfg.reconnect_max_delay_ms);
        let mut delay = initial;

        while self.inner.running.load(Ordering::SeqCst) {
            match self.connect_once().await {
                Ok(()) => {
                    debug!("session ended, reconnecting");
                    delay = initial;
                }
                Err(err) => {
                    debug!(%err, "connect attempt failed");
                }
            }
            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }
            time::sleep(jitter(delay)).await;
            delay = next_delay(delay, max);
        }
    }

    /// Stop the state machine: no further reconnects, current socket closes
    /// with a normal-closure code.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
        *self.inner.conn.lock() = None;
    }

    /// One full session: handshake, buffer drain, then the read/heartbeat
    /// loop until the connection dies. `Ok` means the handshake completed.
    async fn connect_once(&self) -> Result<(), BridgeError> {
        let cfg = &self.inner.cfg;
        let mut request = cfg.url.as_str().into_client_request()?;
        if let Ok(header) = HeaderValue::from_str(&cfg.secret) {
            request.headers_mut().insert("X-Bridge-Secret", header);
        }
        let (mut ws, _) = connect_async(request).await?;

        let mut auth = json!({"type": "auth", "secret": cfg.secret, "role": "bridge"});
        if let Some(client_id) = &cfg.client_id {
            auth["clientId"] = Value::String(client_id.clone());
        }
        send_json(&mut ws, &auth).await?;
        self.wait_for_auth_success(&mut ws).await?;

        send_json(
            &mut ws,
            &json!({
                "type": "hello",
                "capabilities": cfg.capabilities,
                "platform": cfg.platform,
                "projectId": cfg.project_id,
                "protocol": PROTOCOL_VERSION,
                "url": cfg.page_url,
                "route": cfg.route,
            }),
        )
        .await?;

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // Drain under the buffer lock and publish the connection before
        // releasing it, so concurrent sends keep FIFO order with the
        // buffered backlog.
        {
            let mut buffer = self.inner.buffer.lock();
            let (pending, dropped) = buffer.drain();
            for event in pending {
                let _ = tx.send(event);
            }
            if dropped > 0 {
                let _ = tx.send(json!({
                    "type": "info",
                    "level": "info",
                    "message": format!("bridge buffered drop count={dropped}"),
                    "timestamp": now_ms(),
                }));
            }
            *self.inner.conn.lock() = Some(tx.clone());
        }

        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let outcome = self.session_loop(&tx, &mut read, &mut shutdown_rx).await;

        *self.inner.conn.lock() = None;
        drop(tx);
        let _ = writer.await;
        outcome
    }

    /// Read loop plus heartbeat timers. The pong deadline arms when a ping
    /// goes out and disarms on pong; expiry kills the session.
    async fn session_loop(
        &self,
        tx: &mpsc::UnboundedSender<Value>,
        read: &mut futures_util::stream::SplitStream<WsStream>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        let cfg = &self.inner.cfg;
        let heartbeat_timeout = Duration::from_millis(cfg.heartbeat_timeout_ms);
        let mut interval = time::interval(Duration::from_millis(cfg.heartbeat_interval_ms));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so the first ping lands one
        // interval in.
        interval.tick().await;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let expiry = pong_deadline.unwrap_or_else(far_future);
            tokio::select! {
                _ = interval.tick() => {
                    if tx.send(json!({"type": "ping"})).is_err() {
                        return Ok(());
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + heartbeat_timeout);
                    }
                }
                _ = time::sleep_until(expiry), if pong_deadline.is_some() => {
                    warn!("heartbeat timeout, closing connection");
                    return Ok(());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                match value.get("type").and_then(Value::as_str) {
                                    Some("ping") => {
                                        let _ = tx.send(json!({"type": "pong"}));
                                    }
                                    Some("pong") => {
                                        pong_deadline = None;
                                    }
                                    Some("control_request") => {
                                        self.respond_control(tx, &value);
                                    }
                                    _ => {}
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Ok(()),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Auth gate: wait for `auth_success` within the heartbeat-timeout
    /// window. Pings are answered and control requests served in the
    /// meantime, but neither satisfies the gate.
    async fn wait_for_auth_success(&self, ws: &mut WsStream) -> Result<(), BridgeError> {
        let deadline =
            Instant::now() + Duration::from_millis(self.inner.cfg.heartbeat_timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::AuthTimeout);
            }
            match time::timeout(remaining, ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    match value.get("type").and_then(Value::as_str) {
                        Some("auth_success") => return Ok(()),
                        Some("ping") => {
                            send_json(ws, &json!({"type": "pong"})).await?;
                        }
                        Some("control_request") => {
                            if let Some(response) = self.control_response(&value) {
                                send_json(ws, &response).await?;
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Err(BridgeError::AuthTimeout),
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(err))) => return Err(BridgeError::Ws(err)),
                Err(_) => return Err(BridgeError::AuthTimeout),
            }
        }
    }

    fn respond_control(&self, tx: &mpsc::UnboundedSender<Value>, request: &Value) {
        if let Some(response) = self.control_response(request) {
            let _ = tx.send(response);
        }
    }

    /// Run the registered handler over one `control_request`. A missing
    /// handler drops the request; a failing one answers with the error.
    fn control_response(&self, request: &Value) -> Option<Value> {
        let handler = self.inner.handler.lock().clone()?;
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let response = match handler(request.clone()) {
            Ok(result) => json!({
                "type": "control_result",
                "id": id,
                "ok": true,
                "result": result,
            }),
            Err(message) => json!({
                "type": "control_result",
                "id": id,
                "ok": false,
                "error": {"message": message},
            }),
        };
        Some(response)
    }

    #[doc(hidden)]
    pub fn buffered_len(&self) -> usize {
        self.inner.buffer.lock().len()
    }
}

async fn send_json(ws: &mut WsStream, value: &Value) -> Result<(), BridgeError> {
    ws.send(Message::Text(value.to_string())).await?;
    Ok(())
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

/// Next base delay: double, clamped to the ceiling.
pub(crate) fn next_delay(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}

/// Uniform jitter factor in [1.0, 1.5], applied after the cap.
fn jitter(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(1.0..=1.5);
    base.mul_f64(factor)
}
