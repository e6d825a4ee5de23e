//! Session registry: every authenticated connection, bridge or consumer,
//! lives here until its socket closes or its HTTP session goes stale.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use aria_protocol::{ClientFrame, LevelTier, LlmFilter, Role};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::router::OverloadWindow;

/// Capability advertisement recorded from a bridge `hello`.
#[derive(Debug, Clone)]
pub struct HelloInfo {
    pub capabilities: HashSet<String>,
    pub platform: Option<String>,
    pub project_id: Option<String>,
    pub route: Option<String>,
    pub url: Option<String>,
    pub protocol: u64,
}

impl HelloInfo {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }
}

/// Ordered queue of control-plane frames awaiting an HTTP bridge's next
/// `control/poll`.
#[derive(Debug, Default)]
pub struct ControlQueue {
    items: Mutex<Vec<Value>>,
}

impl ControlQueue {
    pub fn push(&self, frame: Value) {
        self.items.lock().push(frame);
    }

    pub fn drain(&self) -> Vec<Value> {
        std::mem::take(&mut *self.items.lock())
    }
}

/// How frames reach a bridge: pushed down a WebSocket, or parked on a queue
/// for a polling HTTP session.
pub enum BridgeSender {
    Ws(mpsc::UnboundedSender<Value>),
    Http(Arc<ControlQueue>),
}

pub struct BridgeSession {
    pub client_id: String,
    pub sender: BridgeSender,
    pub hello: Option<HelloInfo>,
    /// Monotonic clock for the screenshot limiter; advanced only when a
    /// screenshot is actually forwarded.
    pub last_screenshot: Mutex<Option<Instant>>,
}

/// A consumer's filter settings. Empty `levels` means the `errors` default;
/// empty `capabilities` means no capability restriction on the consumer side.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub levels: HashSet<LevelTier>,
    pub capabilities: HashSet<String>,
    pub llm_filter: LlmFilter,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            levels: HashSet::from([LevelTier::Errors]),
            capabilities: HashSet::new(),
            llm_filter: LlmFilter::Off,
        }
    }
}

impl Subscription {
    /// Highest (least selective) subscribed tier rank.
    pub fn max_rank(&self) -> usize {
        self.levels
            .iter()
            .map(|tier| tier.rank())
            .max()
            .unwrap_or(LevelTier::Errors.rank())
    }

    pub fn from_frame(levels: &[String], capabilities: &[String], llm_filter: Option<&str>) -> Self {
        let parsed: HashSet<LevelTier> =
            levels.iter().filter_map(|l| LevelTier::parse(l)).collect();
        Self {
            levels: if parsed.is_empty() {
                HashSet::from([LevelTier::Errors])
            } else {
                parsed
            },
            capabilities: aria_protocol::events::normalize_set(capabilities),
            llm_filter: LlmFilter::parse(llm_filter),
        }
    }
}

pub struct ConsumerSession {
    pub client_id: String,
    pub tx: mpsc::UnboundedSender<Value>,
    pub subscription: Subscription,
}

/// Record of an in-flight control request awaiting its result.
pub struct PendingControl {
    pub reply_to: String,
    pub origin: Role,
}

/// Index entry for an HTTP bridge session.
pub struct HttpSessionMeta {
    pub client_id: String,
    pub last_seen: Mutex<Instant>,
}

/// All broker-owned state. One value behind an `Arc`, shared by the
/// transport handlers; no lock in here is ever held across an await point.
pub struct Broker {
    pub secret: String,
    bridges: DashMap<String, BridgeSession>,
    consumers: DashMap<String, ConsumerSession>,
    pending: DashMap<String, PendingControl>,
    http_sessions: DashMap<String, HttpSessionMeta>,
    pub overload: Mutex<OverloadWindow>,
}

impl Broker {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            bridges: DashMap::new(),
            consumers: DashMap::new(),
            pending: DashMap::new(),
            http_sessions: DashMap::new(),
            overload: Mutex::new(OverloadWindow::default()),
        }
    }

    pub fn register_ws_bridge(&self, client_id: String, tx: mpsc::UnboundedSender<Value>) {
        self.bridges.insert(
            client_id.clone(),
            BridgeSession {
                client_id,
                sender: BridgeSender::Ws(tx),
                hello: None,
                last_screenshot: Mutex::new(None),
            },
        );
    }

    pub fn register_http_bridge(&self, session_id: String, client_id: String) -> Arc<ControlQueue> {
        let queue = Arc::new(ControlQueue::default());
        self.bridges.insert(
            client_id.clone(),
            BridgeSession {
                client_id: client_id.clone(),
                sender: BridgeSender::Http(queue.clone()),
                hello: None,
                last_screenshot: Mutex::new(None),
            },
        );
        self.http_sessions.insert(
            session_id,
            HttpSessionMeta {
                client_id,
                last_seen: Mutex::new(Instant::now()),
            },
        );
        queue
    }

    pub fn register_consumer(&self, client_id: String, tx: mpsc::UnboundedSender<Value>) {
        self.consumers.insert(
            client_id.clone(),
            ConsumerSession {
                client_id,
                tx,
                subscription: Subscription::default(),
            },
        );
    }

    /// Record a bridge `hello`. Returns false when the bridge is unknown.
    pub fn record_hello(&self, client_id: &str, frame: &ClientFrame) -> bool {
        let ClientFrame::Hello {
            capabilities,
            platform,
            project_id,
            route,
            url,
            protocol,
        } = frame
        else {
            return false;
        };
        let Some(mut session) = self.bridges.get_mut(client_id) else {
            return false;
        };
        session.hello = Some(HelloInfo {
            capabilities: aria_protocol::events::normalize_set(capabilities),
            platform: platform.clone(),
            project_id: project_id.clone(),
            route: route.clone(),
            url: url.clone(),
            protocol: *protocol,
        });
        true
    }

    pub fn update_subscription(&self, client_id: &str, subscription: Subscription) -> bool {
        let Some(mut session) = self.consumers.get_mut(client_id) else {
            return false;
        };
        session.subscription = subscription;
        true
    }

    pub fn bridge_hello(&self, client_id: &str) -> Option<HelloInfo> {
        self.bridges.get(client_id).and_then(|s| s.hello.clone())
    }

    pub fn bridge_platform(&self, client_id: &str) -> Option<String> {
        self.bridges
            .get(client_id)
            .and_then(|s| s.hello.as_ref().and_then(|h| h.platform.clone()))
    }

    pub fn send_to_consumer(&self, client_id: &str, frame: Value) -> bool {
        match self.consumers.get(client_id) {
            Some(session) => session.tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn send_to_bridge(&self, client_id: &str, frame: Value) -> bool {
        match self.bridges.get(client_id) {
            Some(session) => match &session.sender {
                BridgeSender::Ws(tx) => tx.send(frame).is_ok(),
                BridgeSender::Http(queue) => {
                    queue.push(frame);
                    true
                }
            },
            None => false,
        }
    }

    /// Iterate connected consumers, applying `f` to each.
    pub fn for_each_consumer(&self, mut f: impl FnMut(&ConsumerSession)) {
        for session in self.consumers.iter() {
            f(session.value());
        }
    }

    /// Bridges currently advertising a capability.
    pub fn bridges_with_capability(&self, capability: &str) -> Vec<String> {
        self.bridges
            .iter()
            .filter(|entry| {
                entry
                    .hello
                    .as_ref()
                    .is_some_and(|h| h.has_capability(capability))
            })
            .map(|entry| entry.client_id.clone())
            .collect()
    }

    /// Run `f` against a bridge's screenshot clock. `None` when the bridge
    /// is unknown.
    pub fn with_screenshot_clock<T>(
        &self,
        client_id: &str,
        f: impl FnOnce(&mut Option<Instant>) -> T,
    ) -> Option<T> {
        self.bridges
            .get(client_id)
            .map(|session| f(&mut session.last_screenshot.lock()))
    }

    pub fn insert_pending(&self, id: String, pending: PendingControl) {
        self.pending.insert(id, pending);
    }

    pub fn take_pending(&self, id: &str) -> Option<PendingControl> {
        self.pending.remove(id).map(|(_, pending)| pending)
    }

    /// Remove a session and everything keyed by it: registry entry and any
    /// pending control whose originator it was.
    pub fn remove_session(&self, client_id: &str) {
        let removed_bridge = self.bridges.remove(client_id).is_some();
        let removed_consumer = self.consumers.remove(client_id).is_some();
        if removed_bridge || removed_consumer {
            self.pending.retain(|_, pending| pending.reply_to != client_id);
            debug!(client_id, "session removed");
        }
    }

    pub fn touch_http_session(&self, session_id: &str) -> bool {
        match self.http_sessions.get(session_id) {
            Some(meta) => {
                *meta.last_seen.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn http_client_id(&self, session_id: &str) -> Option<String> {
        self.http_sessions.get(session_id).map(|m| m.client_id.clone())
    }

    pub fn http_control_queue(&self, session_id: &str) -> Option<Arc<ControlQueue>> {
        let client_id = self.http_client_id(session_id)?;
        self.bridges.get(&client_id).and_then(|s| match &s.sender {
            BridgeSender::Http(queue) => Some(queue.clone()),
            BridgeSender::Ws(_) => None,
        })
    }

    pub fn remove_http_session(&self, session_id: &str) {
        if let Some((_, meta)) = self.http_sessions.remove(session_id) {
            self.remove_session(&meta.client_id);
        }
    }

    /// Drop HTTP sessions whose last heartbeat is older than `max_age`.
    pub fn sweep_stale_http_sessions(&self, max_age: std::time::Duration) -> usize {
        let stale: Vec<String> = self
            .http_sessions
            .iter()
            .filter(|entry| entry.last_seen.lock().elapsed() > max_age)
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in &stale {
            self.remove_http_session(session_id);
        }
        stale.len()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
