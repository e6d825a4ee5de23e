use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::events::Event;

/// Session role declared in the `auth` frame. Immutable once authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Bridge,
    Consumer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Bridge => "bridge",
            Role::Consumer => "consumer",
        }
    }
}

/// Control-plane request, correlated by `id`. The broker assigns an id when
/// the originator omits one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(
        default,
        rename = "expectResult",
        skip_serializing_if = "Option::is_none"
    )]
    pub expect_result: Option<bool>,
    #[serde(default, rename = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResult {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResult {
    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(ControlError {
                message: message.into(),
                stack: None,
            }),
        }
    }
}

/// Frames a client may send to the host. Anything whose `type` is not one of
/// these tags is a bridge event (see [`Inbound`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        secret: String,
        role: Role,
        #[serde(default, rename = "clientId", skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    Hello {
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
        #[serde(default, rename = "projectId", skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        route: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default = "default_protocol")]
        protocol: u64,
    },
    Subscribe {
        #[serde(default)]
        levels: Vec<String>,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        llm_filter: Option<String>,
    },
    Ping,
    Pong,
    ControlRequest(ControlRequest),
    ControlResult(ControlResult),
}

fn default_protocol() -> u64 {
    1
}

/// Reasons a screenshot is bounced back to its bridge instead of fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    MissingCapability,
    RateLimit,
    NoConsumers,
    InvalidFormat,
}

/// Frames the host sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthSuccess {
        role: Role,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    HelloAck {
        #[serde(rename = "clientId")]
        client_id: String,
        protocol: u64,
    },
    SubscribeAck {
        #[serde(rename = "clientId")]
        client_id: String,
        levels: Vec<String>,
        capabilities: Vec<String>,
        llm_filter: String,
    },
    Ping,
    Pong,
    ControlRequest(ControlRequest),
    ControlResult(ControlResult),
    ControlForwarded {
        id: String,
        delivered: usize,
    },
    RateLimitNotice {
        reason: RateLimitReason,
        #[serde(
            default,
            rename = "retryAfterMs",
            skip_serializing_if = "Option::is_none"
        )]
        retry_after_ms: Option<u64>,
        message: String,
    },
}

impl ServerFrame {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("server frame serializes")
    }
}

const CLIENT_FRAME_TAGS: [&str; 7] = [
    "auth",
    "hello",
    "subscribe",
    "ping",
    "pong",
    "control_request",
    "control_result",
];

/// A classified inbound text frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    Frame(ClientFrame),
    Event(Event),
}

impl Inbound {
    /// Classify one wire frame. Protocol tags deserialize strictly; any
    /// other object with a non-empty string `type` is an event. Malformed
    /// frames yield `None` and are ignored by the host after a log line.
    pub fn parse(text: &str) -> Option<Inbound> {
        let value: Value = serde_json::from_str(text).ok()?;
        let kind = value.get("type")?.as_str()?;
        if kind.is_empty() {
            return None;
        }
        if CLIENT_FRAME_TAGS.contains(&kind) {
            serde_json::from_value(value).ok().map(Inbound::Frame)
        } else {
            serde_json::from_value(value).ok().map(Inbound::Event)
        }
    }
}

/// Synthesize a client id for sessions that did not pick one.
pub fn generate_client_id() -> String {
    Uuid::new_v4().to_string()
}
