use std::path::Path;

use aria_protocol::{
    BUFFER_LIMIT, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, RECONNECT_INITIAL_DELAY_MS,
    RECONNECT_MAX_DELAY_MS,
};
use serde_json::Value;

use crate::error::BridgeError;

/// Connection settings for a bridge. The timing knobs default to the
/// protocol constants; tests shrink them.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub url: String,
    pub secret: String,
    pub client_id: Option<String>,
    pub project_id: Option<String>,
    pub capabilities: Vec<String>,
    pub platform: String,
    /// Page url advertised in `hello`, for bridges that have one.
    pub page_url: Option<String>,
    pub route: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub buffer_limit: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9876".into(),
            secret: "dev-secret".into(),
            client_id: None,
            project_id: None,
            capabilities: vec!["console".into(), "error".into()],
            platform: "rust".into(),
            page_url: None,
            route: None,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            reconnect_initial_delay_ms: RECONNECT_INITIAL_DELAY_MS,
            reconnect_max_delay_ms: RECONNECT_MAX_DELAY_MS,
            buffer_limit: BUFFER_LIMIT,
        }
    }
}

impl BridgeConfig {
    /// Build from `ARIA_BRIDGE_URL` / `ARIA_BRIDGE_SECRET`, falling back to
    /// the local defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("ARIA_BRIDGE_URL") {
            if !url.is_empty() {
                cfg.url = url;
            }
        }
        if let Ok(secret) = std::env::var("ARIA_BRIDGE_SECRET") {
            if !secret.is_empty() {
                cfg.secret = secret;
            }
        }
        cfg
    }

    /// Read url and secret from the workspace discovery file
    /// (`.aria/aria-bridge.json` under `workspace`).
    pub fn from_workspace(workspace: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = workspace
            .as_ref()
            .join(".aria")
            .join("aria-bridge.json");
        let raw = std::fs::read_to_string(&path)
            .map_err(|_| BridgeError::Discovery(path.clone()))?;
        let meta: Value = serde_json::from_str(&raw)?;
        let url = meta
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Discovery(path.clone()))?;
        let secret = meta
            .get("secret")
            .and_then(Value::as_str)
            .ok_or(BridgeError::Discovery(path))?;
        Ok(Self {
            url: url.to_string(),
            secret: secret.to_string(),
            ..Self::default()
        })
    }
}

/// Whether the bridge should auto-enable in this process. `ARIA_BRIDGE=1`
/// forces it on, `ARIA_BRIDGE=0` forces it off; otherwise only debug builds
/// enable themselves.
pub fn enabled_from_env() -> bool {
    match std::env::var("ARIA_BRIDGE").ok().as_deref() {
        Some("1") | Some("true") => true,
        Some("0") | Some("false") => false,
        _ => cfg!(debug_assertions),
    }
}
