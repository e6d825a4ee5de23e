//! Reference bridge SDK for the Aria Bridge observability bus.
//!
//! A bridge pushes structured events (console, errors, navigation, network,
//! screenshots) to the workspace host and executes control requests routed
//! back to it. This crate is the canonical implementation of the client
//! protocol state machine: auth gate, `hello` handshake, ping/pong
//! heartbeat, jittered exponential reconnect, and a drop-oldest outbound
//! buffer that survives disconnects.
//!
//! ```no_run
//! use aria_bridge_client::{BridgeClient, BridgeConfig};
//!
//! # async fn demo() {
//! let client = BridgeClient::new(BridgeConfig::from_env());
//! client.on_control(|req| Ok(serde_json::json!({"echo": req.get("args")})));
//! client.start();
//! client.send_console("info", "bridge up");
//! # }
//! ```

mod buffer;
mod client;
mod config;
mod error;
mod sanitize;

pub use client::BridgeClient;
pub use config::{enabled_from_env, BridgeConfig};
pub use error::BridgeError;
