//! Shared protocol definitions for the Aria Bridge host and its clients.
//! Keeping this in a dedicated crate lets every SDK and the broker agree on
//! one set of frame shapes and constants without pulling in runtime code.

pub mod constants;
pub mod events;
pub mod frames;

pub use constants::{
    close, AUTH_TIMEOUT_MS, BUFFER_LIMIT, DISCOVERY_HEARTBEAT_MS, HEARTBEAT_INTERVAL_MS,
    HEARTBEAT_TIMEOUT_MS, MESSAGE_LIMIT_CHARS, OVERLOAD_WINDOW_LIMIT, OVERLOAD_WINDOW_MS,
    PROTOCOL_VERSION, RECONNECT_INITIAL_DELAY_MS, RECONNECT_MAX_DELAY_MS,
    SCREENSHOT_MIN_INTERVAL_MS, SESSION_STALE_MS,
};
pub use events::{capability, is_gated_type, map_log_level, now_ms, Event, LevelTier, LlmFilter};
pub use frames::{
    generate_client_id, ClientFrame, ControlError, ControlRequest, ControlResult, Inbound,
    RateLimitReason, Role, ServerFrame,
};
