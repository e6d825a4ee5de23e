//! Protocol constants shared by the host and every SDK. These are the
//! canonical defaults; clients may tighten the timings but must keep the
//! timeout strictly above the interval.

/// Wire protocol revision advertised in `hello`.
pub const PROTOCOL_VERSION: u64 = 2;

/// How often a connected bridge sends `ping`.
pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// How long a bridge waits for `pong` (and for `auth_success`) before it
/// declares the connection dead. Must exceed [`HEARTBEAT_INTERVAL_MS`].
pub const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

/// First reconnect delay after a dropped connection.
pub const RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;

/// Reconnect delay ceiling.
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Outbound event buffer capacity on the bridge side (drop-oldest).
pub const BUFFER_LIMIT: usize = 200;

/// Host-side deadline for the in-band `auth` frame on a fresh socket.
pub const AUTH_TIMEOUT_MS: u64 = 5_000;

/// Minimum spacing between `screenshot` events from one bridge.
pub const SCREENSHOT_MIN_INTERVAL_MS: u64 = 2_000;

/// Length of the router's overload window.
pub const OVERLOAD_WINDOW_MS: u64 = 10_000;

/// Events-per-window count at which the overload guard engages.
pub const OVERLOAD_WINDOW_LIMIT: usize = 500;

/// HTTP bridge sessions and the workspace lock go stale after this long
/// without a heartbeat.
pub const SESSION_STALE_MS: u64 = 15_000;

/// How often the host rewrites `heartbeatAt` in the discovery file.
pub const DISCOVERY_HEARTBEAT_MS: u64 = 5_000;

/// Event `message` strings longer than this are truncated on the send path.
pub const MESSAGE_LIMIT_CHARS: usize = 4_000;

/// WebSocket close codes used by the protocol.
pub mod close {
    /// Orderly shutdown.
    pub const NORMAL: u16 = 1000;
    /// Auth failures during the handshake phase.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Unexpected host-side failure.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Application-level auth rejection.
    pub const INVALID_SECRET: u16 = 4001;
    /// Malformed `hello`.
    pub const INVALID_HELLO: u16 = 4002;
}
