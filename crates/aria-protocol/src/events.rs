use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known capability names. Capabilities travel as strings on the wire
/// and are compared case-insensitively after lowercasing at ingress.
pub mod capability {
    pub const ERROR: &str = "error";
    pub const CONSOLE: &str = "console";
    pub const PAGEVIEW: &str = "pageview";
    pub const NAVIGATION: &str = "navigation";
    pub const SCREENSHOT: &str = "screenshot";
    pub const NETWORK: &str = "network";
    pub const CONTROL: &str = "control";
}

/// Event types that require both sides to have declared the matching
/// capability before they are fanned out.
const GATED_TYPES: [&str; 5] = [
    capability::PAGEVIEW,
    capability::SCREENSHOT,
    capability::CONTROL,
    capability::NETWORK,
    capability::NAVIGATION,
];

pub fn is_gated_type(kind: &str) -> bool {
    GATED_TYPES.iter().any(|t| t.eq_ignore_ascii_case(kind))
}

/// Normalize a wire capability/level list into a lowercase set.
pub fn normalize_set(values: &[String]) -> HashSet<String> {
    values.iter().map(|v| v.to_ascii_lowercase()).collect()
}

/// Subscription tiers, ordered from most to least selective. A consumer
/// subscribed at a tier receives every event whose mapped tier is at or
/// above it in this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LevelTier {
    Errors,
    Warn,
    Info,
    Trace,
}

impl LevelTier {
    pub fn rank(self) -> usize {
        match self {
            LevelTier::Errors => 0,
            LevelTier::Warn => 1,
            LevelTier::Info => 2,
            LevelTier::Trace => 3,
        }
    }

    /// Parse a subscription level name. Unknown names yield `None` and are
    /// ignored by the subscriber.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "errors" | "error" => Some(LevelTier::Errors),
            "warn" => Some(LevelTier::Warn),
            "info" => Some(LevelTier::Info),
            "trace" => Some(LevelTier::Trace),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LevelTier::Errors => "errors",
            LevelTier::Warn => "warn",
            LevelTier::Info => "info",
            LevelTier::Trace => "trace",
        }
    }
}

/// Milliseconds since the Unix epoch, the protocol's timestamp unit.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Map a raw event `level` onto the subscription tier it is delivered under.
/// Anything unrecognized (including `log`) counts as `info`.
pub fn map_log_level(level: &str) -> LevelTier {
    match level.to_ascii_lowercase().as_str() {
        "error" => LevelTier::Errors,
        "warn" => LevelTier::Warn,
        "debug" => LevelTier::Trace,
        _ => LevelTier::Info,
    }
}

/// Noise-reduction mode a consumer opts into at subscribe time. Unknown
/// strings collapse to `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmFilter {
    #[default]
    Off,
    Minimal,
    Aggressive,
}

impl LlmFilter {
    pub fn parse(name: Option<&str>) -> Self {
        match name.map(|n| n.to_ascii_lowercase()).as_deref() {
            Some("minimal") => LlmFilter::Minimal,
            Some("aggressive") => LlmFilter::Aggressive,
            _ => LlmFilter::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LlmFilter::Off => "off",
            LlmFilter::Minimal => "minimal",
            LlmFilter::Aggressive => "aggressive",
        }
    }

    /// Whether an event at `level` survives this filter (overload guard
    /// aside).
    pub fn allows(self, level: &str) -> bool {
        let level = level.to_ascii_lowercase();
        match self {
            LlmFilter::Off => true,
            LlmFilter::Minimal => !matches!(level.as_str(), "debug" | "log"),
            LlmFilter::Aggressive => !matches!(level.as_str(), "debug" | "log" | "info"),
        }
    }
}

/// A bridge event. The broker interprets `type`, `level` and the screenshot
/// fields; everything else rides along untouched via the flattened map so
/// matching consumers see the frame exactly as the bridge sent it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breadcrumbs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Effective level for routing decisions; events without one route as
    /// `info`.
    pub fn level_or_default(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn tier(&self) -> LevelTier {
        map_log_level(self.level_or_default())
    }
}
