//! Send-path hygiene: message truncation and one-level redaction of
//! obviously sensitive keys. Applied to every event before it is buffered
//! or sent, so nothing unsanitized ever leaves the process.

use aria_protocol::MESSAGE_LIMIT_CHARS;
use serde_json::Value;

use crate::error::BridgeError;

const REDACTED: &str = "[redacted]";
const SENSITIVE_FRAGMENTS: [&str; 3] = ["token", "secret", "password"];
const TRUNCATION_MARKER: &str = "\u{2026}[truncated]";

/// Validate and sanitize an outbound event in place.
pub fn prepare(mut event: Value) -> Result<Value, BridgeError> {
    {
        let Some(map) = event.as_object_mut() else {
            return Err(BridgeError::InvalidEvent);
        };
        let valid_type = map
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.is_empty());
        if !valid_type {
            return Err(BridgeError::InvalidEvent);
        }

        if let Some(Value::String(message)) = map.get_mut("message") {
            if let Some(truncated) = truncate(message) {
                *message = truncated;
            }
        }
        for key in ["args", "breadcrumbs"] {
            if let Some(value) = map.get_mut(key) {
                redact(value);
            }
        }
    }
    Ok(event)
}

/// Cap at [`MESSAGE_LIMIT_CHARS`] characters, marking the cut. Returns
/// `None` when the string already fits.
fn truncate(message: &str) -> Option<String> {
    let mut indices = message.char_indices();
    let cut = indices.nth(MESSAGE_LIMIT_CHARS).map(|(i, _)| i)?;
    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&message[..cut]);
    out.push_str(TRUNCATION_MARKER);
    Some(out)
}

/// Replace values of sensitive-looking keys, one object level deep. Arrays
/// are walked so lists of objects stay covered; nested objects inside a
/// value are left alone.
fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if is_sensitive(key) {
                    *val = Value::String(REDACTED.into());
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact(item);
            }
        }
        _ => {}
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_FRAGMENTS.iter().any(|frag| key.contains(frag))
}
