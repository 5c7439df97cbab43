//! Tolerant telemetry extraction from instance trigger responses.
//!
//! Instances return a nested, partly-untrusted JSON document. Each sample
//! field is read from a designated path via permissive readers; anything
//! that does not conform becomes null rather than an error. The scalar
//! `accepted`/`dedupHit` flags fall back through the protocol-verification
//! block, then the `data` block, then the root, defaulting to false.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Telemetry schema version stamped when the response does not carry one.
pub const TELEMETRY_SCHEMA_VERSION: i64 = 1;

/// Default cap on the stored raw response, in bytes.
pub const TELEMETRY_RAW_MAX_BYTES_DEFAULT: usize = 4_096;

/// Flat projection of one trigger response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTelemetry {
    /// Whether the instance accepted the trigger.
    pub accepted: bool,
    /// Whether the instance reported a dedup hit.
    pub dedup_hit: bool,
    /// Telemetry schema version.
    pub schema_ver: i64,
    /// Sample timestamp (caller-supplied now).
    pub collected_at: DateTime<Utc>,
    /// Protocol verification time in milliseconds.
    pub verify_ms: Option<i64>,
    /// Items checked by the instance run.
    pub items_checked: Option<i64>,
    /// Items that failed verification.
    pub items_failed: Option<i64>,
    /// Total instance-side run time in milliseconds.
    pub total_ms: Option<i64>,
    /// Application version reported in the response.
    pub app_version: Option<String>,
    /// Instance-side error code, if any.
    pub error_code: Option<String>,
    /// Raw response body, truncated on a UTF-8 character boundary.
    pub raw_json: Option<String>,
}

/// Walks a dotted path through nested objects.
fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Reads a non-empty trimmed string; anything else is null.
#[must_use]
pub fn read_string(value: Option<&Value>) -> Option<String> {
    let trimmed = value?.as_str()?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Reads a boolean: true/false, 0/1, or their string forms
/// (case-insensitive); anything else is null.
#[must_use]
pub fn read_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Reads a number: finite numbers round to integer, base-10 decimal strings
/// parse; anything else is null.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn read_number(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                let f = n.as_f64()?;
                if f.is_finite() {
                    // Float-to-int casts saturate, so out-of-range values
                    // clamp rather than wrap.
                    Some(f.round() as i64)
                } else {
                    None
                }
            }
        }
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Truncates a string to at most `max_bytes` on a UTF-8 character boundary.
#[must_use]
pub fn truncate_utf8(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

/// Reads a scalar flag through the `protocolVerification -> data -> root`
/// fallback chain.
fn read_flag(root: &Value, field: &str) -> bool {
    read_bool(lookup(root, &["data", "protocolVerification", field]))
        .or_else(|| read_bool(lookup(root, &["data", field])))
        .or_else(|| read_bool(root.get(field)))
        .unwrap_or(false)
}

/// Projects a raw trigger response into the flat sample shape.
///
/// Unparseable bodies yield a sample with defaults and the truncated raw
/// text; ingestion never fails on a misbehaving instance.
#[must_use]
pub fn parse_telemetry(raw_body: &str, now: DateTime<Utc>, raw_max_bytes: usize) -> ParsedTelemetry {
    let root: Value = serde_json::from_str(raw_body).unwrap_or(Value::Null);
    let raw_json = if raw_body.is_empty() {
        None
    } else {
        Some(truncate_utf8(raw_body, raw_max_bytes).to_string())
    };

    ParsedTelemetry {
        accepted: read_flag(&root, "accepted"),
        dedup_hit: read_flag(&root, "dedupHit"),
        schema_ver: read_number(lookup(&root, &["data", "schemaVer"]))
            .unwrap_or(TELEMETRY_SCHEMA_VERSION),
        collected_at: now,
        verify_ms: read_number(lookup(&root, &["data", "protocolVerification", "verifyMs"])),
        items_checked: read_number(lookup(&root, &["data", "protocolVerification", "itemsChecked"])),
        items_failed: read_number(lookup(&root, &["data", "protocolVerification", "itemsFailed"])),
        total_ms: read_number(lookup(&root, &["data", "timings", "totalMs"])),
        app_version: read_string(lookup(&root, &["data", "instance", "appVersion"])),
        error_code: read_string(lookup(&root, &["data", "error", "code"])),
        raw_json,
    }
}
