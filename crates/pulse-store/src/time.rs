//! Timestamp helpers for the TEXT-encoded store.
//!
//! All timestamps are stored as RFC 3339 UTC strings with millisecond
//! precision and a `Z` suffix. The fixed-width format makes lexicographic
//! comparison in SQL equivalent to chronological comparison.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};

use crate::error::{Result, StoreError};

/// Formats a timestamp for storage.
#[must_use]
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a stored timestamp.
///
/// # Errors
///
/// Returns [`StoreError::InvalidRow`] when the string is not RFC 3339.
pub fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::invalid_row(format!("invalid timestamp '{value}': {e}")))
}

/// Parses an optional stored timestamp.
///
/// # Errors
///
/// Returns [`StoreError::InvalidRow`] when a present value is not RFC 3339.
pub fn parse_ts_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

/// Truncates a timestamp to the start of its UTC minute.
#[must_use]
pub fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Truncates a timestamp to the start of its UTC hour.
#[must_use]
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_minute(ts)
        .with_minute(0)
        .unwrap_or(ts)
}
