//! Structural validation for the published JWKS document.
//!
//! The `/.well-known/jwks.json` route serves the configured
//! `CLOUD_JWKS_JSON` verbatim; this module only checks that the document is
//! a `{keys: [...]}` object before it goes on the wire.

use serde_json::Value;

use crate::error::{Error, Result};

/// How long clients may cache the published JWKS, in seconds.
pub const JWKS_CACHE_MAX_AGE_SECONDS: u64 = 300;

/// Validates the JWKS document structure and returns the parsed value.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the document is not valid JSON, not
/// an object, has no `keys` array, or any entry is not an object.
pub fn validate_jwks_json(json: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::InvalidInput(format!("JWKS is not valid JSON: {e}")))?;

    let keys = value
        .as_object()
        .and_then(|object| object.get("keys"))
        .and_then(Value::as_array)
        .ok_or_else(|| Error::InvalidInput("JWKS must be an object with a keys array".to_string()))?;

    if keys.iter().any(|entry| !entry.is_object()) {
        return Err(Error::InvalidInput(
            "every JWKS entry must be an object".to_string(),
        ));
    }

    Ok(value)
}
