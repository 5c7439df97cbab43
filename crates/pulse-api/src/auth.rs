//! The signed-request gate for registration endpoints.
//!
//! Handlers call [`freshness_gate`] before touching the store, then
//! [`verify_request`] once the key material is chosen (the stored key for
//! known instances, the submitted key on first contact). Verification
//! errors map onto the wire error codes.

use chrono::{DateTime, Utc};
use serde_json::Value;

use pulse_core::signature::{SignatureBlock, SignatureError, verify_signed_request};

use crate::error::ApiError;

fn map_signature_error(error: SignatureError) -> ApiError {
    match error {
        SignatureError::Missing => ApiError::bad_request("request has no signature"),
        SignatureError::Malformed(message) => {
            ApiError::bad_request(format!("malformed signature: {message}"))
        }
        SignatureError::Stale => ApiError::signature_timestamp_expired(),
        SignatureError::Invalid(message) => ApiError::invalid_signature(message),
    }
}

/// Extracts the signature block and checks shape plus freshness.
///
/// # Errors
///
/// Returns 400 for missing/malformed blocks and 401 for stale timestamps.
pub fn freshness_gate(
    payload: &Value,
    now: DateTime<Utc>,
    window_ms: i64,
) -> Result<SignatureBlock, ApiError> {
    let block = SignatureBlock::from_payload(payload).map_err(map_signature_error)?;
    block
        .check_freshness(now, window_ms)
        .map_err(map_signature_error)?;
    Ok(block)
}

/// Verifies the detached signature over the full payload.
///
/// # Errors
///
/// Returns 401 `INVALID_SIGNATURE` when key parsing or verification fails.
pub fn verify_request(
    key_material: &str,
    method: &str,
    path: &str,
    payload: &Value,
    now: DateTime<Utc>,
    window_ms: i64,
) -> Result<(), ApiError> {
    verify_signed_request(key_material, method, path, payload, now, window_ms)
        .map_err(map_signature_error)
}
