//! Base64 helpers shared by signature verification and payload hashing.
//!
//! Instances encode binary material (public keys, signatures, hashes) in
//! several base64 dialects depending on their tooling. The control plane
//! always emits unpadded base64url, and decodes flexibly.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

use crate::error::{Error, Result};

/// Encodes bytes as base64url without padding.
#[must_use]
pub fn encode_base64_url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes a base64 string in any common dialect.
///
/// Accepts base64url and standard base64, with or without padding.
/// Surrounding whitespace is ignored.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when no dialect decodes the input.
pub fn decode_base64_flexible(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE.decode(trimmed))
        .or_else(|_| STANDARD.decode(trimmed))
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| Error::InvalidInput(format!("invalid base64 input: {e}")))
}
