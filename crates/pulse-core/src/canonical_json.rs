//! Canonical JSON serialization for deterministic signature hashing.
//!
//! Signed request payloads are hashed over a canonical serialization so the
//! instance and the control plane agree on the exact bytes regardless of key
//! insertion order or whitespace. Canonical JSON has:
//!
//! - Object keys sorted lexicographically (UTF-8 byte order) at every level
//! - Array order preserved
//! - No whitespace
//! - Numbers and strings in their natural JSON form

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::encoding::encode_base64_url;
use crate::error::{Error, Result};

/// Serializes `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the value cannot be converted to JSON.
#[must_use = "canonical bytes should be used for hashing/signing"]
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let v = serde_json::to_value(value).map_err(|e| Error::serialization(e.to_string()))?;
    let mut out = Vec::<u8>::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

/// Same as [`to_canonical_bytes`], but returns a UTF-8 string.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if serialization or UTF-8 conversion fails.
#[must_use = "canonical string should be used for hashing/signing"]
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String> {
    let bytes = to_canonical_bytes(value)?;
    String::from_utf8(bytes).map_err(|_| Error::serialization("canonical JSON was not UTF-8"))
}

/// Hashes a payload for signing: SHA-256 over the canonical bytes, encoded
/// as unpadded base64url.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the payload cannot be canonicalized.
pub fn payload_hash<T: Serialize>(value: &T) -> Result<String> {
    let bytes = to_canonical_bytes(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(encode_base64_url(&digest))
}

fn write_value(v: &Value, out: &mut Vec<u8>) -> Result<()> {
    match v {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            // serde_json's number formatting is the natural JSON form.
            serde_json::to_writer(&mut *out, n)
                .map_err(|e| Error::serialization(e.to_string()))?;
        }
        Value::String(s) => {
            // Writes JSON string with quotes + escaping, no whitespace.
            serde_json::to_writer(&mut *out, s)
                .map_err(|e| Error::serialization(e.to_string()))?;
        }
        Value::Array(arr) => {
            out.push(b'[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(map, out)?,
    }
    Ok(())
}

fn write_object(map: &Map<String, Value>, out: &mut Vec<u8>) -> Result<()> {
    out.push(b'{');

    // Collect keys and sort deterministically by UTF-8 byte order.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    for (i, k) in keys.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }

        serde_json::to_writer(&mut *out, *k).map_err(|e| Error::serialization(e.to_string()))?;
        out.push(b':');

        if let Some(val) = map.get(*k) {
            write_value(val, out)?;
        }
    }

    out.push(b'}');
    Ok(())
}
