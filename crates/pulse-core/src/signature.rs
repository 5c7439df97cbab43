//! Ed25519 detached-signature verification for instance requests.
//!
//! Every mutating registration request carries a `signature` object proving
//! possession of the instance's private key. The message actually signed is
//! the newline-joined tuple:
//!
//! ```text
//! NP-CLOUD-SIGN-V1\nMETHOD\nPATH\nbodyHash\nts\nnonce
//! ```
//!
//! where `bodyHash` is the canonical hash of the payload minus the
//! `signature` field. Verification fails closed: any parse error in the
//! key material, signature bytes, or timestamp rejects the request.

use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{PUBLIC_KEY_LENGTH, Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical_json::payload_hash;
use crate::encoding::decode_base64_flexible;

/// Domain-separation prefix for the signed message.
pub const SIGNING_PREFIX: &str = "NP-CLOUD-SIGN-V1";

/// Default freshness window for inbound signatures (5 minutes).
pub const DEFAULT_SIGNATURE_WINDOW_MS: i64 = 5 * 60 * 1000;

const MIN_NONCE_CHARS: usize = 8;
const MIN_SIG_CHARS: usize = 16;

/// The `signature` object attached to signed instance requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// Signature algorithm; only `EdDSA` is accepted.
    pub alg: String,
    /// Request timestamp (RFC 3339 UTC). The raw string participates in the
    /// signed message; the parsed instant is freshness-checked.
    pub ts: String,
    /// Caller-chosen nonce, at least 8 characters.
    pub nonce: String,
    /// Detached signature, base64-encoded, at least 16 characters.
    pub sig: String,
    /// Optional key identifier chosen by the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// Signature verification error.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// The request carried no `signature` object.
    #[error("request has no signature")]
    Missing,

    /// The `signature` object was structurally invalid.
    #[error("malformed signature block: {0}")]
    Malformed(String),

    /// The signature timestamp is outside the freshness window.
    #[error("signature timestamp outside freshness window")]
    Stale,

    /// Cryptographic verification failed (bad key, bad signature bytes, or
    /// mismatched message).
    #[error("signature verification failed: {0}")]
    Invalid(String),
}

impl SignatureBlock {
    /// Extracts and validates the `signature` object from a request payload.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Missing`] when absent and
    /// [`SignatureError::Malformed`] when present but structurally invalid.
    pub fn from_payload(payload: &Value) -> Result<Self, SignatureError> {
        let raw = payload.get("signature").ok_or(SignatureError::Missing)?;
        let block: Self = serde_json::from_value(raw.clone())
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        block.validate_shape()?;
        Ok(block)
    }

    /// Validates algorithm and minimum field lengths.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Malformed`] on any shape violation.
    pub fn validate_shape(&self) -> Result<(), SignatureError> {
        if self.alg != "EdDSA" {
            return Err(SignatureError::Malformed(format!(
                "unsupported algorithm: {}",
                self.alg
            )));
        }
        if self.nonce.chars().count() < MIN_NONCE_CHARS {
            return Err(SignatureError::Malformed(format!(
                "nonce must be at least {MIN_NONCE_CHARS} characters"
            )));
        }
        if self.sig.chars().count() < MIN_SIG_CHARS {
            return Err(SignatureError::Malformed(format!(
                "sig must be at least {MIN_SIG_CHARS} characters"
            )));
        }
        if self.ts.trim().is_empty() {
            return Err(SignatureError::Malformed("ts must not be empty".to_string()));
        }
        Ok(())
    }

    /// Checks `|now - ts| <= window_ms`. The exact boundary accepts.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Malformed`] when `ts` does not parse and
    /// [`SignatureError::Stale`] when outside the window.
    pub fn check_freshness(
        &self,
        now: DateTime<Utc>,
        window_ms: i64,
    ) -> Result<(), SignatureError> {
        let ts = DateTime::parse_from_rfc3339(&self.ts)
            .map_err(|e| SignatureError::Malformed(format!("unparseable ts: {e}")))?
            .with_timezone(&Utc);
        let skew_ms = (now - ts).num_milliseconds().abs();
        if skew_ms > window_ms {
            return Err(SignatureError::Stale);
        }
        Ok(())
    }
}

/// Builds the newline-joined message that the instance signed.
#[must_use]
pub fn signing_message(method: &str, path: &str, body_hash: &str, ts: &str, nonce: &str) -> String {
    format!(
        "{SIGNING_PREFIX}\n{}\n{path}\n{body_hash}\n{ts}\n{nonce}",
        method.to_uppercase()
    )
}

/// Returns the payload with the `signature` field removed, as hashed for
/// verification.
#[must_use]
pub fn payload_without_signature(payload: &Value) -> Value {
    let mut stripped = payload.clone();
    if let Some(object) = stripped.as_object_mut() {
        object.remove("signature");
    }
    stripped
}

/// Parses instance public-key material in any of the accepted shapes.
///
/// - PEM with a `PUBLIC KEY` label (SPKI)
/// - Bare base64 or base64url: 32 bytes decode to a raw Ed25519 key,
///   anything else is treated as DER-encoded SPKI
/// - DNS-TXT style `v=...; k=ed25519; p=<base64>` where `p` carries the raw
///   key
///
/// # Errors
///
/// Returns [`SignatureError::Invalid`] on any parse failure (fail closed).
pub fn parse_site_public_key(material: &str) -> Result<VerifyingKey, SignatureError> {
    let trimmed = material.trim();
    if trimmed.is_empty() {
        return Err(SignatureError::Invalid("empty key material".to_string()));
    }

    if trimmed.contains("BEGIN PUBLIC KEY") {
        return VerifyingKey::from_public_key_pem(trimmed)
            .map_err(|e| SignatureError::Invalid(format!("invalid PEM public key: {e}")));
    }

    if let Some(p_value) = extract_txt_key(trimmed)? {
        let bytes = decode_base64_flexible(&p_value)
            .map_err(|e| SignatureError::Invalid(e.to_string()))?;
        return raw_key_from_bytes(&bytes);
    }

    let bytes =
        decode_base64_flexible(trimmed).map_err(|e| SignatureError::Invalid(e.to_string()))?;
    if bytes.len() == PUBLIC_KEY_LENGTH {
        return raw_key_from_bytes(&bytes);
    }
    VerifyingKey::from_public_key_der(&bytes)
        .map_err(|e| SignatureError::Invalid(format!("invalid SPKI public key: {e}")))
}

/// Parses `v=...; k=ed25519; p=<base64>` records. Returns `Ok(None)` when
/// the material is not TXT-shaped.
fn extract_txt_key(material: &str) -> Result<Option<String>, SignatureError> {
    if !material.contains("p=") || !material.contains(';') {
        return Ok(None);
    }

    let mut key_type = None;
    let mut p_value = None;
    for segment in material.split(';') {
        let segment = segment.trim();
        if let Some(value) = segment.strip_prefix("k=") {
            key_type = Some(value.trim().to_ascii_lowercase());
        } else if let Some(value) = segment.strip_prefix("p=") {
            p_value = Some(value.trim().to_string());
        }
    }

    match (key_type, p_value) {
        (Some(k), _) if k != "ed25519" => Err(SignatureError::Invalid(format!(
            "unsupported TXT key type: {k}"
        ))),
        (_, Some(p)) if !p.is_empty() => Ok(Some(p)),
        _ => Err(SignatureError::Invalid(
            "TXT record has no p= value".to_string(),
        )),
    }
}

fn raw_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, SignatureError> {
    let array: [u8; PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| SignatureError::Invalid("raw key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| SignatureError::Invalid(format!("invalid Ed25519 public key: {e}")))
}

/// Verifies a detached base64 signature over a message.
///
/// # Errors
///
/// Returns [`SignatureError::Invalid`] when decoding or verification fails.
pub fn verify_detached(
    key: &VerifyingKey,
    message: &str,
    sig: &str,
) -> Result<(), SignatureError> {
    let sig_bytes = decode_base64_flexible(sig).map_err(|e| SignatureError::Invalid(e.to_string()))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| SignatureError::Invalid(format!("invalid signature bytes: {e}")))?;
    key.verify_strict(message.as_bytes(), &signature)
        .map_err(|e| SignatureError::Invalid(format!("signature mismatch: {e}")))
}

/// Full verification gate for a signed request: shape, freshness, body hash,
/// and Ed25519 verification.
///
/// `payload` is the request body as received, including the `signature`
/// field, which is stripped before hashing.
///
/// # Errors
///
/// Returns the first [`SignatureError`] encountered; callers map the variant
/// onto wire error codes.
pub fn verify_signed_request(
    key_material: &str,
    method: &str,
    path: &str,
    payload: &Value,
    now: DateTime<Utc>,
    window_ms: i64,
) -> Result<(), SignatureError> {
    let block = SignatureBlock::from_payload(payload)?;
    block.check_freshness(now, window_ms)?;

    let key = parse_site_public_key(key_material)?;
    let body = payload_without_signature(payload);
    let body_hash = payload_hash(&body).map_err(|e| SignatureError::Invalid(e.to_string()))?;
    let message = signing_message(method, path, &body_hash, &block.ts, &block.nonce);
    verify_detached(&key, &message, &block.sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_base64_url;
    use chrono::Duration;
    use ed25519_dalek::Signer;
    use ed25519_dalek::SigningKey;
    use ed25519_dalek::pkcs8::EncodePublicKey;
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use serde_json::json;

    fn test_keypair() -> (SigningKey, String) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public_b64 = encode_base64_url(signing.verifying_key().as_bytes());
        (signing, public_b64)
    }

    fn signed_payload(
        signing: &SigningKey,
        method: &str,
        path: &str,
        mut payload: Value,
        ts: &str,
        nonce: &str,
    ) -> Value {
        let body_hash = payload_hash(&payload).expect("hash payload");
        let message = signing_message(method, path, &body_hash, ts, nonce);
        let sig = encode_base64_url(&signing.sign(message.as_bytes()).to_bytes());
        payload["signature"] = json!({
            "alg": "EdDSA",
            "ts": ts,
            "nonce": nonce,
            "sig": sig,
        });
        payload
    }

    #[test]
    fn valid_request_verifies() {
        let (signing, public) = test_keypair();
        let now = Utc::now();
        let payload = signed_payload(
            &signing,
            "post",
            "/v1/instances/sync",
            json!({"siteId": "site-1"}),
            &now.to_rfc3339(),
            "nonce-12345",
        );

        verify_signed_request(
            &public,
            "POST",
            "/v1/instances/sync",
            &payload,
            now,
            DEFAULT_SIGNATURE_WINDOW_MS,
        )
        .expect("verification");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let (signing, public) = test_keypair();
        let now = Utc::now();
        let mut payload = signed_payload(
            &signing,
            "POST",
            "/v1/instances/sync",
            json!({"siteId": "site-1"}),
            &now.to_rfc3339(),
            "nonce-12345",
        );
        payload["siteId"] = json!("site-2");

        let result = verify_signed_request(
            &public,
            "POST",
            "/v1/instances/sync",
            &payload,
            now,
            DEFAULT_SIGNATURE_WINDOW_MS,
        );
        assert!(matches!(result, Err(SignatureError::Invalid(_))));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let (signing, _) = test_keypair();
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let other_public = encode_base64_url(other.verifying_key().as_bytes());
        let now = Utc::now();
        let payload = signed_payload(
            &signing,
            "POST",
            "/v1/instances/sync",
            json!({"siteId": "site-1"}),
            &now.to_rfc3339(),
            "nonce-12345",
        );

        let result = verify_signed_request(
            &other_public,
            "POST",
            "/v1/instances/sync",
            &payload,
            now,
            DEFAULT_SIGNATURE_WINDOW_MS,
        );
        assert!(matches!(result, Err(SignatureError::Invalid(_))));
    }

    #[test]
    fn freshness_boundary_accepts_and_one_ms_beyond_rejects() {
        let (signing, public) = test_keypair();
        let now = Utc::now();
        let window_ms = DEFAULT_SIGNATURE_WINDOW_MS;

        let at_boundary = now - Duration::milliseconds(window_ms);
        let payload = signed_payload(
            &signing,
            "POST",
            "/v1/instances/sync",
            json!({"siteId": "site-1"}),
            &at_boundary.to_rfc3339(),
            "nonce-12345",
        );
        verify_signed_request(&public, "POST", "/v1/instances/sync", &payload, now, window_ms)
            .expect("boundary timestamp must verify");

        let beyond = now - Duration::milliseconds(window_ms + 1);
        let payload = signed_payload(
            &signing,
            "POST",
            "/v1/instances/sync",
            json!({"siteId": "site-1"}),
            &beyond.to_rfc3339(),
            "nonce-12345",
        );
        let result = verify_signed_request(
            &public,
            "POST",
            "/v1/instances/sync",
            &payload,
            now,
            window_ms,
        );
        assert!(matches!(result, Err(SignatureError::Stale)));
    }

    #[test]
    fn missing_signature_is_distinguished() {
        let result = SignatureBlock::from_payload(&json!({"siteId": "site-1"}));
        assert!(matches!(result, Err(SignatureError::Missing)));
    }

    #[test]
    fn short_nonce_is_malformed() {
        let block = SignatureBlock {
            alg: "EdDSA".to_string(),
            ts: Utc::now().to_rfc3339(),
            nonce: "short".to_string(),
            sig: "x".repeat(16),
            kid: None,
        };
        assert!(matches!(
            block.validate_shape(),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn non_eddsa_algorithm_is_malformed() {
        let block = SignatureBlock {
            alg: "RS256".to_string(),
            ts: Utc::now().to_rfc3339(),
            nonce: "nonce-12345".to_string(),
            sig: "x".repeat(16),
            kid: None,
        };
        assert!(matches!(
            block.validate_shape(),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn parses_pem_public_key() {
        let (signing, _) = test_keypair();
        let pem = signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("pem");
        let parsed = parse_site_public_key(&pem).expect("parse PEM");
        assert_eq!(parsed, signing.verifying_key());
    }

    #[test]
    fn parses_spki_der_as_base64() {
        let (signing, _) = test_keypair();
        let der = signing
            .verifying_key()
            .to_public_key_der()
            .expect("der");
        let material = encode_base64_url(der.as_bytes());
        let parsed = parse_site_public_key(&material).expect("parse SPKI");
        assert_eq!(parsed, signing.verifying_key());
    }

    #[test]
    fn parses_dns_txt_record() {
        let (signing, public) = test_keypair();
        let material = format!("v=npk1; k=ed25519; p={public}");
        let parsed = parse_site_public_key(&material).expect("parse TXT");
        assert_eq!(parsed, signing.verifying_key());
    }

    #[test]
    fn rejects_txt_record_with_wrong_key_type() {
        let result = parse_site_public_key("v=npk1; k=rsa; p=abcd");
        assert!(matches!(result, Err(SignatureError::Invalid(_))));
    }

    #[test]
    fn rejects_garbage_key_material() {
        assert!(parse_site_public_key("not a key").is_err());
        assert!(parse_site_public_key("").is_err());
    }

    #[test]
    fn signing_message_uppercases_method() {
        let message = signing_message("post", "/v1/x", "hash", "ts", "nonce");
        assert!(message.starts_with("NP-CLOUD-SIGN-V1\nPOST\n/v1/x\n"));
        assert_eq!(message.lines().count(), 6);
    }
}
