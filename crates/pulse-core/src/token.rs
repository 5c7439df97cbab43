//! Trigger-token minting and the cloud private-key ring.
//!
//! Every dispatch mints a short-lived EdDSA JWT that the instance validates
//! against the published JWKS before accepting the trigger call. The signing
//! key is selected by `kid` from a ring of Ed25519 private JWKs loaded from
//! configuration; derived encoding keys are cached per `kid` for the worker
//! lifetime.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::encoding::{decode_base64_flexible, encode_base64_url};
use crate::error::{Error, Result};

/// Default JWT issuer (`iss`).
pub const CLOUD_ISSUER_DEFAULT: &str = "np-cloud";

/// Default JWT audience (`aud`) expected by instances.
pub const INSTANCE_TRIGGER_AUDIENCE_DEFAULT: &str = "np-instance";

/// Trigger-token lifetime in seconds.
pub const TRIGGER_TOKEN_TTL_SECONDS: i64 = 60;

/// Clock-skew allowance applied to `nbf`.
pub const TRIGGER_TOKEN_NBF_SKEW_SECONDS: i64 = 5;

/// Canonical trigger-token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerTokenClaims {
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Subject: the instance's `siteId`.
    pub sub: String,
    /// Fresh token identifier.
    pub jti: String,
    /// Issued-at (unix timestamp seconds).
    pub iat: usize,
    /// Not-before (unix timestamp seconds).
    pub nbf: usize,
    /// Expiry (unix timestamp seconds).
    pub exp: usize,
    /// Delivery this token authorizes.
    pub delivery_id: String,
    /// Site identifier, duplicated for instance-side convenience.
    pub site_id: String,
}

/// Result of minting a trigger token.
#[derive(Debug, Clone)]
pub struct MintedTriggerToken {
    /// Signed JWT.
    pub token: String,
    /// Token expiry timestamp.
    pub expires_at: DateTime<Utc>,
    /// Key id that signed the token.
    pub kid: String,
}

/// A private Ed25519 key in JWK form.
#[derive(Debug, Clone, Deserialize)]
struct PrivateJwk {
    kty: String,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    kid: Option<String>,
    d: String,
    #[serde(default)]
    x: Option<String>,
}

/// Ring of cloud signing keys with a designated active `kid`.
///
/// Accepts either a map `kid -> JWK` or a `{keys: [JWK...]}` set. The active
/// key signs outbound tokens; the others stay resolvable so tokens minted
/// before a rotation can still be traced to their key.
pub struct PrivateKeyRing {
    keys: Vec<(String, PrivateJwk)>,
    active_kid: String,
    cache: RwLock<HashMap<String, Arc<EncodingKey>>>,
}

impl std::fmt::Debug for PrivateKeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyRing")
            .field("kids", &self.kids())
            .field("active_kid", &self.active_kid)
            .finish_non_exhaustive()
    }
}

impl PrivateKeyRing {
    /// Loads the ring from the `CLOUD_PRIVATE_KEYS_JSON` document.
    ///
    /// `active_kid` overrides the default choice (the first listed key).
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON is malformed, a key is not an Ed25519
    /// OKP private key, or the requested active `kid` is absent.
    pub fn from_json(json: &str, active_kid: Option<&str>) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("invalid private keys JSON: {e}")))?;

        let mut keys = Vec::new();
        if let Some(list) = value.get("keys").and_then(Value::as_array) {
            for entry in list {
                let jwk: PrivateJwk = serde_json::from_value(entry.clone())
                    .map_err(|e| Error::InvalidInput(format!("invalid private JWK: {e}")))?;
                let kid = jwk
                    .kid
                    .clone()
                    .ok_or_else(|| Error::InvalidInput("private JWK has no kid".to_string()))?;
                keys.push((kid, jwk));
            }
        } else if let Some(map) = value.as_object() {
            for (kid, entry) in map {
                let jwk: PrivateJwk = serde_json::from_value(entry.clone()).map_err(|e| {
                    Error::InvalidInput(format!("invalid private JWK for kid {kid}: {e}"))
                })?;
                keys.push((kid.clone(), jwk));
            }
        } else {
            return Err(Error::InvalidInput(
                "private keys JSON must be a kid map or a JWK set".to_string(),
            ));
        }

        if keys.is_empty() {
            return Err(Error::InvalidInput(
                "private key ring must contain at least one key".to_string(),
            ));
        }

        for (kid, jwk) in &keys {
            if jwk.kty != "OKP" || jwk.crv.as_deref() != Some("Ed25519") {
                return Err(Error::InvalidInput(format!(
                    "key {kid} must be an OKP/Ed25519 private JWK"
                )));
            }
            if jwk.d.trim().is_empty() {
                return Err(Error::InvalidInput(format!("key {kid} has no d value")));
            }
        }

        let active_kid = match active_kid {
            Some(requested) => {
                if !keys.iter().any(|(kid, _)| kid == requested) {
                    return Err(Error::InvalidInput(format!(
                        "active kid {requested} not present in private key ring"
                    )));
                }
                requested.to_string()
            }
            None => keys[0].0.clone(),
        };

        Ok(Self {
            keys,
            active_kid,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the active signing `kid`.
    #[must_use]
    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }

    /// Returns all known `kid`s in ring order.
    #[must_use]
    pub fn kids(&self) -> Vec<String> {
        self.keys.iter().map(|(kid, _)| kid.clone()).collect()
    }

    /// Resolves the encoding key for a `kid`, deriving and caching on first
    /// use.
    fn encoding_key(&self, kid: &str) -> Result<Arc<EncodingKey>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(key) = cache.get(kid) {
                return Ok(Arc::clone(key));
            }
        }

        let jwk = self
            .keys
            .iter()
            .find(|(candidate, _)| candidate == kid)
            .map(|(_, jwk)| jwk)
            .ok_or_else(|| Error::crypto(format!("unknown signing kid: {kid}")))?;

        let seed = decode_base64_flexible(&jwk.d)
            .map_err(|e| Error::crypto(format!("invalid d for kid {kid}: {e}")))?;
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| Error::crypto(format!("d for kid {kid} must be 32 bytes")))?;
        let signing = SigningKey::from_bytes(&seed);

        if let Some(x) = jwk.x.as_deref() {
            let derived = encode_base64_url(signing.verifying_key().as_bytes());
            if derived != x.trim() {
                return Err(Error::crypto(format!(
                    "public key x for kid {kid} does not match its private d"
                )));
            }
        }

        let pkcs8 = signing
            .to_pkcs8_der()
            .map_err(|e| Error::crypto(format!("pkcs8 export failed for kid {kid}: {e}")))?;
        let key = Arc::new(EncodingKey::from_ed_der(pkcs8.as_bytes()));

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(kid.to_string(), Arc::clone(&key));
        }
        Ok(key)
    }

    /// Mints a trigger token for one delivery, signed by the active key.
    ///
    /// # Errors
    ///
    /// Returns an error when the active key cannot be resolved or signing
    /// fails.
    pub fn mint_trigger_token(
        &self,
        issuer: &str,
        audience: &str,
        site_id: &str,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MintedTriggerToken> {
        let expires_at = now + Duration::seconds(TRIGGER_TOKEN_TTL_SECONDS);
        let not_before = now - Duration::seconds(TRIGGER_TOKEN_NBF_SKEW_SECONDS);

        let claims = TriggerTokenClaims {
            iss: issuer.to_string(),
            aud: audience.to_string(),
            sub: site_id.to_string(),
            jti: Ulid::new().to_string(),
            iat: timestamp_to_usize(now.timestamp(), "iat")?,
            nbf: timestamp_to_usize(not_before.timestamp(), "nbf")?,
            exp: timestamp_to_usize(expires_at.timestamp(), "exp")?,
            delivery_id: delivery_id.to_string(),
            site_id: site_id.to_string(),
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.active_kid.clone());

        let key = self.encoding_key(&self.active_kid)?;
        let token = jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| Error::crypto(format!("trigger token signing failed: {e}")))?;

        Ok(MintedTriggerToken {
            token,
            expires_at,
            kid: self.active_kid.clone(),
        })
    }
}

fn timestamp_to_usize(value: i64, field: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::InvalidInput(format!("{field} timestamp out of range")))
}
