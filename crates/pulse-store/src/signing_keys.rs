//! Cloud signing-key rows.
//!
//! Keys flow `active -> grace -> retired`. The active key is the token
//! issuer; grace keys remain in the published JWKS so in-flight tokens stay
//! verifiable; retired keys are kept for audit only.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::error::{Result, StoreError};
use crate::store::PulseStore;
use crate::time::{fmt_ts, parse_ts, parse_ts_opt};

/// Signing-key lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningKeyStatus {
    /// Signs outbound trigger tokens.
    Active,
    /// No longer signs, still published for verification.
    Grace,
    /// Fully withdrawn.
    Retired,
}

impl SigningKeyStatus {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Grace => "grace",
            Self::Retired => "retired",
        }
    }

    /// Parses the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRow`] for unknown values.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(Self::Active),
            "grace" => Ok(Self::Grace),
            "retired" => Ok(Self::Retired),
            other => Err(StoreError::invalid_row(format!(
                "unknown signing key status: {other}"
            ))),
        }
    }
}

/// A persisted cloud signing key.
#[derive(Debug, Clone)]
pub struct CloudSigningKeyRow {
    /// Key identifier.
    pub kid: String,
    /// Lifecycle status.
    pub status: SigningKeyStatus,
    /// Public JWK material, as published.
    pub public_jwk: String,
    /// When the key was first recorded.
    pub created_at: DateTime<Utc>,
    /// Scheduled retirement time, if any.
    pub retire_at: Option<DateTime<Utc>>,
}

fn key_from_row(row: &SqliteRow) -> Result<CloudSigningKeyRow> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(CloudSigningKeyRow {
        kid: row.try_get("kid")?,
        status: SigningKeyStatus::parse(&status)?,
        public_jwk: row.try_get("public_jwk")?,
        created_at: parse_ts(&created_at)?,
        retire_at: parse_ts_opt(row.try_get("retire_at")?)?,
    })
}

impl PulseStore {
    /// Records or refreshes a signing key. The creation time of an existing
    /// row is preserved.
    ///
    /// # Errors
    ///
    /// Returns an error when the upsert fails.
    pub async fn upsert_signing_key(
        &self,
        kid: &str,
        status: SigningKeyStatus,
        public_jwk: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO cloud_signing_keys (kid, status, public_jwk, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (kid) DO UPDATE SET
                status = excluded.status,
                public_jwk = excluded.public_jwk",
        )
        .bind(kid)
        .bind(status.as_str())
        .bind(public_jwk)
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetches one signing key.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is corrupt.
    pub async fn get_signing_key(&self, kid: &str) -> Result<Option<CloudSigningKeyRow>> {
        let row = sqlx::query("SELECT * FROM cloud_signing_keys WHERE kid = ?1")
            .bind(kid)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(key_from_row).transpose()
    }

    /// Lists all signing keys, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is corrupt.
    pub async fn list_signing_keys(&self) -> Result<Vec<CloudSigningKeyRow>> {
        let rows = sqlx::query("SELECT * FROM cloud_signing_keys ORDER BY created_at ASC, kid ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(key_from_row).collect()
    }

    /// Transitions a key's status. Returns whether the key existed.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn set_signing_key_status(
        &self,
        kid: &str,
        status: SigningKeyStatus,
        retire_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE cloud_signing_keys SET status = ?2, retire_at = ?3 WHERE kid = ?1",
        )
        .bind(kid)
        .bind(status.as_str())
        .bind(retire_at.map(fmt_ts))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_preserves_created_at() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let created = Utc::now();
        store
            .upsert_signing_key("cloud-2026a", SigningKeyStatus::Active, "{}", created)
            .await
            .expect("insert");

        let later = created + chrono::Duration::days(30);
        store
            .upsert_signing_key("cloud-2026a", SigningKeyStatus::Grace, "{}", later)
            .await
            .expect("update");

        let row = store
            .get_signing_key("cloud-2026a")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(row.status, SigningKeyStatus::Grace);
        assert_eq!(fmt_ts(row.created_at), fmt_ts(created));
    }

    #[tokio::test]
    async fn rotation_walks_active_grace_retired() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let now = Utc::now();
        store
            .upsert_signing_key("cloud-2025b", SigningKeyStatus::Active, "{}", now)
            .await
            .expect("insert");

        let retire_at = now + chrono::Duration::days(7);
        assert!(store
            .set_signing_key_status("cloud-2025b", SigningKeyStatus::Grace, Some(retire_at))
            .await
            .expect("grace"));
        assert!(store
            .set_signing_key_status("cloud-2025b", SigningKeyStatus::Retired, Some(retire_at))
            .await
            .expect("retire"));

        let row = store
            .get_signing_key("cloud-2025b")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(row.status, SigningKeyStatus::Retired);
        assert!(row.retire_at.is_some());
    }

    #[tokio::test]
    async fn listing_returns_oldest_first() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let now = Utc::now();
        store
            .upsert_signing_key("cloud-2025b", SigningKeyStatus::Grace, "{}", now)
            .await
            .expect("insert");
        store
            .upsert_signing_key(
                "cloud-2026a",
                SigningKeyStatus::Active,
                "{}",
                now + chrono::Duration::days(180),
            )
            .await
            .expect("insert");

        let keys = store.list_signing_keys().await.expect("list");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].kid, "cloud-2025b");
        assert_eq!(keys[1].kid, "cloud-2026a");
    }

    #[tokio::test]
    async fn status_update_for_unknown_kid_reports_absent() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let existed = store
            .set_signing_key_status("missing", SigningKeyStatus::Retired, None)
            .await
            .expect("update");
        assert!(!existed);
    }
}
