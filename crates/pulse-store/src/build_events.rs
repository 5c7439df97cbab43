//! Build-event ledger: the idempotence record for `sync` calls.

use chrono::{DateTime, Utc};

use pulse_core::InstanceId;

use crate::error::Result;
use crate::store::PulseStore;
use crate::time::fmt_ts;

/// Fallback idempotency key when the caller supplies none.
#[must_use]
pub fn fallback_idempotency_key(site_id: &str, build_id: Option<&str>, built_at: &str) -> String {
    format!("{site_id}:{}:{built_at}", build_id.unwrap_or("no-build-id"))
}

impl PulseStore {
    /// Records one build event per `(instance, idempotency_key)`.
    ///
    /// Duplicates are silently ignored, which makes repeated `sync` calls
    /// with equivalent content no-ops on this table. Returns whether a row
    /// was actually inserted.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn record_build_event(
        &self,
        instance_id: &InstanceId,
        idempotency_key: &str,
        app_version: Option<&str>,
        build_id: Option<&str>,
        commit_sha: Option<&str>,
        built_at: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO build_events (
                instance_id, idempotency_key, app_version, build_id,
                commit_sha, built_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (instance_id, idempotency_key) DO NOTHING",
        )
        .bind(instance_id.to_string())
        .bind(idempotency_key)
        .bind(app_version)
        .bind(build_id)
        .bind(commit_sha)
        .bind(built_at)
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Counts build events for an instance (used by tests and projections).
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn count_build_events(&self, instance_id: &InstanceId) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM build_events WHERE instance_id = ?1")
                .bind(instance_id.to_string())
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// Deletes build events older than the cutoff. Returns rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error when the delete fails.
    pub async fn prune_build_events(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM build_events WHERE created_at < ?1")
            .bind(fmt_ts(before))
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
