//! Instance rows: registered sites, their pinned keys, and their schedule.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use pulse_core::InstanceId;

use crate::error::{Result, StoreError};
use crate::store::PulseStore;
use crate::time::{fmt_ts, parse_ts, parse_ts_opt};

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Registered with a usable URL; eligible for scheduling.
    Active,
    /// Registered but the site URL is missing or unusable.
    PendingUrl,
    /// Deregistered; ignored by the scheduler until a new sync.
    Disabled,
}

impl InstanceStatus {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingUrl => "pending_url",
            Self::Disabled => "disabled",
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
            "pending_url" => Ok(Self::PendingUrl),
            "disabled" => Ok(Self::Disabled),
            other => Err(StoreError::invalid_row(format!(
                "unknown instance status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted instance.
#[derive(Debug, Clone)]
pub struct InstanceRow {
    /// Generated instance identifier.
    pub instance_id: InstanceId,
    /// Caller-chosen site UUID.
    pub site_id: String,
    /// Normalized origin, when usable.
    pub site_url: Option<String>,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Why the instance is not active, when it is not.
    pub pending_reason: Option<String>,
    /// Public key material pinned on first registration.
    pub site_pub_key: String,
    /// Declared key algorithm.
    pub site_key_alg: String,
    /// Daily trigger minute, assigned once.
    pub minute_of_day: u16,
    /// Next scheduled trigger time.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Last successful signed request from this instance.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Last successful delivery to this instance.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Reported application version.
    pub app_version: Option<String>,
    /// Reported build identifier.
    pub build_id: Option<String>,
    /// Reported source commit.
    pub commit_sha: Option<String>,
    /// Reported build timestamp (opaque string from the instance).
    pub built_at: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row mutation time.
    pub updated_at: DateTime<Utc>,
}

impl InstanceRow {
    /// Whether the scheduler may pick this instance up.
    ///
    /// This is the sole eligibility predicate: active, no pending reason,
    /// a usable URL, and a scheduled next run.
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.status == InstanceStatus::Active
            && self.pending_reason.is_none()
            && self.site_url.is_some()
            && self.next_run_at.is_some()
    }
}

/// Fields for a first registration.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Generated instance identifier.
    pub instance_id: InstanceId,
    /// Caller-chosen site UUID.
    pub site_id: String,
    /// Normalized origin, when usable.
    pub site_url: Option<String>,
    /// Initial lifecycle status.
    pub status: InstanceStatus,
    /// Why the instance is not active, when it is not.
    pub pending_reason: Option<String>,
    /// Public key material to pin.
    pub site_pub_key: String,
    /// Declared key algorithm.
    pub site_key_alg: String,
    /// Assigned daily trigger minute.
    pub minute_of_day: u16,
    /// Next scheduled trigger, when active.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Reported application version.
    pub app_version: Option<String>,
    /// Reported build identifier.
    pub build_id: Option<String>,
    /// Reported source commit.
    pub commit_sha: Option<String>,
    /// Reported build timestamp.
    pub built_at: Option<String>,
    /// Registration time.
    pub now: DateTime<Utc>,
}

/// Fields updated on a repeat `sync`. The pinned key and assigned minute
/// are not part of this update.
#[derive(Debug, Clone)]
pub struct InstanceSyncUpdate {
    /// Normalized origin, when usable.
    pub site_url: Option<String>,
    /// New lifecycle status.
    pub status: InstanceStatus,
    /// Why the instance is not active, when it is not.
    pub pending_reason: Option<String>,
    /// Next scheduled trigger, when active.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Reported application version.
    pub app_version: Option<String>,
    /// Reported build identifier.
    pub build_id: Option<String>,
    /// Reported source commit.
    pub commit_sha: Option<String>,
    /// Reported build timestamp.
    pub built_at: Option<String>,
    /// Sync time (becomes `last_seen_at` and `updated_at`).
    pub now: DateTime<Utc>,
}

fn instance_from_row(row: &SqliteRow) -> Result<InstanceRow> {
    let instance_id: String = row.try_get("instance_id")?;
    let instance_id = instance_id
        .parse::<InstanceId>()
        .map_err(|e| StoreError::invalid_row(e.to_string()))?;
    let status: String = row.try_get("status")?;
    let minute_of_day: i64 = row.try_get("minute_of_day")?;
    let minute_of_day = u16::try_from(minute_of_day)
        .map_err(|_| StoreError::invalid_row(format!("minute_of_day out of range: {minute_of_day}")))?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(InstanceRow {
        instance_id,
        site_id: row.try_get("site_id")?,
        site_url: row.try_get("site_url")?,
        status: InstanceStatus::parse(&status)?,
        pending_reason: row.try_get("pending_reason")?,
        site_pub_key: row.try_get("site_pub_key")?,
        site_key_alg: row.try_get("site_key_alg")?,
        minute_of_day,
        next_run_at: parse_ts_opt(row.try_get("next_run_at")?)?,
        last_seen_at: parse_ts_opt(row.try_get("last_seen_at")?)?,
        last_success_at: parse_ts_opt(row.try_get("last_success_at")?)?,
        app_version: row.try_get("app_version")?,
        build_id: row.try_get("build_id")?,
        commit_sha: row.try_get("commit_sha")?,
        built_at: row.try_get("built_at")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

impl PulseStore {
    /// Inserts a first registration.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails (including `site_id`
    /// uniqueness violations).
    pub async fn insert_instance(&self, new: &NewInstance) -> Result<()> {
        sqlx::query(
            "INSERT INTO instances (
                instance_id, site_id, site_url, status, pending_reason,
                site_pub_key, site_key_alg, minute_of_day, next_run_at,
                last_seen_at, app_version, build_id, commit_sha, built_at,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        )
        .bind(new.instance_id.to_string())
        .bind(&new.site_id)
        .bind(&new.site_url)
        .bind(new.status.as_str())
        .bind(&new.pending_reason)
        .bind(&new.site_pub_key)
        .bind(&new.site_key_alg)
        .bind(i64::from(new.minute_of_day))
        .bind(new.next_run_at.map(fmt_ts))
        .bind(fmt_ts(new.now))
        .bind(&new.app_version)
        .bind(&new.build_id)
        .bind(&new.commit_sha)
        .bind(&new.built_at)
        .bind(fmt_ts(new.now))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Looks up an instance by its caller-chosen site UUID.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is corrupt.
    pub async fn find_instance_by_site_id(&self, site_id: &str) -> Result<Option<InstanceRow>> {
        let row = sqlx::query("SELECT * FROM instances WHERE site_id = ?1")
            .bind(site_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    /// Looks up an instance by its generated identifier.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is corrupt.
    pub async fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<InstanceRow>> {
        let row = sqlx::query("SELECT * FROM instances WHERE instance_id = ?1")
            .bind(instance_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    /// Applies a repeat-`sync` update. The pinned key and assigned minute
    /// are never touched here.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn apply_sync_update(
        &self,
        instance_id: &InstanceId,
        update: &InstanceSyncUpdate,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET
                site_url = ?2,
                status = ?3,
                pending_reason = ?4,
                next_run_at = ?5,
                app_version = ?6,
                build_id = ?7,
                commit_sha = ?8,
                built_at = ?9,
                last_seen_at = ?10,
                updated_at = ?10
            WHERE instance_id = ?1",
        )
        .bind(instance_id.to_string())
        .bind(&update.site_url)
        .bind(update.status.as_str())
        .bind(&update.pending_reason)
        .bind(update.next_run_at.map(fmt_ts))
        .bind(&update.app_version)
        .bind(&update.build_id)
        .bind(&update.commit_sha)
        .bind(&update.built_at)
        .bind(fmt_ts(update.now))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Disables an instance: terminal until the next successful sync.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn disable_instance(
        &self,
        instance_id: &InstanceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET
                status = 'disabled',
                pending_reason = ?2,
                next_run_at = NULL,
                updated_at = ?3
            WHERE instance_id = ?1",
        )
        .bind(instance_id.to_string())
        .bind(reason)
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Reads due instances for a scheduler tick, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is corrupt.
    pub async fn due_instances(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<InstanceRow>> {
        let rows = sqlx::query(
            "SELECT * FROM instances
            WHERE status = 'active'
              AND pending_reason IS NULL
              AND site_url IS NOT NULL
              AND next_run_at IS NOT NULL
              AND next_run_at <= ?1
            ORDER BY next_run_at ASC
            LIMIT ?2",
        )
        .bind(fmt_ts(now))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    /// Advances an instance's `next_run_at` after enqueueing its delivery.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn advance_next_run(
        &self,
        instance_id: &InstanceId,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET next_run_at = ?2, updated_at = ?3 WHERE instance_id = ?1",
        )
        .bind(instance_id.to_string())
        .bind(fmt_ts(next_run_at))
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Records a successful delivery on the instance.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn record_instance_success(
        &self,
        instance_id: &InstanceId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET last_success_at = ?2, updated_at = ?2 WHERE instance_id = ?1",
        )
        .bind(instance_id.to_string())
        .bind(fmt_ts(at))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_instance(site_id: &str, now: DateTime<Utc>) -> NewInstance {
        NewInstance {
            instance_id: InstanceId::generate(),
            site_id: site_id.to_string(),
            site_url: Some("https://site.test".to_string()),
            status: InstanceStatus::Active,
            pending_reason: None,
            site_pub_key: "raw-key-material".to_string(),
            site_key_alg: "ed25519".to_string(),
            minute_of_day: 540,
            next_run_at: Some(now + chrono::Duration::hours(1)),
            app_version: Some("1.4.2".to_string()),
            build_id: Some("b-100".to_string()),
            commit_sha: Some("abc123".to_string()),
            built_at: Some("2026-07-30T12:00:00Z".to_string()),
            now,
        }
    }

    #[tokio::test]
    async fn insert_and_find_round_trip() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 8, 0, 0).unwrap();
        let new = sample_instance("4f8a1c2e-0000-4000-8000-000000000001", now);
        store.insert_instance(&new).await.expect("insert");

        let found = store
            .find_instance_by_site_id(&new.site_id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(found.instance_id, new.instance_id);
        assert_eq!(found.status, InstanceStatus::Active);
        assert_eq!(found.minute_of_day, 540);
        assert!(found.is_schedulable());

        let by_id = store
            .get_instance(&new.instance_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(by_id.site_id, new.site_id);
    }

    #[tokio::test]
    async fn duplicate_site_id_is_rejected() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let now = Utc::now();
        let new = sample_instance("4f8a1c2e-0000-4000-8000-000000000002", now);
        store.insert_instance(&new).await.expect("insert");

        let dup = sample_instance(&new.site_id, now);
        assert!(store.insert_instance(&dup).await.is_err());
    }

    #[tokio::test]
    async fn sync_update_preserves_key_and_minute() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 8, 0, 0).unwrap();
        let new = sample_instance("4f8a1c2e-0000-4000-8000-000000000003", now);
        store.insert_instance(&new).await.expect("insert");

        let later = now + chrono::Duration::days(1);
        store
            .apply_sync_update(
                &new.instance_id,
                &InstanceSyncUpdate {
                    site_url: Some("https://other.test".to_string()),
                    status: InstanceStatus::Active,
                    pending_reason: None,
                    next_run_at: Some(later + chrono::Duration::hours(2)),
                    app_version: Some("1.5.0".to_string()),
                    build_id: Some("b-101".to_string()),
                    commit_sha: Some("def456".to_string()),
                    built_at: Some("2026-08-01T00:00:00Z".to_string()),
                    now: later,
                },
            )
            .await
            .expect("update");

        let updated = store
            .get_instance(&new.instance_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(updated.site_pub_key, "raw-key-material");
        assert_eq!(updated.minute_of_day, 540);
        assert_eq!(updated.site_url.as_deref(), Some("https://other.test"));
        assert_eq!(updated.app_version.as_deref(), Some("1.5.0"));
        assert_eq!(updated.last_seen_at, Some(later));
    }

    #[tokio::test]
    async fn due_scan_honors_eligibility_predicate() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();

        let mut due = sample_instance("4f8a1c2e-0000-4000-8000-000000000004", now);
        due.next_run_at = Some(now - chrono::Duration::minutes(1));
        store.insert_instance(&due).await.expect("insert");

        let mut pending = sample_instance("4f8a1c2e-0000-4000-8000-000000000005", now);
        pending.status = InstanceStatus::PendingUrl;
        pending.pending_reason = Some("pending_url_missing".to_string());
        pending.site_url = None;
        pending.next_run_at = Some(now - chrono::Duration::minutes(1));
        store.insert_instance(&pending).await.expect("insert");

        let mut future = sample_instance("4f8a1c2e-0000-4000-8000-000000000006", now);
        future.next_run_at = Some(now + chrono::Duration::hours(3));
        store.insert_instance(&future).await.expect("insert");

        let rows = store.due_instances(now, 10).await.expect("scan");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instance_id, due.instance_id);
    }

    #[tokio::test]
    async fn disable_clears_next_run() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let now = Utc::now();
        let new = sample_instance("4f8a1c2e-0000-4000-8000-000000000007", now);
        store.insert_instance(&new).await.expect("insert");

        store
            .disable_instance(&new.instance_id, "deregistered", now)
            .await
            .expect("disable");

        let row = store
            .get_instance(&new.instance_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(row.status, InstanceStatus::Disabled);
        assert_eq!(row.pending_reason.as_deref(), Some("deregistered"));
        assert!(row.next_run_at.is_none());
        assert!(!row.is_schedulable());
    }
}
