//! Telemetry samples and hourly roll-ups.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use pulse_core::{DeliveryId, InstanceId};

use crate::error::{Result, StoreError};
use crate::store::PulseStore;
use crate::time::{fmt_ts, parse_ts};

/// Flat telemetry projection persisted per successful delivery.
#[derive(Debug, Clone)]
pub struct NewTelemetrySample {
    /// Delivery the sample belongs to (unique; re-delivery is a no-op).
    pub delivery_id: DeliveryId,
    /// Instance that produced the sample.
    pub instance_id: InstanceId,
    /// When the sample was ingested.
    pub collected_at: DateTime<Utc>,
    /// Telemetry schema version reported or defaulted.
    pub schema_ver: i64,
    /// Whether the instance accepted the trigger.
    pub accepted: bool,
    /// Whether the instance reported a dedup hit.
    pub dedup_hit: bool,
    /// Protocol verification time in milliseconds.
    pub verify_ms: Option<i64>,
    /// Items checked by the instance run.
    pub items_checked: Option<i64>,
    /// Items that failed verification.
    pub items_failed: Option<i64>,
    /// Total instance-side run time in milliseconds.
    pub total_ms: Option<i64>,
    /// Application version reported in the response.
    pub app_version: Option<String>,
    /// Instance-side error code, if any.
    pub error_code: Option<String>,
    /// Raw response body, truncated on a UTF-8 boundary.
    pub raw_json: Option<String>,
}

/// A persisted telemetry sample.
#[derive(Debug, Clone)]
pub struct TelemetrySampleRow {
    /// Delivery the sample belongs to.
    pub delivery_id: DeliveryId,
    /// Instance that produced the sample.
    pub instance_id: InstanceId,
    /// When the sample was ingested.
    pub collected_at: DateTime<Utc>,
    /// Telemetry schema version.
    pub schema_ver: i64,
    /// Whether the instance accepted the trigger.
    pub accepted: bool,
    /// Whether the instance reported a dedup hit.
    pub dedup_hit: bool,
    /// Protocol verification time in milliseconds.
    pub verify_ms: Option<i64>,
    /// Items checked by the instance run.
    pub items_checked: Option<i64>,
    /// Items that failed verification.
    pub items_failed: Option<i64>,
    /// Total instance-side run time in milliseconds.
    pub total_ms: Option<i64>,
    /// Application version reported in the response.
    pub app_version: Option<String>,
    /// Instance-side error code, if any.
    pub error_code: Option<String>,
    /// Raw response body.
    pub raw_json: Option<String>,
}

/// An hourly roll-up row.
#[derive(Debug, Clone)]
pub struct TelemetryHourlyRow {
    /// Instance the bucket belongs to.
    pub instance_id: InstanceId,
    /// Bucket hour (UTC, floored).
    pub bucket_hour: DateTime<Utc>,
    /// Samples in the bucket.
    pub sample_count: i64,
    /// Accepted deliveries in the bucket.
    pub accepted_count: i64,
    /// Dedup hits in the bucket.
    pub dedup_count: i64,
    /// Mean verification time.
    pub avg_verify_ms: Option<i64>,
    /// Maximum verification time.
    pub max_verify_ms: Option<i64>,
    /// Total items checked.
    pub sum_items_checked: Option<i64>,
    /// Total items failed.
    pub sum_items_failed: Option<i64>,
}

fn sample_from_row(row: &SqliteRow) -> Result<TelemetrySampleRow> {
    let delivery_id: String = row.try_get("delivery_id")?;
    let instance_id: String = row.try_get("instance_id")?;
    let collected_at: String = row.try_get("collected_at")?;
    let accepted: i64 = row.try_get("accepted")?;
    let dedup_hit: i64 = row.try_get("dedup_hit")?;

    Ok(TelemetrySampleRow {
        delivery_id: delivery_id
            .parse::<DeliveryId>()
            .map_err(|e| StoreError::invalid_row(e.to_string()))?,
        instance_id: instance_id
            .parse::<InstanceId>()
            .map_err(|e| StoreError::invalid_row(e.to_string()))?,
        collected_at: parse_ts(&collected_at)?,
        schema_ver: row.try_get("schema_ver")?,
        accepted: accepted != 0,
        dedup_hit: dedup_hit != 0,
        verify_ms: row.try_get("verify_ms")?,
        items_checked: row.try_get("items_checked")?,
        items_failed: row.try_get("items_failed")?,
        total_ms: row.try_get("total_ms")?,
        app_version: row.try_get("app_version")?,
        error_code: row.try_get("error_code")?,
        raw_json: row.try_get("raw_json")?,
    })
}

fn hourly_from_row(row: &SqliteRow) -> Result<TelemetryHourlyRow> {
    let instance_id: String = row.try_get("instance_id")?;
    let bucket_hour: String = row.try_get("bucket_hour")?;

    Ok(TelemetryHourlyRow {
        instance_id: instance_id
            .parse::<InstanceId>()
            .map_err(|e| StoreError::invalid_row(e.to_string()))?,
        bucket_hour: parse_ts(&bucket_hour)?,
        sample_count: row.try_get("sample_count")?,
        accepted_count: row.try_get("accepted_count")?,
        dedup_count: row.try_get("dedup_count")?,
        avg_verify_ms: row.try_get("avg_verify_ms")?,
        max_verify_ms: row.try_get("max_verify_ms")?,
        sum_items_checked: row.try_get("sum_items_checked")?,
        sum_items_failed: row.try_get("sum_items_failed")?,
    })
}

impl PulseStore {
    /// Inserts one telemetry sample. The delivery id is the dedup key, so
    /// re-delivery of a repeated payload is a no-op. Returns whether a row
    /// was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn insert_telemetry_sample(&self, sample: &NewTelemetrySample) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO telemetry_samples (
                delivery_id, instance_id, collected_at, schema_ver, accepted,
                dedup_hit, verify_ms, items_checked, items_failed, total_ms,
                app_version, error_code, raw_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (delivery_id) DO NOTHING",
        )
        .bind(sample.delivery_id.to_string())
        .bind(sample.instance_id.to_string())
        .bind(fmt_ts(sample.collected_at))
        .bind(sample.schema_ver)
        .bind(i64::from(sample.accepted))
        .bind(i64::from(sample.dedup_hit))
        .bind(sample.verify_ms)
        .bind(sample.items_checked)
        .bind(sample.items_failed)
        .bind(sample.total_ms)
        .bind(&sample.app_version)
        .bind(&sample.error_code)
        .bind(&sample.raw_json)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetches one telemetry sample.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is corrupt.
    pub async fn get_telemetry_sample(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<TelemetrySampleRow>> {
        let row = sqlx::query("SELECT * FROM telemetry_samples WHERE delivery_id = ?1")
            .bind(delivery_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(sample_from_row).transpose()
    }

    /// Deletes raw samples older than the cutoff. Returns rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error when the delete fails.
    pub async fn prune_telemetry_samples(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM telemetry_samples WHERE collected_at < ?1")
            .bind(fmt_ts(before))
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes hourly roll-ups older than the cutoff. Returns rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error when the delete fails.
    pub async fn prune_telemetry_hourly(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM telemetry_hourly WHERE bucket_hour < ?1")
            .bind(fmt_ts(before))
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Rebuilds hourly roll-ups from raw samples collected since the cutoff.
    ///
    /// One group-by-hour upsert; existing buckets in the window are
    /// recomputed wholesale. The bucket key is derived from the fixed-width
    /// stored timestamp, so `substr(collected_at, 1, 13)` is the UTC hour.
    ///
    /// # Errors
    ///
    /// Returns an error when the statement fails.
    pub async fn rebuild_telemetry_hourly(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "INSERT INTO telemetry_hourly (
                instance_id, bucket_hour, sample_count, accepted_count,
                dedup_count, avg_verify_ms, max_verify_ms, sum_items_checked,
                sum_items_failed, updated_at
            )
            SELECT
                instance_id,
                substr(collected_at, 1, 13) || ':00:00.000Z' AS bucket_hour,
                COUNT(*),
                SUM(accepted),
                SUM(dedup_hit),
                CAST(AVG(verify_ms) AS INTEGER),
                MAX(verify_ms),
                SUM(items_checked),
                SUM(items_failed),
                ?2
            FROM telemetry_samples
            WHERE collected_at >= ?1
            GROUP BY instance_id, bucket_hour
            ON CONFLICT (instance_id, bucket_hour) DO UPDATE SET
                sample_count = excluded.sample_count,
                accepted_count = excluded.accepted_count,
                dedup_count = excluded.dedup_count,
                avg_verify_ms = excluded.avg_verify_ms,
                max_verify_ms = excluded.max_verify_ms,
                sum_items_checked = excluded.sum_items_checked,
                sum_items_failed = excluded.sum_items_failed,
                updated_at = excluded.updated_at",
        )
        .bind(fmt_ts(since))
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Lists hourly roll-ups for an instance, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is corrupt.
    pub async fn telemetry_hourly(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<TelemetryHourlyRow>> {
        let rows = sqlx::query(
            "SELECT * FROM telemetry_hourly WHERE instance_id = ?1 ORDER BY bucket_hour ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(hourly_from_row).collect()
    }
}
