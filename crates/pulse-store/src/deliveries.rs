//! Delivery rows and the append-only attempt log.
//!
//! A delivery is one attempt-series of invoking a single instance at a
//! scheduled time. Transitions are monotone:
//!
//! - `queued -> delivered` (terminal, sets `completed_at`)
//! - `queued -> failed` (retryable, no `completed_at`)
//! - any -> `dead` (terminal, sets `completed_at`)
//!
//! `attempt_count` always reflects the highest attempt observed.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use pulse_core::{DeliveryId, InstanceId};

use crate::error::{Result, StoreError};
use crate::store::PulseStore;
use crate::time::{fmt_ts, parse_ts, parse_ts_opt};

/// Maximum stored length of an error message, in characters.
pub const ERROR_MESSAGE_MAX_CHARS: usize = 500;

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Enqueued, awaiting dispatch.
    Queued,
    /// Instance accepted the trigger (terminal).
    Delivered,
    /// Last attempt failed; a retry may follow.
    Failed,
    /// Buried; no further attempts (terminal).
    Dead,
}

impl DeliveryStatus {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Parses the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRow`] for unknown values.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(Self::Queued),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(StoreError::invalid_row(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// A persisted delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRow {
    /// Delivery identifier.
    pub id: DeliveryId,
    /// Target instance.
    pub instance_id: InstanceId,
    /// The minute the delivery was scheduled into.
    pub scheduled_for: DateTime<Utc>,
    /// When the dispatch message was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: DeliveryStatus,
    /// Highest attempt number observed.
    pub attempt_count: u32,
    /// HTTP status of the recorded response, if any.
    pub response_status: Option<u16>,
    /// Whether the instance accepted the trigger (three-valued).
    pub accepted: Option<bool>,
    /// Whether the instance reported a dedup hit (three-valued).
    pub dedup_hit: Option<bool>,
    /// Error code of the most recent failure.
    pub last_error_code: Option<String>,
    /// Error message of the most recent failure.
    pub last_error_message: Option<String>,
    /// Terminal transition time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// One wire attempt within a delivery. Append-only.
#[derive(Debug, Clone)]
pub struct NewDeliveryAttempt {
    /// Delivery the attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Attempt number (1-indexed).
    pub attempt_no: u32,
    /// When the wire call started.
    pub started_at: DateTime<Utc>,
    /// When the wire call finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// HTTP status, when a response arrived.
    pub http_status: Option<u16>,
    /// Whether the call hit the request timeout.
    pub timed_out: bool,
    /// Error code, when the attempt failed.
    pub error_code: Option<String>,
    /// Error message, when the attempt failed.
    pub error_message: Option<String>,
}

/// A persisted delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryAttemptRow {
    /// Delivery the attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Attempt number (1-indexed).
    pub attempt_no: u32,
    /// When the wire call started.
    pub started_at: DateTime<Utc>,
    /// When the wire call finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// HTTP status, when a response arrived.
    pub http_status: Option<u16>,
    /// Whether the call hit the request timeout.
    pub timed_out: bool,
    /// Error code, when the attempt failed.
    pub error_code: Option<String>,
    /// Error message, when the attempt failed.
    pub error_message: Option<String>,
}

/// Truncates an error message to the stored limit on a character boundary.
#[must_use]
pub fn truncate_error_message(message: &str) -> String {
    message.chars().take(ERROR_MESSAGE_MAX_CHARS).collect()
}

fn delivery_from_row(row: &SqliteRow) -> Result<DeliveryRow> {
    let id: String = row.try_get("id")?;
    let instance_id: String = row.try_get("instance_id")?;
    let status: String = row.try_get("status")?;
    let scheduled_for: String = row.try_get("scheduled_for")?;
    let enqueued_at: String = row.try_get("enqueued_at")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let response_status: Option<i64> = row.try_get("response_status")?;
    let accepted: Option<i64> = row.try_get("accepted")?;
    let dedup_hit: Option<i64> = row.try_get("dedup_hit")?;

    Ok(DeliveryRow {
        id: id
            .parse::<DeliveryId>()
            .map_err(|e| StoreError::invalid_row(e.to_string()))?,
        instance_id: instance_id
            .parse::<InstanceId>()
            .map_err(|e| StoreError::invalid_row(e.to_string()))?,
        scheduled_for: parse_ts(&scheduled_for)?,
        enqueued_at: parse_ts(&enqueued_at)?,
        status: DeliveryStatus::parse(&status)?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| StoreError::invalid_row("negative attempt_count"))?,
        response_status: response_status
            .map(|s| {
                u16::try_from(s).map_err(|_| StoreError::invalid_row("response_status out of range"))
            })
            .transpose()?,
        accepted: accepted.map(|v| v != 0),
        dedup_hit: dedup_hit.map(|v| v != 0),
        last_error_code: row.try_get("last_error_code")?,
        last_error_message: row.try_get("last_error_message")?,
        completed_at: parse_ts_opt(row.try_get("completed_at")?)?,
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<DeliveryAttemptRow> {
    let delivery_id: String = row.try_get("delivery_id")?;
    let attempt_no: i64 = row.try_get("attempt_no")?;
    let started_at: String = row.try_get("started_at")?;
    let http_status: Option<i64> = row.try_get("http_status")?;
    let timed_out: i64 = row.try_get("timed_out")?;

    Ok(DeliveryAttemptRow {
        delivery_id: delivery_id
            .parse::<DeliveryId>()
            .map_err(|e| StoreError::invalid_row(e.to_string()))?,
        attempt_no: u32::try_from(attempt_no)
            .map_err(|_| StoreError::invalid_row("negative attempt_no"))?,
        started_at: parse_ts(&started_at)?,
        finished_at: parse_ts_opt(row.try_get("finished_at")?)?,
        duration_ms: row.try_get("duration_ms")?,
        http_status: http_status
            .map(|s| {
                u16::try_from(s).map_err(|_| StoreError::invalid_row("http_status out of range"))
            })
            .transpose()?,
        timed_out: timed_out != 0,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
    })
}

impl PulseStore {
    /// Creates a `queued` delivery at enqueue time.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn create_delivery(
        &self,
        id: &DeliveryId,
        instance_id: &InstanceId,
        scheduled_for: DateTime<Utc>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO deliveries (id, instance_id, scheduled_for, enqueued_at, status)
            VALUES (?1, ?2, ?3, ?4, 'queued')",
        )
        .bind(id.to_string())
        .bind(instance_id.to_string())
        .bind(fmt_ts(scheduled_for))
        .bind(fmt_ts(enqueued_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetches one delivery.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is corrupt.
    pub async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<DeliveryRow>> {
        let row = sqlx::query("SELECT * FROM deliveries WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    /// Appends one attempt row. Broker redelivery of the same attempt is a
    /// no-op; attempt rows are never mutated.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn record_delivery_attempt(&self, attempt: &NewDeliveryAttempt) -> Result<()> {
        sqlx::query(
            "INSERT INTO delivery_attempts (
                delivery_id, attempt_no, started_at, finished_at, duration_ms,
                http_status, timed_out, error_code, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (delivery_id, attempt_no) DO NOTHING",
        )
        .bind(attempt.delivery_id.to_string())
        .bind(i64::from(attempt.attempt_no))
        .bind(fmt_ts(attempt.started_at))
        .bind(attempt.finished_at.map(fmt_ts))
        .bind(attempt.duration_ms)
        .bind(attempt.http_status.map(i64::from))
        .bind(i64::from(attempt.timed_out))
        .bind(&attempt.error_code)
        .bind(attempt.error_message.as_deref().map(truncate_error_message))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Lists all attempts of a delivery, in order.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is corrupt.
    pub async fn delivery_attempts(&self, id: &DeliveryId) -> Result<Vec<DeliveryAttemptRow>> {
        let rows = sqlx::query(
            "SELECT * FROM delivery_attempts WHERE delivery_id = ?1 ORDER BY attempt_no ASC",
        )
        .bind(id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    /// Marks a delivery delivered (terminal).
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn mark_delivery_delivered(
        &self,
        id: &DeliveryId,
        attempt_no: u32,
        response_status: u16,
        accepted: bool,
        dedup_hit: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deliveries SET
                status = 'delivered',
                attempt_count = MAX(attempt_count, ?2),
                response_status = ?3,
                accepted = ?4,
                dedup_hit = ?5,
                last_error_code = NULL,
                last_error_message = NULL,
                completed_at = ?6
            WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(i64::from(attempt_no))
        .bind(i64::from(response_status))
        .bind(i64::from(accepted))
        .bind(i64::from(dedup_hit))
        .bind(fmt_ts(completed_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Marks a delivery failed (retryable; no `completed_at`).
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn mark_delivery_failed(
        &self,
        id: &DeliveryId,
        attempt_no: u32,
        error_code: &str,
        error_message: &str,
        response_status: Option<u16>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deliveries SET
                status = 'failed',
                attempt_count = MAX(attempt_count, ?2),
                response_status = COALESCE(?3, response_status),
                last_error_code = ?4,
                last_error_message = ?5
            WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(i64::from(attempt_no))
        .bind(response_status.map(i64::from))
        .bind(error_code)
        .bind(truncate_error_message(error_message))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Marks a delivery dead (terminal).
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn mark_delivery_dead(
        &self,
        id: &DeliveryId,
        error_code: &str,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deliveries SET
                status = 'dead',
                last_error_code = ?2,
                last_error_message = ?3,
                completed_at = ?4
            WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(error_code)
        .bind(truncate_error_message(error_message))
        .bind(fmt_ts(completed_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_delivery(store: &PulseStore) -> (DeliveryId, InstanceId, DateTime<Utc>) {
        let id = DeliveryId::generate();
        let instance_id = InstanceId::generate();
        let now = Utc::now();
        store
            .create_delivery(&id, &instance_id, now, now)
            .await
            .expect("create");
        (id, instance_id, now)
    }

    #[tokio::test]
    async fn queued_to_delivered_sets_completed_at_and_accepted() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let (id, _, now) = seeded_delivery(&store).await;

        store
            .mark_delivery_delivered(&id, 1, 200, true, false, now)
            .await
            .expect("delivered");

        let row = store.get_delivery(&id).await.expect("get").expect("exists");
        assert_eq!(row.status, DeliveryStatus::Delivered);
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.response_status, Some(200));
        assert_eq!(row.accepted, Some(true));
        assert_eq!(row.dedup_hit, Some(false));
        assert!(row.completed_at.is_some());
        assert!(row.last_error_code.is_none());
    }

    #[tokio::test]
    async fn failed_keeps_delivery_open_and_records_error() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let (id, _, _) = seeded_delivery(&store).await;

        store
            .mark_delivery_failed(&id, 2, "REQUEST_TIMEOUT", "request timed out", None)
            .await
            .expect("failed");

        let row = store.get_delivery(&id).await.expect("get").expect("exists");
        assert_eq!(row.status, DeliveryStatus::Failed);
        assert_eq!(row.attempt_count, 2);
        assert_eq!(row.last_error_code.as_deref(), Some("REQUEST_TIMEOUT"));
        assert!(row.completed_at.is_none());
    }

    #[tokio::test]
    async fn attempt_count_never_regresses() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let (id, _, _) = seeded_delivery(&store).await;

        store
            .mark_delivery_failed(&id, 3, "REQUEST_FAILED", "boom", None)
            .await
            .expect("failed");
        store
            .mark_delivery_failed(&id, 1, "REQUEST_FAILED", "late redelivery", None)
            .await
            .expect("failed");

        let row = store.get_delivery(&id).await.expect("get").expect("exists");
        assert_eq!(row.attempt_count, 3);
    }

    #[tokio::test]
    async fn dead_is_terminal_with_completed_at() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let (id, _, now) = seeded_delivery(&store).await;

        store
            .mark_delivery_dead(&id, "MAX_ATTEMPTS_EXCEEDED", "retry budget exhausted", now)
            .await
            .expect("dead");

        let row = store.get_delivery(&id).await.expect("get").expect("exists");
        assert_eq!(row.status, DeliveryStatus::Dead);
        assert_eq!(
            row.last_error_code.as_deref(),
            Some("MAX_ATTEMPTS_EXCEEDED")
        );
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn attempts_are_append_only_and_dedup_by_attempt_no() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let (id, _, now) = seeded_delivery(&store).await;

        let attempt = NewDeliveryAttempt {
            delivery_id: id,
            attempt_no: 1,
            started_at: now,
            finished_at: Some(now),
            duration_ms: Some(120),
            http_status: Some(503),
            timed_out: false,
            error_code: Some("UNACCEPTED_RESPONSE".to_string()),
            error_message: Some("HTTP 503, accepted=false".to_string()),
        };
        store.record_delivery_attempt(&attempt).await.expect("record");
        store.record_delivery_attempt(&attempt).await.expect("record again");

        let attempts = store.delivery_attempts(&id).await.expect("list");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].http_status, Some(503));
    }

    #[tokio::test]
    async fn long_error_messages_are_truncated() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let (id, _, _) = seeded_delivery(&store).await;

        let long = "x".repeat(2000);
        store
            .mark_delivery_failed(&id, 1, "REQUEST_FAILED", &long, None)
            .await
            .expect("failed");

        let row = store.get_delivery(&id).await.expect("get").expect("exists");
        assert_eq!(
            row.last_error_message.map(|m| m.chars().count()),
            Some(ERROR_MESSAGE_MAX_CHARS)
        );
    }
}
