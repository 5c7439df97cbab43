//! Per-minute dispatch admission control.
//!
//! Capacity is reserved with a single conditional upsert per candidate
//! minute: insert the bucket if absent, otherwise increment only while
//! `total_count < max_per_minute`. The statement returns the row iff the
//! reservation held, which makes the bucket the cluster-wide serialization
//! point without any external lock.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use crate::error::Result;
use crate::store::PulseStore;
use crate::time::{floor_to_minute, fmt_ts};

/// Who is asking for the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSource {
    /// First dispatch of a scheduled delivery.
    Scheduled,
    /// Re-dispatch after a failed attempt.
    Retry,
}

impl SlotSource {
    /// Returns the label used in metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Retry => "retry",
        }
    }
}

/// A successful minute reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReservation {
    /// The reserved minute (UTC, floored).
    pub minute_start: DateTime<Utc>,
    /// How many minutes past the preferred minute the reservation landed.
    pub offset_minutes: u32,
    /// Post-increment scheduled count for the minute.
    pub scheduled_count: i64,
    /// Post-increment retry count for the minute.
    pub retry_count: i64,
    /// Post-increment total count for the minute.
    pub total_count: i64,
}

/// One row of the minute-load table (projection for tests and invariants).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinuteLoadRow {
    /// Bucket minute.
    pub minute_start: DateTime<Utc>,
    /// Reservations made by the scheduler.
    pub scheduled_count: i64,
    /// Reservations made by the retry path.
    pub retry_count: i64,
    /// Total reservations.
    pub total_count: i64,
}

impl PulseStore {
    /// Atomically reserves dispatch capacity at or after `preferred_at`.
    ///
    /// Walks minute buckets starting at `floor_to_minute(preferred_at)`,
    /// spilling forward up to `lookahead_minutes` extra minutes. Returns the
    /// first successful reservation, or `None` when every minute in the
    /// window is full; the caller surfaces a dead-letter.
    ///
    /// # Errors
    ///
    /// Returns an error when a statement fails.
    pub async fn reserve_slot(
        &self,
        preferred_at: DateTime<Utc>,
        source: SlotSource,
        max_per_minute: i64,
        lookahead_minutes: u32,
    ) -> Result<Option<SlotReservation>> {
        if max_per_minute < 1 {
            return Ok(None);
        }

        let base = floor_to_minute(preferred_at);
        let (scheduled_inc, retry_inc) = match source {
            SlotSource::Scheduled => (1_i64, 0_i64),
            SlotSource::Retry => (0_i64, 1_i64),
        };

        for offset in 0..=lookahead_minutes {
            let minute_start = base + Duration::minutes(i64::from(offset));
            let row = sqlx::query(
                "INSERT INTO dispatch_minute_load (
                    minute_start, scheduled_count, retry_count, total_count,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, 1, ?4, ?4)
                ON CONFLICT (minute_start) DO UPDATE SET
                    scheduled_count = dispatch_minute_load.scheduled_count + ?2,
                    retry_count = dispatch_minute_load.retry_count + ?3,
                    total_count = dispatch_minute_load.total_count + 1,
                    updated_at = ?4
                WHERE dispatch_minute_load.total_count < ?5
                RETURNING scheduled_count, retry_count, total_count",
            )
            .bind(fmt_ts(minute_start))
            .bind(scheduled_inc)
            .bind(retry_inc)
            .bind(fmt_ts(preferred_at))
            .bind(max_per_minute)
            .fetch_optional(self.pool())
            .await?;

            if let Some(row) = row {
                return Ok(Some(SlotReservation {
                    minute_start,
                    offset_minutes: offset,
                    scheduled_count: row.try_get("scheduled_count")?,
                    retry_count: row.try_get("retry_count")?,
                    total_count: row.try_get("total_count")?,
                }));
            }
        }

        Ok(None)
    }

    /// Reads one minute bucket, if present.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn minute_load(&self, minute_start: DateTime<Utc>) -> Result<Option<MinuteLoadRow>> {
        let row = sqlx::query(
            "SELECT scheduled_count, retry_count, total_count
            FROM dispatch_minute_load WHERE minute_start = ?1",
        )
        .bind(fmt_ts(floor_to_minute(minute_start)))
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(MinuteLoadRow {
                minute_start: floor_to_minute(minute_start),
                scheduled_count: row.try_get("scheduled_count")?,
                retry_count: row.try_get("retry_count")?,
                total_count: row.try_get("total_count")?,
            })
        })
        .transpose()
    }

    /// Deletes minute buckets older than the cutoff. Returns rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error when the delete fails.
    pub async fn prune_minute_load(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dispatch_minute_load WHERE minute_start < ?1")
            .bind(fmt_ts(before))
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn preferred() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, 9, 15, 42).unwrap()
    }

    #[tokio::test]
    async fn first_reservation_creates_the_bucket() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let slot = store
            .reserve_slot(preferred(), SlotSource::Scheduled, 60, 5)
            .await
            .expect("reserve")
            .expect("slot");

        assert_eq!(slot.offset_minutes, 0);
        assert_eq!(slot.scheduled_count, 1);
        assert_eq!(slot.retry_count, 0);
        assert_eq!(slot.total_count, 1);
        assert_eq!(fmt_ts(slot.minute_start), "2026-08-02T09:15:00.000Z");
    }

    #[tokio::test]
    async fn counts_split_by_source_and_total_is_their_sum() {
        let store = PulseStore::open_in_memory().await.expect("open");
        store
            .reserve_slot(preferred(), SlotSource::Scheduled, 60, 5)
            .await
            .expect("reserve")
            .expect("slot");
        store
            .reserve_slot(preferred(), SlotSource::Retry, 60, 5)
            .await
            .expect("reserve")
            .expect("slot");
        let third = store
            .reserve_slot(preferred(), SlotSource::Scheduled, 60, 5)
            .await
            .expect("reserve")
            .expect("slot");

        assert_eq!(third.scheduled_count, 2);
        assert_eq!(third.retry_count, 1);
        assert_eq!(third.total_count, 3);

        let bucket = store
            .minute_load(preferred())
            .await
            .expect("load")
            .expect("bucket");
        assert_eq!(
            bucket.total_count,
            bucket.scheduled_count + bucket.retry_count
        );
    }

    #[tokio::test]
    async fn full_minute_spills_to_the_next() {
        let store = PulseStore::open_in_memory().await.expect("open");

        let first = store
            .reserve_slot(preferred(), SlotSource::Scheduled, 1, 5)
            .await
            .expect("reserve")
            .expect("slot");
        assert_eq!(first.offset_minutes, 0);

        let second = store
            .reserve_slot(preferred(), SlotSource::Scheduled, 1, 5)
            .await
            .expect("reserve")
            .expect("slot");
        assert_eq!(second.offset_minutes, 1);
        assert_eq!(fmt_ts(second.minute_start), "2026-08-02T09:16:00.000Z");
        assert_eq!(second.total_count, 1);
    }

    #[tokio::test]
    async fn exhausted_window_returns_none() {
        let store = PulseStore::open_in_memory().await.expect("open");

        for _ in 0..3 {
            store
                .reserve_slot(preferred(), SlotSource::Retry, 1, 2)
                .await
                .expect("reserve")
                .expect("slot");
        }

        let none = store
            .reserve_slot(preferred(), SlotSource::Retry, 1, 2)
            .await
            .expect("reserve");
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn quota_is_never_exceeded() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let max = 3_i64;

        for _ in 0..12 {
            let _ = store
                .reserve_slot(preferred(), SlotSource::Scheduled, max, 3)
                .await
                .expect("reserve");
        }

        for offset in 0..=3 {
            let minute = floor_to_minute(preferred()) + Duration::minutes(offset);
            if let Some(bucket) = store.minute_load(minute).await.expect("load") {
                assert!(bucket.total_count <= max, "bucket over quota: {bucket:?}");
                assert_eq!(
                    bucket.total_count,
                    bucket.scheduled_count + bucket.retry_count
                );
            }
        }
    }

    #[tokio::test]
    async fn zero_quota_reserves_nothing() {
        let store = PulseStore::open_in_memory().await.expect("open");
        let none = store
            .reserve_slot(preferred(), SlotSource::Scheduled, 0, 5)
            .await
            .expect("reserve");
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn prune_removes_old_buckets() {
        let store = PulseStore::open_in_memory().await.expect("open");
        store
            .reserve_slot(preferred(), SlotSource::Scheduled, 60, 0)
            .await
            .expect("reserve")
            .expect("slot");

        let removed = store
            .prune_minute_load(preferred() + Duration::days(1))
            .await
            .expect("prune");
        assert_eq!(removed, 1);
        assert!(store.minute_load(preferred()).await.expect("load").is_none());
    }
}
