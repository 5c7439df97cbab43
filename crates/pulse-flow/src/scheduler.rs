//! Scheduler tick: scan due instances, reserve quota, enqueue dispatches.
//!
//! The tick is driven at minute granularity by an external trigger (cron in
//! managed deployments, a tokio interval loop in the bundled daemon). Each
//! tick:
//!
//! 1. Reads pages of due instances, oldest `next_run_at` first
//! 2. Reserves a minute slot per instance; a full window skips the row,
//!    leaving it eligible for the next tick
//! 3. Persists a `queued` delivery, then enqueues the dispatch message with
//!    a delay targeting the reserved minute
//! 4. Advances the instance's `next_run_at` to the next daily occurrence of
//!    its assigned minute
//!
//! No transaction wraps the create/enqueue/advance triple; crash-resume
//! leaves either a dead-letterable delivery or a tolerable duplicate
//! absorbed by instance-side dedup.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Timelike, Utc};
use metrics::{counter, histogram};

use pulse_core::DeliveryId;
use pulse_store::{PulseStore, SlotSource};

use crate::error::Result;
use crate::maintenance::{MAINTENANCE_MINUTE, MaintenanceConfig, run_maintenance};
use crate::metrics::{TimingGuard, labels, names};
use crate::queue::{DispatchMessage, DispatchQueue, EnqueueOptions};

/// Error code recorded when the dispatch queue rejects an enqueue.
pub const QUEUE_SEND_FAILED: &str = "QUEUE_SEND_FAILED";

/// Tuning knobs for the scheduler tick.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cluster-wide dispatch quota per UTC minute.
    pub max_dispatch_per_minute: i64,
    /// How many minutes a reservation may spill forward.
    pub slot_lookahead_minutes: u32,
    /// Page size for the due-instance scan.
    pub schedule_batch_limit: i64,
    /// Soft ceiling on enqueues per tick; excess work defers to the next
    /// tick.
    pub max_scan_per_tick: u64,
    /// Maintenance retention windows.
    pub maintenance: MaintenanceConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_dispatch_per_minute: 60,
            slot_lookahead_minutes: 10,
            schedule_batch_limit: 100,
            max_scan_per_tick: 500,
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Due rows examined.
    pub scanned: u64,
    /// Deliveries created and enqueued.
    pub enqueued: u64,
    /// Rows skipped because every minute in the window was full.
    pub skipped_no_slot: u64,
    /// Deliveries buried because the queue rejected the enqueue.
    pub dead_on_enqueue: u64,
    /// Whether housekeeping ran this tick.
    pub maintenance_ran: bool,
}

/// Computes the next strictly-future UTC time whose HH:MM equals the
/// instance's assigned minute of day.
#[must_use]
pub fn compute_next_run_at(minute_of_day: u16, after: DateTime<Utc>) -> DateTime<Utc> {
    let hour = u32::from(minute_of_day / 60);
    let minute = u32::from(minute_of_day % 60);

    let candidate = after
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .map_or(after, |naive| naive.and_utc());

    if candidate > after {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

/// The scheduler tick handler.
pub struct Scheduler {
    store: PulseStore,
    queue: Arc<dyn DispatchQueue>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Creates a scheduler over a store and dispatch queue.
    #[must_use]
    pub fn new(store: PulseStore, queue: Arc<dyn DispatchQueue>, config: SchedulerConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Runs one tick at `tick_time`.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failures; per-instance enqueue
    /// failures are absorbed into delivery-state transitions.
    pub async fn run_tick(&self, tick_time: DateTime<Utc>) -> Result<TickOutcome> {
        let _timing = TimingGuard::new(|duration| {
            histogram!(names::TICK_DURATION_SECONDS).record(duration.as_secs_f64());
        });

        let mut outcome = TickOutcome::default();

        'scan: loop {
            let due = self
                .store
                .due_instances(tick_time, self.config.schedule_batch_limit)
                .await?;
            if due.is_empty() {
                break;
            }

            let mut progressed_this_page = 0_u64;
            for instance in due {
                if outcome.enqueued >= self.config.max_scan_per_tick {
                    break 'scan;
                }
                outcome.scanned += 1;

                let Some(slot) = self
                    .store
                    .reserve_slot(
                        tick_time,
                        SlotSource::Scheduled,
                        self.config.max_dispatch_per_minute,
                        self.config.slot_lookahead_minutes,
                    )
                    .await?
                else {
                    counter!(
                        names::SLOT_RESERVATIONS_TOTAL,
                        labels::SOURCE => SlotSource::Scheduled.as_str(),
                        labels::RESULT => "exhausted",
                    )
                    .increment(1);
                    outcome.skipped_no_slot += 1;
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        "dispatch window full, instance deferred to next tick"
                    );
                    continue;
                };
                progressed_this_page += 1;
                counter!(
                    names::SLOT_RESERVATIONS_TOTAL,
                    labels::SOURCE => SlotSource::Scheduled.as_str(),
                    labels::RESULT => "reserved",
                )
                .increment(1);

                let delivery_id = DeliveryId::generate();
                self.store
                    .create_delivery(
                        &delivery_id,
                        &instance.instance_id,
                        slot.minute_start,
                        tick_time,
                    )
                    .await?;

                let message = DispatchMessage {
                    delivery_id,
                    instance_id: instance.instance_id,
                    site_id: instance.site_id.clone(),
                    site_url: instance.site_url.clone().unwrap_or_default(),
                    scheduled_for: slot.minute_start,
                    enqueued_at: tick_time,
                    dispatch_attempt: 1,
                };
                let options =
                    EnqueueOptions::new().with_delay(delay_until(slot.minute_start, tick_time));

                match self.queue.enqueue(message, options).await {
                    Ok(_) => {
                        outcome.enqueued += 1;
                        counter!(
                            names::DELIVERIES_ENQUEUED_TOTAL,
                            labels::SOURCE => SlotSource::Scheduled.as_str(),
                        )
                        .increment(1);
                    }
                    Err(e) => {
                        tracing::error!(
                            delivery_id = %delivery_id,
                            error = %e,
                            "dispatch enqueue failed, burying delivery"
                        );
                        self.store
                            .mark_delivery_failed(
                                &delivery_id,
                                1,
                                QUEUE_SEND_FAILED,
                                &e.to_string(),
                                None,
                            )
                            .await?;
                        self.store
                            .mark_delivery_dead(
                                &delivery_id,
                                QUEUE_SEND_FAILED,
                                &e.to_string(),
                                tick_time,
                            )
                            .await?;
                        counter!(
                            names::DEAD_LETTERS_TOTAL,
                            labels::CODE => QUEUE_SEND_FAILED,
                        )
                        .increment(1);
                        outcome.dead_on_enqueue += 1;
                    }
                }

                let next_run = compute_next_run_at(instance.minute_of_day, tick_time);
                self.store
                    .advance_next_run(&instance.instance_id, next_run, tick_time)
                    .await?;
            }

            // A page that made no reservations can only repeat itself.
            if progressed_this_page == 0 {
                break;
            }
        }

        if tick_time.minute() == MAINTENANCE_MINUTE {
            run_maintenance(&self.store, &self.config.maintenance, tick_time).await?;
            outcome.maintenance_ran = true;
        }

        counter!(names::SCHEDULE_TICKS_TOTAL, labels::STATUS => "completed").increment(1);
        Ok(outcome)
    }
}

/// Delay from `now` until the reserved minute, rounded up to whole seconds
/// and floored at zero.
fn delay_until(minute_start: DateTime<Utc>, now: DateTime<Utc>) -> StdDuration {
    let delta_ms = (minute_start - now).num_milliseconds();
    if delta_ms <= 0 {
        StdDuration::ZERO
    } else {
        let seconds = u64::try_from((delta_ms + 999) / 1000).unwrap_or(0);
        StdDuration::from_secs(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_run_is_strictly_future_with_matching_hh_mm() {
        let after = Utc.with_ymd_and_hms(2026, 8, 2, 9, 15, 42).unwrap();

        // Later today
        let next = compute_next_run_at(20 * 60 + 30, after);
        assert!(next > after);
        assert_eq!((next.hour(), next.minute()), (20, 30));
        assert_eq!(next.date_naive(), after.date_naive());

        // Earlier today rolls to tomorrow
        let next = compute_next_run_at(8 * 60, after);
        assert!(next > after);
        assert_eq!((next.hour(), next.minute()), (8, 0));
        assert_eq!(next.date_naive(), after.date_naive() + Duration::days(1));
    }

    #[test]
    fn next_run_at_exact_minute_rolls_forward() {
        // `after` sits exactly on the assigned minute: the candidate equals
        // `after` only at second zero, otherwise it is later the same minute.
        let after = Utc.with_ymd_and_hms(2026, 8, 2, 9, 15, 0).unwrap();
        let next = compute_next_run_at(9 * 60 + 15, after);
        assert!(next > after);
        assert_eq!(next.date_naive(), after.date_naive() + Duration::days(1));
    }

    #[test]
    fn next_run_minute_zero() {
        let after = Utc.with_ymd_and_hms(2026, 8, 2, 23, 59, 59).unwrap();
        let next = compute_next_run_at(0, after);
        assert_eq!((next.hour(), next.minute()), (0, 0));
        assert!(next > after);
    }

    #[test]
    fn delay_rounds_up_and_floors_at_zero() {
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 9, 15, 42).unwrap();
        let minute = Utc.with_ymd_and_hms(2026, 8, 2, 9, 17, 0).unwrap();
        assert_eq!(delay_until(minute, now), StdDuration::from_secs(78));

        let past = Utc.with_ymd_and_hms(2026, 8, 2, 9, 15, 0).unwrap();
        assert_eq!(delay_until(past, now), StdDuration::ZERO);

        let sub_second = now + Duration::milliseconds(1500);
        assert_eq!(delay_until(sub_second, now), StdDuration::from_secs(2));
    }
}
