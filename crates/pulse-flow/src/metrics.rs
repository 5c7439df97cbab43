//! Observability metrics for the delivery pipeline.
//!
//! Metrics are exposed via the `metrics` crate facade and are designed to
//! support:
//!
//! - **Alerting**: SLO-based alerts on dispatch failure rates and tick lag
//! - **Dashboards**: real-time visibility into scheduler and queue health
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `pulse_schedule_ticks_total` | Counter | `status` | Scheduler tick outcomes |
//! | `pulse_tick_duration_seconds` | Histogram | - | Scheduler tick processing time |
//! | `pulse_deliveries_enqueued_total` | Counter | `source` | Deliveries enqueued by source |
//! | `pulse_dispatch_attempts_total` | Counter | `outcome` | Dispatch attempts by outcome |
//! | `pulse_dispatch_duration_seconds` | Histogram | - | Outbound trigger call time |
//! | `pulse_slot_reservations_total` | Counter | `source`, `result` | Slot reservation outcomes |
//! | `pulse_dead_letters_total` | Counter | `code` | Deliveries buried, by error code |

use std::time::{Duration, Instant};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Scheduler tick outcomes.
    pub const SCHEDULE_TICKS_TOTAL: &str = "pulse_schedule_ticks_total";
    /// Histogram: Scheduler tick processing time in seconds.
    pub const TICK_DURATION_SECONDS: &str = "pulse_tick_duration_seconds";
    /// Counter: Deliveries enqueued by source.
    pub const DELIVERIES_ENQUEUED_TOTAL: &str = "pulse_deliveries_enqueued_total";
    /// Counter: Dispatch attempts by outcome.
    pub const DISPATCH_ATTEMPTS_TOTAL: &str = "pulse_dispatch_attempts_total";
    /// Histogram: Outbound trigger call time in seconds.
    pub const DISPATCH_DURATION_SECONDS: &str = "pulse_dispatch_duration_seconds";
    /// Counter: Slot reservation outcomes.
    pub const SLOT_RESERVATIONS_TOTAL: &str = "pulse_slot_reservations_total";
    /// Counter: Deliveries buried, by error code.
    pub const DEAD_LETTERS_TOTAL: &str = "pulse_dead_letters_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome status (success, retry, drop, failed).
    pub const OUTCOME: &str = "outcome";
    /// Reservation or enqueue source (scheduled, retry).
    pub const SOURCE: &str = "source";
    /// Reservation result (reserved, exhausted).
    pub const RESULT: &str = "result";
    /// Tick outcome status (completed, failed).
    pub const STATUS: &str = "status";
    /// Terminal error code.
    pub const CODE: &str = "code";
}

/// Records elapsed wall-clock time into a callback on drop.
///
/// ## Example
///
/// ```rust
/// use metrics::histogram;
/// use pulse_flow::metrics::{TimingGuard, names};
///
/// let _guard = TimingGuard::new(|duration| {
///     histogram!(names::TICK_DURATION_SECONDS).record(duration.as_secs_f64());
/// });
/// // ... timed work
/// ```
pub struct TimingGuard<F: FnOnce(Duration)> {
    started: Instant,
    record: Option<F>,
}

impl<F: FnOnce(Duration)> TimingGuard<F> {
    /// Starts timing; `record` runs with the elapsed duration on drop.
    #[must_use]
    pub fn new(record: F) -> Self {
        Self {
            started: Instant::now(),
            record: Some(record),
        }
    }
}

impl<F: FnOnce(Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            record(self.started.elapsed());
        }
    }
}
