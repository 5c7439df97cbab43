//! Housekeeping: retention pruning and hourly aggregation.
//!
//! Runs once per tick whose UTC minute equals [`MAINTENANCE_MINUTE`]: old
//! raw telemetry, stale hourly roll-ups, aged build events and minute-load
//! buckets are deleted, and hourly aggregates are recomputed over the most
//! recent window.

use chrono::{DateTime, Duration, Utc};

use pulse_store::PulseStore;

use crate::error::Result;

/// Tick minute on which maintenance runs.
pub const MAINTENANCE_MINUTE: u32 = 13;

/// Retention windows for housekeeping.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Raw telemetry retention in days.
    pub raw_retention_days: i64,
    /// Hourly roll-up retention in days.
    pub hourly_retention_days: i64,
    /// Build-event retention in days.
    pub build_event_retention_days: i64,
    /// Minute-load bucket retention in hours.
    pub minute_load_retention_hours: i64,
    /// How far back the hourly roll-up recomputes.
    pub rollup_window_hours: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            raw_retention_days: 90,
            hourly_retention_days: 365,
            build_event_retention_days: 365,
            minute_load_retention_hours: 24,
            rollup_window_hours: 2,
        }
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceOutcome {
    /// Raw telemetry rows removed.
    pub samples_pruned: u64,
    /// Hourly roll-up rows removed.
    pub hourly_pruned: u64,
    /// Build-event rows removed.
    pub build_events_pruned: u64,
    /// Minute-load buckets removed.
    pub minute_load_pruned: u64,
    /// Hourly buckets rebuilt.
    pub hourly_rebuilt: u64,
}

/// Runs one maintenance pass.
///
/// # Errors
///
/// Returns an error when a store statement fails.
pub async fn run_maintenance(
    store: &PulseStore,
    config: &MaintenanceConfig,
    now: DateTime<Utc>,
) -> Result<MaintenanceOutcome> {
    let outcome = MaintenanceOutcome {
        samples_pruned: store
            .prune_telemetry_samples(now - Duration::days(config.raw_retention_days))
            .await?,
        hourly_pruned: store
            .prune_telemetry_hourly(now - Duration::days(config.hourly_retention_days))
            .await?,
        build_events_pruned: store
            .prune_build_events(now - Duration::days(config.build_event_retention_days))
            .await?,
        minute_load_pruned: store
            .prune_minute_load(now - Duration::hours(config.minute_load_retention_hours))
            .await?,
        hourly_rebuilt: store
            .rebuild_telemetry_hourly(now - Duration::hours(config.rollup_window_hours), now)
            .await?,
    };

    tracing::info!(
        samples_pruned = outcome.samples_pruned,
        hourly_pruned = outcome.hourly_pruned,
        build_events_pruned = outcome.build_events_pruned,
        minute_load_pruned = outcome.minute_load_pruned,
        hourly_rebuilt = outcome.hourly_rebuilt,
        "maintenance pass completed"
    );
    Ok(outcome)
}
