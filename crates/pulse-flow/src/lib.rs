//! # pulse-flow
//!
//! Scheduling and delivery pipeline for the Pulse control plane.
//!
//! This crate implements the hard core of the system:
//!
//! - **Scheduler tick**: scans due instances, reserves per-minute quota,
//!   creates deliveries, and enqueues dispatch messages with a delay
//! - **Queue consumer**: dispatches queued messages to instances, classifies
//!   outcomes, and drives the delivery state machine with explicit
//!   re-enqueue retries and a dead-letter drain
//! - **Trigger client**: the outbound HTTP call, bounded by a timeout
//! - **Telemetry parser**: tolerant projection of instance responses
//! - **Maintenance**: pruning and hourly aggregation
//!
//! ## Guarantees
//!
//! - **At-least-once**: a delivery may be dispatched more than once across
//!   crash-resume; instances dedup by delivery id
//! - **Exact minute quota**: admission is serialized through one conditional
//!   upsert per reservation
//! - **Queue handlers never throw**: every failure becomes a delivery-state
//!   transition plus ACK or an explicit re-enqueue

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod consumer;
pub mod error;
pub mod maintenance;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod telemetry;
pub mod trigger;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::consumer::{ConsumerConfig, DispatchOutcome, QueueConsumer};
    pub use crate::error::{Error, Result};
    pub use crate::maintenance::{MaintenanceConfig, run_maintenance};
    pub use crate::queue::memory::InMemoryDispatchQueue;
    pub use crate::queue::{DispatchMessage, DispatchQueue, EnqueueOptions, QueueMessage};
    pub use crate::scheduler::{Scheduler, SchedulerConfig, TickOutcome, compute_next_run_at};
    pub use crate::telemetry::{ParsedTelemetry, parse_telemetry};
    pub use crate::trigger::{HttpTriggerClient, TriggerClient, TriggerError, TriggerRequest};
}

pub use consumer::{ConsumerConfig, DispatchOutcome, QueueConsumer};
pub use error::{Error, Result};
pub use queue::{DispatchMessage, DispatchQueue, EnqueueOptions, QueueMessage};
pub use scheduler::{Scheduler, SchedulerConfig, TickOutcome, compute_next_run_at};
