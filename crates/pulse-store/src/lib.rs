//! # pulse-store
//!
//! SQLite persistence for the Pulse instance-trigger control plane.
//!
//! This crate owns the relational schema and every statement that touches
//! it:
//!
//! - **Instances**: registered sites with their pinned keys and schedule
//! - **Build events**: idempotence ledger for `sync` calls
//! - **Deliveries + attempts**: the per-dispatch state machine
//! - **Dispatch minute load**: atomic per-minute admission control
//! - **Telemetry**: raw samples and hourly roll-ups
//! - **Cloud signing keys**: the token-issuer key ring projection
//!
//! ## Write Discipline
//!
//! Every write is a single atomic statement; upserts use
//! `ON CONFLICT ... DO UPDATE ... WHERE ... RETURNING` where admission
//! control is needed. Higher-level atomicity comes from monotone state
//! machines and idempotency keys, never multi-statement transactions.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod build_events;
pub mod deliveries;
pub mod error;
pub mod instances;
pub mod signing_keys;
pub mod slots;
pub mod store;
pub mod telemetry;
pub mod time;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::deliveries::{
        DeliveryAttemptRow, DeliveryRow, DeliveryStatus, NewDeliveryAttempt,
    };
    pub use crate::error::{Result, StoreError};
    pub use crate::instances::{InstanceRow, InstanceStatus, InstanceSyncUpdate, NewInstance};
    pub use crate::slots::{SlotReservation, SlotSource};
    pub use crate::store::PulseStore;
    pub use crate::telemetry::{NewTelemetrySample, TelemetryHourlyRow, TelemetrySampleRow};
    pub use crate::time::{floor_to_minute, fmt_ts, parse_ts};
}

pub use deliveries::{DeliveryAttemptRow, DeliveryRow, DeliveryStatus, NewDeliveryAttempt};
pub use error::{Result, StoreError};
pub use instances::{InstanceRow, InstanceStatus, InstanceSyncUpdate, NewInstance};
pub use signing_keys::{CloudSigningKeyRow, SigningKeyStatus};
pub use slots::{SlotReservation, SlotSource};
pub use store::PulseStore;
pub use telemetry::{NewTelemetrySample, TelemetryHourlyRow, TelemetrySampleRow};
