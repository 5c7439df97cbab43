//! Observability infrastructure for Pulse.
//!
//! Structured logging with consistent spans across the registration API,
//! scheduler and queue consumer. This module provides initialization
//! helpers and span constructors.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `pulse_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for registration operations with standard fields.
#[must_use]
pub fn registration_span(operation: &str, site_id: &str) -> Span {
    tracing::info_span!(
        "registration",
        op = operation,
        site_id = site_id,
    )
}

/// Creates a span for dispatch operations.
#[must_use]
pub fn dispatch_span(operation: &str, delivery_id: &str, instance_id: &str) -> Span {
    tracing::info_span!(
        "dispatch",
        op = operation,
        delivery_id = delivery_id,
        instance_id = instance_id,
    )
}
