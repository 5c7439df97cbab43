//! Server configuration, read from environment variables.

use pulse_core::error::{Error, Result};
use pulse_core::signature::DEFAULT_SIGNATURE_WINDOW_MS;
use pulse_core::token::{CLOUD_ISSUER_DEFAULT, INSTANCE_TRIGGER_AUDIENCE_DEFAULT};
use pulse_flow::consumer::{ConsumerConfig, MAX_RETRY_ATTEMPTS_DEFAULT};
use pulse_flow::maintenance::MaintenanceConfig;
use pulse_flow::scheduler::SchedulerConfig;
use pulse_flow::telemetry::TELEMETRY_RAW_MAX_BYTES_DEFAULT;
use pulse_flow::trigger::{INSTANCE_TRIGGER_PATH_DEFAULT, REQUEST_TIMEOUT_MS_DEFAULT};

/// Configuration for the Pulse control plane.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port (`PULSE_HTTP_PORT`).
    pub http_port: u16,
    /// Debug mode: pretty logs, in-memory store allowed (`PULSE_DEBUG`).
    pub debug: bool,
    /// SQLite database path; unset means in-memory (`PULSE_DB_PATH`).
    pub db_path: Option<String>,
    /// Published JWKS document (`CLOUD_JWKS_JSON`, required).
    pub jwks_json: String,
    /// Private signing keys (`CLOUD_PRIVATE_KEYS_JSON`, required).
    pub private_keys_json: String,
    /// Which kid signs outbound tokens (`CLOUD_ACTIVE_KID`; first key when
    /// unset).
    pub active_kid: Option<String>,
    /// JWT issuer (`CLOUD_ISSUER`).
    pub issuer: String,
    /// JWT audience (`INSTANCE_TRIGGER_AUDIENCE`).
    pub audience: String,
    /// Path POSTed on the instance (`INSTANCE_TRIGGER_PATH`).
    pub trigger_path: String,
    /// Outbound request timeout (`REQUEST_TIMEOUT_MS`).
    pub request_timeout_ms: u64,
    /// Retry ceiling (`MAX_RETRY_ATTEMPTS`).
    pub max_retry_attempts: u32,
    /// Per-minute dispatch quota (`MAX_DISPATCH_PER_MINUTE`).
    pub max_dispatch_per_minute: i64,
    /// Raw telemetry cap in bytes (`TELEMETRY_RAW_MAX_BYTES`).
    pub telemetry_raw_max_bytes: usize,
    /// Inbound signature freshness window (`SIGNATURE_WINDOW_MS`).
    pub signature_window_ms: i64,
    /// Slot reservation lookahead (`MAX_SLOT_LOOKAHEAD_MINUTES`).
    pub slot_lookahead_minutes: u32,
    /// Enqueue ceiling per tick (`MAX_SCHEDULE_SCAN_PER_TICK`).
    pub max_schedule_scan_per_tick: u64,
    /// Due-scan page size (`SCHEDULE_BATCH_LIMIT`).
    pub schedule_batch_limit: i64,
    /// Minute-load retention (`MINUTE_LOAD_RETENTION_HOURS`).
    pub minute_load_retention_hours: i64,
}

impl Config {
    /// Builds configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or a value does
    /// not parse.
    pub fn from_env() -> Result<Self> {
        let jwks_json = env_string("CLOUD_JWKS_JSON").ok_or_else(|| {
            Error::InvalidInput("CLOUD_JWKS_JSON is required".to_string())
        })?;
        let private_keys_json = env_string("CLOUD_PRIVATE_KEYS_JSON").ok_or_else(|| {
            Error::InvalidInput("CLOUD_PRIVATE_KEYS_JSON is required".to_string())
        })?;

        Ok(Self {
            http_port: parse_env_u64("PULSE_HTTP_PORT", 8080)?
                .try_into()
                .map_err(|_| Error::InvalidInput("PULSE_HTTP_PORT out of range".to_string()))?,
            debug: parse_env_bool("PULSE_DEBUG", false)?,
            db_path: env_string("PULSE_DB_PATH"),
            jwks_json,
            private_keys_json,
            active_kid: env_string("CLOUD_ACTIVE_KID"),
            issuer: env_string("CLOUD_ISSUER").unwrap_or_else(|| CLOUD_ISSUER_DEFAULT.to_string()),
            audience: env_string("INSTANCE_TRIGGER_AUDIENCE")
                .unwrap_or_else(|| INSTANCE_TRIGGER_AUDIENCE_DEFAULT.to_string()),
            trigger_path: env_string("INSTANCE_TRIGGER_PATH")
                .unwrap_or_else(|| INSTANCE_TRIGGER_PATH_DEFAULT.to_string()),
            request_timeout_ms: parse_env_u64("REQUEST_TIMEOUT_MS", REQUEST_TIMEOUT_MS_DEFAULT)?,
            max_retry_attempts: parse_env_u64(
                "MAX_RETRY_ATTEMPTS",
                u64::from(MAX_RETRY_ATTEMPTS_DEFAULT),
            )?
            .try_into()
            .map_err(|_| Error::InvalidInput("MAX_RETRY_ATTEMPTS out of range".to_string()))?,
            max_dispatch_per_minute: parse_env_i64("MAX_DISPATCH_PER_MINUTE", 60)?,
            telemetry_raw_max_bytes: parse_env_u64(
                "TELEMETRY_RAW_MAX_BYTES",
                TELEMETRY_RAW_MAX_BYTES_DEFAULT as u64,
            )?
            .try_into()
            .map_err(|_| Error::InvalidInput("TELEMETRY_RAW_MAX_BYTES out of range".to_string()))?,
            signature_window_ms: parse_env_i64("SIGNATURE_WINDOW_MS", DEFAULT_SIGNATURE_WINDOW_MS)?,
            slot_lookahead_minutes: parse_env_u64("MAX_SLOT_LOOKAHEAD_MINUTES", 10)?
                .try_into()
                .map_err(|_| {
                    Error::InvalidInput("MAX_SLOT_LOOKAHEAD_MINUTES out of range".to_string())
                })?,
            max_schedule_scan_per_tick: parse_env_u64("MAX_SCHEDULE_SCAN_PER_TICK", 500)?,
            schedule_batch_limit: parse_env_i64("SCHEDULE_BATCH_LIMIT", 100)?,
            minute_load_retention_hours: parse_env_i64("MINUTE_LOAD_RETENTION_HOURS", 24)?,
        })
    }

    /// Test/dev constructor: defaults everywhere, explicit key material.
    #[must_use]
    pub fn with_keys(jwks_json: impl Into<String>, private_keys_json: impl Into<String>) -> Self {
        Self {
            http_port: 8080,
            debug: true,
            db_path: None,
            jwks_json: jwks_json.into(),
            private_keys_json: private_keys_json.into(),
            active_kid: None,
            issuer: CLOUD_ISSUER_DEFAULT.to_string(),
            audience: INSTANCE_TRIGGER_AUDIENCE_DEFAULT.to_string(),
            trigger_path: INSTANCE_TRIGGER_PATH_DEFAULT.to_string(),
            request_timeout_ms: REQUEST_TIMEOUT_MS_DEFAULT,
            max_retry_attempts: MAX_RETRY_ATTEMPTS_DEFAULT,
            max_dispatch_per_minute: 60,
            telemetry_raw_max_bytes: TELEMETRY_RAW_MAX_BYTES_DEFAULT,
            signature_window_ms: DEFAULT_SIGNATURE_WINDOW_MS,
            slot_lookahead_minutes: 10,
            max_schedule_scan_per_tick: 500,
            schedule_batch_limit: 100,
            minute_load_retention_hours: 24,
        }
    }

    /// Scheduler knobs derived from this configuration.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_dispatch_per_minute: self.max_dispatch_per_minute,
            slot_lookahead_minutes: self.slot_lookahead_minutes,
            schedule_batch_limit: self.schedule_batch_limit,
            max_scan_per_tick: self.max_schedule_scan_per_tick,
            maintenance: MaintenanceConfig {
                minute_load_retention_hours: self.minute_load_retention_hours,
                ..MaintenanceConfig::default()
            },
        }
    }

    /// Consumer knobs derived from this configuration.
    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_retry_attempts: self.max_retry_attempts,
            max_dispatch_per_minute: self.max_dispatch_per_minute,
            slot_lookahead_minutes: self.slot_lookahead_minutes,
            issuer: self.issuer.clone(),
            audience: self.audience.clone(),
            telemetry_raw_max_bytes: self.telemetry_raw_max_bytes,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .and_then(|value| if value.is_empty() { None } else { Some(value) })
}

fn parse_env_bool(key: &str, default: bool) -> Result<bool> {
    let Some(value) = env_string(key) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(true),
        "0" | "false" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{key} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn parse_env_u64(key: &str, default: u64) -> Result<u64> {
    let Some(value) = env_string(key) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|_| Error::InvalidInput(format!("{key} must be an unsigned integer")))
}

fn parse_env_i64(key: &str, default: i64) -> Result<i64> {
    let Some(value) = env_string(key) else {
        return Ok(default);
    };
    value
        .parse::<i64>()
        .map_err(|_| Error::InvalidInput(format!("{key} must be an integer")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_keys_carries_documented_defaults() {
        let config = Config::with_keys("{\"keys\":[]}", "{\"keys\":[]}");
        assert_eq!(config.issuer, "np-cloud");
        assert_eq!(config.audience, "np-instance");
        assert_eq!(config.trigger_path, "/api/internal/cron/cloud-trigger");
        assert_eq!(config.request_timeout_ms, 15_000);
        assert_eq!(config.max_retry_attempts, 6);
        assert_eq!(config.telemetry_raw_max_bytes, 4_096);
        assert_eq!(config.signature_window_ms, 300_000);
    }

    #[test]
    fn derived_configs_share_quota_settings() {
        let mut config = Config::with_keys("{\"keys\":[]}", "{\"keys\":[]}");
        config.max_dispatch_per_minute = 7;
        config.slot_lookahead_minutes = 3;

        let scheduler = config.scheduler_config();
        let consumer = config.consumer_config();
        assert_eq!(scheduler.max_dispatch_per_minute, 7);
        assert_eq!(consumer.max_dispatch_per_minute, 7);
        assert_eq!(scheduler.slot_lookahead_minutes, 3);
        assert_eq!(consumer.slot_lookahead_minutes, 3);
    }
}
