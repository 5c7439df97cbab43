//! Outbound trigger call to an instance.
//!
//! The consumer talks to instances through the [`TriggerClient`] trait so
//! tests can substitute stub transports; [`HttpTriggerClient`] is the
//! production implementation, bounded by a request timeout that aborts the
//! call.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default path on the instance that receives trigger calls.
pub const INSTANCE_TRIGGER_PATH_DEFAULT: &str = "/api/internal/cron/cloud-trigger";

/// Default outbound request timeout in milliseconds.
pub const REQUEST_TIMEOUT_MS_DEFAULT: u64 = 15_000;

/// Trigger type reported to the instance.
pub const TRIGGER_TYPE_CLOUD: &str = "CLOUD";

/// Body POSTed to the instance's trigger endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    /// Delivery this call belongs to; the instance dedups on it.
    pub delivery_id: String,
    /// Site UUID.
    pub site_id: String,
    /// Always `CLOUD` for control-plane triggers.
    pub trigger_type: String,
    /// When the control plane issued the call.
    pub requested_at: DateTime<Utc>,
}

impl TriggerRequest {
    /// Builds a trigger request for one delivery.
    #[must_use]
    pub fn new(delivery_id: &str, site_id: &str, requested_at: DateTime<Utc>) -> Self {
        Self {
            delivery_id: delivery_id.to_string(),
            site_id: site_id.to_string(),
            trigger_type: TRIGGER_TYPE_CLOUD.to_string(),
            requested_at,
        }
    }
}

/// A response from the instance, however unhappy.
#[derive(Debug, Clone)]
pub struct TriggerResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

/// Transport-level trigger failure.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// The call exceeded the request timeout and was aborted.
    #[error("trigger request timed out")]
    Timeout,

    /// Any other transport failure (connect, TLS, protocol).
    #[error("trigger request failed: {0}")]
    Transport(String),
}

/// Client for the instance trigger endpoint.
#[async_trait]
pub trait TriggerClient: Send + Sync {
    /// POSTs the trigger call and returns whatever response arrives.
    ///
    /// # Errors
    ///
    /// Returns [`TriggerError::Timeout`] when the deadline elapses and
    /// [`TriggerError::Transport`] for other wire failures. Non-2xx
    /// responses are NOT errors; the consumer classifies them.
    async fn trigger(
        &self,
        site_url: &str,
        token: &str,
        request: &TriggerRequest,
    ) -> Result<TriggerResponse, TriggerError>;
}

/// Joins an origin and a path without doubling slashes.
#[must_use]
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Production trigger client backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpTriggerClient {
    client: reqwest::Client,
    trigger_path: String,
}

impl HttpTriggerClient {
    /// Creates a client with the given trigger path and timeout.
    #[must_use]
    pub fn new(trigger_path: impl Into<String>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            trigger_path: trigger_path.into(),
        }
    }

    /// Creates a client with the default path and timeout.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(INSTANCE_TRIGGER_PATH_DEFAULT, REQUEST_TIMEOUT_MS_DEFAULT)
    }
}

#[async_trait]
impl TriggerClient for HttpTriggerClient {
    async fn trigger(
        &self,
        site_url: &str,
        token: &str,
        request: &TriggerRequest,
    ) -> Result<TriggerResponse, TriggerError> {
        let url = join_url(site_url, &self.trigger_path);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("x-np-delivery-id", &request.delivery_id)
            .header("x-np-site-id", &request.site_id)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TriggerError::Timeout
                } else {
                    TriggerError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TriggerError::Timeout
            } else {
                TriggerError::Transport(format!("failed to read trigger response: {e}"))
            }
        })?;

        Ok(TriggerResponse { status, body })
    }
}
