//! Queue consumer: dispatch, classify, retry, dead-letter.
//!
//! The consumer receives batches from either the main dispatch queue or the
//! dead-letter queue (distinguished by name suffix). Handlers never
//! propagate errors: every failure becomes a delivery-state transition
//! plus an ACK or an explicit re-enqueue. The broker's native retry is
//! never used: backoff and minute-quota stay under the system's control by
//! re-enqueueing a copy of the message.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use metrics::{counter, histogram};

use pulse_core::PrivateKeyRing;
use pulse_store::{DeliveryStatus, InstanceStatus, NewDeliveryAttempt, NewTelemetrySample,
    PulseStore, SlotSource};

use crate::error::Result;
use crate::metrics::{labels, names};
use crate::queue::{DispatchMessage, DispatchQueue, EnqueueOptions, QueueMessage,
    is_dead_letter_queue};
use crate::telemetry::parse_telemetry;
use crate::trigger::{TriggerClient, TriggerError, TriggerRequest};

/// Default retry ceiling.
pub const MAX_RETRY_ATTEMPTS_DEFAULT: u32 = 6;

/// Error code: instance missing, not active, or without a URL.
pub const INSTANCE_NOT_ACTIVE: &str = "INSTANCE_NOT_ACTIVE";
/// Error code: trigger-token minting failed.
pub const TOKEN_SIGN_FAILED: &str = "TOKEN_SIGN_FAILED";
/// Error code: response arrived but the trigger was not accepted.
pub const UNACCEPTED_RESPONSE: &str = "UNACCEPTED_RESPONSE";
/// Error code: the outbound call hit the request timeout.
pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
/// Error code: any other transport failure.
pub const REQUEST_FAILED: &str = "REQUEST_FAILED";
/// Error code: no retry slot available in the lookahead window.
pub const RETRY_SCHEDULE_FAILED: &str = "RETRY_SCHEDULE_FAILED";
/// Error code: the retry ceiling was reached.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "MAX_ATTEMPTS_EXCEEDED";
/// Error code: the message surfaced on the dead-letter queue.
pub const DLQ_REACHED: &str = "DLQ_REACHED";
/// Error code: a failure nothing else classified.
pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
/// Error code: the dispatch queue rejected a retry enqueue.
pub const QUEUE_SEND_FAILED: &str = crate::scheduler::QUEUE_SEND_FAILED;

/// Classification of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered and accepted; ACK.
    Success,
    /// Transient failure; schedule another attempt.
    Retry,
    /// Unrecoverable for this delivery; ACK without retry.
    Drop,
}

impl DispatchOutcome {
    /// Returns the label used in metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Drop => "drop",
        }
    }
}

/// Tuning knobs for the consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Retry ceiling; reaching it buries the delivery.
    pub max_retry_attempts: u32,
    /// Cluster-wide dispatch quota per UTC minute (shared with the
    /// scheduler).
    pub max_dispatch_per_minute: i64,
    /// How many minutes a retry reservation may spill forward.
    pub slot_lookahead_minutes: u32,
    /// JWT issuer for trigger tokens.
    pub issuer: String,
    /// JWT audience for trigger tokens.
    pub audience: String,
    /// Cap on the stored raw telemetry body, in bytes.
    pub telemetry_raw_max_bytes: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: MAX_RETRY_ATTEMPTS_DEFAULT,
            max_dispatch_per_minute: 60,
            slot_lookahead_minutes: 10,
            issuer: pulse_core::token::CLOUD_ISSUER_DEFAULT.to_string(),
            audience: pulse_core::token::INSTANCE_TRIGGER_AUDIENCE_DEFAULT.to_string(),
            telemetry_raw_max_bytes: crate::telemetry::TELEMETRY_RAW_MAX_BYTES_DEFAULT,
        }
    }
}

/// Exponential backoff before the next attempt, in milliseconds.
///
/// Seconds ladder: `min(30 * 2^(attempt_no - 1), 900)`.
#[must_use]
pub fn retry_backoff_ms(attempt_no: u32) -> u64 {
    let exp = attempt_no.saturating_sub(1).min(10);
    let seconds = (30_u64 << exp).min(900);
    seconds * 1000
}

/// The queue consumer.
pub struct QueueConsumer {
    store: PulseStore,
    queue: Arc<dyn DispatchQueue>,
    trigger: Arc<dyn TriggerClient>,
    keyring: Arc<PrivateKeyRing>,
    config: ConsumerConfig,
}

impl QueueConsumer {
    /// Creates a consumer over the store, the main dispatch queue (for
    /// retry re-enqueues), a trigger client, and the signing key ring.
    #[must_use]
    pub fn new(
        store: PulseStore,
        queue: Arc<dyn DispatchQueue>,
        trigger: Arc<dyn TriggerClient>,
        keyring: Arc<PrivateKeyRing>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            trigger,
            keyring,
            config,
        }
    }

    /// Processes one batch from `queue_name`. Every message is ACKed by
    /// returning; failures are absorbed into delivery-state transitions.
    pub async fn handle_batch(&self, queue_name: &str, messages: &[QueueMessage]) {
        let dead_letter = is_dead_letter_queue(queue_name);
        for message in messages {
            if dead_letter {
                self.handle_dead_letter(message).await;
            } else {
                self.handle_message(message).await;
            }
        }
    }

    /// Handles one main-queue message.
    async fn handle_message(&self, message: &QueueMessage) {
        let parsed = match DispatchMessage::from_json(&message.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e,
                    "dropping unparseable dispatch message");
                return;
            }
        };

        let attempt_no = parsed.dispatch_attempt;
        let outcome = match self.dispatch(&parsed, attempt_no).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(delivery_id = %parsed.delivery_id, error = %e,
                    "dispatch aborted by store failure");
                // Best effort; if the store is down this fails too and the
                // delivery surfaces via the dead-letter path.
                let _ = self
                    .store
                    .mark_delivery_failed(
                        &parsed.delivery_id,
                        attempt_no,
                        UNKNOWN_ERROR,
                        &e.to_string(),
                        None,
                    )
                    .await;
                return;
            }
        };

        counter!(
            names::DISPATCH_ATTEMPTS_TOTAL,
            labels::OUTCOME => outcome.as_str(),
        )
        .increment(1);

        if outcome == DispatchOutcome::Retry {
            self.schedule_retry(&parsed, attempt_no).await;
        }
    }

    /// Schedules the next attempt, or buries the delivery when the ceiling
    /// or the quota window is exhausted.
    async fn schedule_retry(&self, message: &DispatchMessage, attempt_no: u32) {
        let now = Utc::now();

        if attempt_no >= self.config.max_retry_attempts {
            self.bury(message, MAX_ATTEMPTS_EXCEEDED, "retry budget exhausted")
                .await;
            return;
        }

        let backoff_ms = retry_backoff_ms(attempt_no);
        let preferred_at =
            now + Duration::milliseconds(i64::try_from(backoff_ms).unwrap_or(i64::MAX));

        let slot = match self
            .store
            .reserve_slot(
                preferred_at,
                SlotSource::Retry,
                self.config.max_dispatch_per_minute,
                self.config.slot_lookahead_minutes,
            )
            .await
        {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                counter!(
                    names::SLOT_RESERVATIONS_TOTAL,
                    labels::SOURCE => SlotSource::Retry.as_str(),
                    labels::RESULT => "exhausted",
                )
                .increment(1);
                self.bury(message, RETRY_SCHEDULE_FAILED, "no retry slot available")
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(delivery_id = %message.delivery_id, error = %e,
                    "retry slot reservation failed");
                return;
            }
        };
        counter!(
            names::SLOT_RESERVATIONS_TOTAL,
            labels::SOURCE => SlotSource::Retry.as_str(),
            labels::RESULT => "reserved",
        )
        .increment(1);

        let next = message.next_attempt(now);
        let delay_ms = (slot.minute_start - now).num_milliseconds().max(0);
        let options = EnqueueOptions::new().with_delay(std::time::Duration::from_millis(
            u64::try_from(delay_ms).unwrap_or(0),
        ));

        match self.queue.enqueue(next, options).await {
            Ok(_) => {
                counter!(
                    names::DELIVERIES_ENQUEUED_TOTAL,
                    labels::SOURCE => SlotSource::Retry.as_str(),
                )
                .increment(1);
            }
            Err(e) => {
                self.bury(message, QUEUE_SEND_FAILED, &e.to_string()).await;
            }
        }
    }

    /// Performs one wire attempt and records everything it learns.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failures; wire failures classify into
    /// the returned [`DispatchOutcome`].
    pub async fn dispatch(
        &self,
        message: &DispatchMessage,
        attempt_no: u32,
    ) -> Result<DispatchOutcome> {
        let started_at = Utc::now();

        // The instance is loaded fresh: deregistration or a URL change
        // after enqueue must win over the message snapshot.
        let instance = self.store.get_instance(&message.instance_id).await?;
        let instance = instance.filter(|row| {
            row.status == InstanceStatus::Active && row.site_url.is_some()
        });
        let Some(instance) = instance else {
            self.store
                .record_delivery_attempt(&NewDeliveryAttempt {
                    delivery_id: message.delivery_id,
                    attempt_no,
                    started_at,
                    finished_at: Some(started_at),
                    duration_ms: None,
                    http_status: None,
                    timed_out: false,
                    error_code: Some(INSTANCE_NOT_ACTIVE.to_string()),
                    error_message: Some("instance missing, inactive, or without URL".to_string()),
                })
                .await?;
            self.store
                .mark_delivery_dead(
                    &message.delivery_id,
                    INSTANCE_NOT_ACTIVE,
                    "instance missing, inactive, or without URL",
                    started_at,
                )
                .await?;
            return Ok(DispatchOutcome::Drop);
        };
        let site_url = instance.site_url.as_deref().unwrap_or_default();

        let token = match self.keyring.mint_trigger_token(
            &self.config.issuer,
            &self.config.audience,
            &instance.site_id,
            &message.delivery_id.to_string(),
            started_at,
        ) {
            Ok(token) => token,
            Err(e) => {
                self.store
                    .record_delivery_attempt(&NewDeliveryAttempt {
                        delivery_id: message.delivery_id,
                        attempt_no,
                        started_at,
                        finished_at: Some(started_at),
                        duration_ms: None,
                        http_status: None,
                        timed_out: false,
                        error_code: Some(TOKEN_SIGN_FAILED.to_string()),
                        error_message: Some(e.to_string()),
                    })
                    .await?;
                self.store
                    .mark_delivery_failed(
                        &message.delivery_id,
                        attempt_no,
                        TOKEN_SIGN_FAILED,
                        &e.to_string(),
                        None,
                    )
                    .await?;
                return Ok(DispatchOutcome::Retry);
            }
        };

        let request = TriggerRequest::new(
            &message.delivery_id.to_string(),
            &instance.site_id,
            started_at,
        );
        let timer = Instant::now();
        let result = self.trigger.trigger(site_url, &token.token, &request).await;
        let finished_at = Utc::now();
        let duration_ms = i64::try_from(timer.elapsed().as_millis()).unwrap_or(i64::MAX);
        histogram!(names::DISPATCH_DURATION_SECONDS).record(timer.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                let telemetry = parse_telemetry(
                    &response.body,
                    finished_at,
                    self.config.telemetry_raw_max_bytes,
                );

                self.store
                    .record_delivery_attempt(&NewDeliveryAttempt {
                        delivery_id: message.delivery_id,
                        attempt_no,
                        started_at,
                        finished_at: Some(finished_at),
                        duration_ms: Some(duration_ms),
                        http_status: Some(response.status),
                        timed_out: false,
                        error_code: None,
                        error_message: None,
                    })
                    .await?;

                if (200..300).contains(&response.status) && telemetry.accepted {
                    self.store
                        .mark_delivery_delivered(
                            &message.delivery_id,
                            attempt_no,
                            response.status,
                            telemetry.accepted,
                            telemetry.dedup_hit,
                            finished_at,
                        )
                        .await?;
                    self.store
                        .insert_telemetry_sample(&NewTelemetrySample {
                            delivery_id: message.delivery_id,
                            instance_id: instance.instance_id,
                            collected_at: telemetry.collected_at,
                            schema_ver: telemetry.schema_ver,
                            accepted: telemetry.accepted,
                            dedup_hit: telemetry.dedup_hit,
                            verify_ms: telemetry.verify_ms,
                            items_checked: telemetry.items_checked,
                            items_failed: telemetry.items_failed,
                            total_ms: telemetry.total_ms,
                            app_version: telemetry.app_version.clone(),
                            error_code: telemetry.error_code.clone(),
                            raw_json: telemetry.raw_json.clone(),
                        })
                        .await?;
                    self.store
                        .record_instance_success(&instance.instance_id, finished_at)
                        .await?;
                    Ok(DispatchOutcome::Success)
                } else {
                    let error_message =
                        format!("HTTP {}, accepted={}", response.status, telemetry.accepted);
                    self.store
                        .mark_delivery_failed(
                            &message.delivery_id,
                            attempt_no,
                            UNACCEPTED_RESPONSE,
                            &error_message,
                            Some(response.status),
                        )
                        .await?;
                    Ok(DispatchOutcome::Retry)
                }
            }
            Err(wire_error) => {
                let (error_code, timed_out) = match &wire_error {
                    TriggerError::Timeout => (REQUEST_TIMEOUT, true),
                    TriggerError::Transport(_) => (REQUEST_FAILED, false),
                };
                self.store
                    .record_delivery_attempt(&NewDeliveryAttempt {
                        delivery_id: message.delivery_id,
                        attempt_no,
                        started_at,
                        finished_at: Some(finished_at),
                        duration_ms: Some(duration_ms),
                        http_status: None,
                        timed_out,
                        error_code: Some(error_code.to_string()),
                        error_message: Some(wire_error.to_string()),
                    })
                    .await?;
                self.store
                    .mark_delivery_failed(
                        &message.delivery_id,
                        attempt_no,
                        error_code,
                        &wire_error.to_string(),
                        None,
                    )
                    .await?;
                Ok(DispatchOutcome::Retry)
            }
        }
    }

    /// Handles one dead-letter message: bury the delivery, always ACK.
    async fn handle_dead_letter(&self, message: &QueueMessage) {
        let Ok(parsed) = DispatchMessage::from_json(&message.body) else {
            tracing::warn!(message_id = %message.id,
                "unparseable dead-letter payload acked without store write");
            return;
        };
        self.bury(&parsed, DLQ_REACHED, "delivery surfaced on the dead-letter queue")
            .await;
    }

    /// Marks a delivery dead and counts it.
    async fn bury(&self, message: &DispatchMessage, code: &'static str, detail: &str) {
        if let Err(e) = self
            .store
            .mark_delivery_dead(&message.delivery_id, code, detail, Utc::now())
            .await
        {
            tracing::error!(delivery_id = %message.delivery_id, error = %e,
                "failed to bury delivery");
            return;
        }
        counter!(names::DEAD_LETTERS_TOTAL, labels::CODE => code).increment(1);
        tracing::warn!(delivery_id = %message.delivery_id, code = code, "delivery buried");
    }

    /// Returns the delivery status after processing (test helper).
    ///
    /// # Errors
    ///
    /// Returns an error when the lookup fails.
    pub async fn delivery_status(
        &self,
        delivery_id: &pulse_core::DeliveryId,
    ) -> Result<Option<DeliveryStatus>> {
        Ok(self
            .store
            .get_delivery(delivery_id)
            .await?
            .map(|row| row.status))
    }
}
