//! Dispatch queue abstraction.
//!
//! This module provides:
//!
//! - [`DispatchMessage`]: the JSON wire payload for one queued dispatch
//! - [`DispatchQueue`]: trait for enqueueing messages with a delay
//! - [`InMemoryDispatchQueue`](memory::InMemoryDispatchQueue): delayed queue
//!   for tests and the single-process daemon
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: the broker only needs at-least-once delivery and
//!   per-message delay
//! - **Explicit retries**: the consumer never relies on broker-native retry;
//!   every retry is a fresh enqueue so backoff and minute-quota stay under
//!   the system's control
//! - **Dead-letter by name**: a queue whose name ends in `-dlq` is drained
//!   by the dead-letter path

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulse_core::{DeliveryId, InstanceId};

use crate::error::{Error, Result};

/// Suffix identifying dead-letter queues.
pub const DEAD_LETTER_SUFFIX: &str = "-dlq";

/// Returns whether a queue name designates a dead-letter queue.
#[must_use]
pub fn is_dead_letter_queue(name: &str) -> bool {
    name.ends_with(DEAD_LETTER_SUFFIX)
}

/// Wire payload for one queued dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    /// Delivery this message drives.
    pub delivery_id: DeliveryId,
    /// Target instance.
    pub instance_id: InstanceId,
    /// Site UUID, echoed to the instance.
    pub site_id: String,
    /// Site URL at enqueue time (dispatch re-reads the store for the
    /// current value).
    pub site_url: String,
    /// The minute the delivery was scheduled into.
    pub scheduled_for: DateTime<Utc>,
    /// When this message was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Attempt number this message represents (1-indexed).
    pub dispatch_attempt: u32,
}

impl DispatchMessage {
    /// Parses a message body, rejecting structurally valid payloads with an
    /// attempt number below 1.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] on malformed payloads.
    pub fn from_json(body: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(body)
            .map_err(|e| Error::serialization(format!("invalid dispatch message: {e}")))?;
        if message.dispatch_attempt < 1 {
            return Err(Error::serialization("dispatchAttempt must be at least 1"));
        }
        Ok(message)
    }

    /// Serializes the message body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization(format!("dispatch message encoding failed: {e}")))
    }

    /// Returns a shallow copy representing the next attempt.
    #[must_use]
    pub fn next_attempt(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.dispatch_attempt = self.dispatch_attempt + 1;
        next.enqueued_at = now;
        next
    }
}

/// Options for message enqueueing.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Delay before the message becomes visible to consumers.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay before the message becomes visible.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A raw message handed to the consumer by the broker.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Broker-assigned message id.
    pub id: String,
    /// JSON body.
    pub body: String,
}

/// Queue abstraction for dispatch messages.
///
/// Implementations may target a hosted broker or the in-memory queue. All
/// methods are `Send + Sync` to support concurrent access from scheduler
/// and consumer tasks.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Enqueues a message, returning the broker message id.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker rejects the message; the caller
    /// translates this into a `QUEUE_SEND_FAILED` delivery transition.
    async fn enqueue(&self, message: DispatchMessage, options: EnqueueOptions) -> Result<String>;

    /// Returns the approximate number of messages in the queue.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker cannot report depth.
    async fn queue_depth(&self) -> Result<usize>;

    /// Returns the queue's name.
    fn queue_name(&self) -> &str;
}
