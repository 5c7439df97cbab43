//! In-memory delayed queue.
//!
//! Backs the single-process daemon and the test suites. Messages become
//! visible once their due time passes; receiving removes them, which makes
//! the ACK implicit (the consumer drives retries by explicit re-enqueue, so
//! nothing else is needed).
//!
//! ## Limitations
//!
//! - **Single-process only**: no persistence, no cross-process visibility
//! - **No redelivery**: a crash between receive and state transition loses
//!   the message until maintenance or the next tick picks the delivery up

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ulid::Ulid;

use super::{DispatchMessage, DispatchQueue, EnqueueOptions, QueueMessage};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct DelayedEntry {
    message_id: String,
    due_at: DateTime<Utc>,
    body: String,
}

/// In-memory delayed dispatch queue.
#[derive(Debug)]
pub struct InMemoryDispatchQueue {
    name: String,
    entries: RwLock<Vec<DelayedEntry>>,
}

/// Converts a lock poison error to a queue error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("dispatch queue lock poisoned")
}

impl InMemoryDispatchQueue {
    /// Creates a new in-memory queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Receives up to `limit` messages whose delay has elapsed.
    ///
    /// Received messages are removed from the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn receive_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueMessage>> {
        let mut entries = self.entries.write().map_err(poison_err)?;

        let mut received = Vec::new();
        let mut remaining = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if received.len() < limit && entry.due_at <= now {
                received.push(QueueMessage {
                    id: entry.message_id,
                    body: entry.body,
                });
            } else {
                remaining.push(entry);
            }
        }
        *entries = remaining;
        Ok(received)
    }

    /// Places a raw body on the queue, bypassing [`DispatchMessage`]
    /// encoding. Used by tests to exercise invalid-payload handling.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn push_raw(&self, body: impl Into<String>, due_at: DateTime<Utc>) -> Result<String> {
        let message_id = Ulid::new().to_string();
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.push(DelayedEntry {
            message_id: message_id.clone(),
            due_at,
            body: body.into(),
        });
        Ok(message_id)
    }

    /// Returns the due time of every queued entry, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn due_times(&self) -> Result<Vec<DateTime<Utc>>> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.iter().map(|entry| entry.due_at).collect())
    }

    /// Clears the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.clear();
        Ok(())
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, message: DispatchMessage, options: EnqueueOptions) -> Result<String> {
        let body = message.to_json()?;
        let delay = options
            .delay
            .map(|d| Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)))
            .unwrap_or_else(Duration::zero);
        self.push_raw(body, Utc::now() + delay)
    }

    async fn queue_depth(&self) -> Result<usize> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.len())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{DeliveryId, InstanceId};
    use std::time::Duration as StdDuration;

    fn sample_message() -> DispatchMessage {
        DispatchMessage {
            delivery_id: DeliveryId::generate(),
            instance_id: InstanceId::generate(),
            site_id: "4f8a1c2e-0000-4000-8000-000000000001".to_string(),
            site_url: "https://site.test".to_string(),
            scheduled_for: Utc::now(),
            enqueued_at: Utc::now(),
            dispatch_attempt: 1,
        }
    }

    #[tokio::test]
    async fn immediate_message_is_received() {
        let queue = InMemoryDispatchQueue::new("pulse-dispatch");
        queue
            .enqueue(sample_message(), EnqueueOptions::default())
            .await
            .expect("enqueue");

        let received = queue.receive_due(Utc::now(), 10).expect("receive");
        assert_eq!(received.len(), 1);
        assert_eq!(queue.queue_depth().await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn delayed_message_stays_invisible_until_due() {
        let queue = InMemoryDispatchQueue::new("pulse-dispatch");
        queue
            .enqueue(
                sample_message(),
                EnqueueOptions::new().with_delay(StdDuration::from_secs(60)),
            )
            .await
            .expect("enqueue");

        let now = Utc::now();
        assert!(queue.receive_due(now, 10).expect("receive").is_empty());

        let later = now + Duration::seconds(61);
        let received = queue.receive_due(later, 10).expect("receive");
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn receive_honors_limit() {
        let queue = InMemoryDispatchQueue::new("pulse-dispatch");
        for _ in 0..3 {
            queue
                .enqueue(sample_message(), EnqueueOptions::default())
                .await
                .expect("enqueue");
        }

        let first = queue.receive_due(Utc::now(), 2).expect("receive");
        assert_eq!(first.len(), 2);
        let rest = queue.receive_due(Utc::now(), 2).expect("receive");
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn push_raw_supports_invalid_payloads() {
        let queue = InMemoryDispatchQueue::new("pulse-dispatch-dlq");
        queue.push_raw("{not json", Utc::now()).expect("push");

        let received = queue.receive_due(Utc::now(), 10).expect("receive");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "{not json");
    }

    #[test]
    fn queue_name_is_exposed() {
        let queue = InMemoryDispatchQueue::new("pulse-dispatch-dlq");
        assert_eq!(queue.queue_name(), "pulse-dispatch-dlq");
    }
}
