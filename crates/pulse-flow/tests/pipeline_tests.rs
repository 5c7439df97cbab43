//! End-to-end pipeline tests: tick scheduling, dispatch, retry ladder, and
//! dead-letter drain, against an in-memory store and queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};

use pulse_core::{DeliveryId, InstanceId, PrivateKeyRing};
use pulse_flow::consumer::{ConsumerConfig, QueueConsumer};
use pulse_flow::queue::memory::InMemoryDispatchQueue;
use pulse_flow::queue::{DispatchMessage, DispatchQueue, EnqueueOptions};
use pulse_flow::scheduler::{Scheduler, SchedulerConfig};
use pulse_flow::trigger::{TriggerClient, TriggerError, TriggerRequest, TriggerResponse};
use pulse_store::{DeliveryStatus, InstanceStatus, NewInstance, PulseStore};

fn test_keyring() -> Arc<PrivateKeyRing> {
    let signing = ed25519_signing_key();
    let d = base64_url(signing.to_bytes().as_slice());
    let x = base64_url(signing.verifying_key().as_bytes());
    let json = format!(
        r#"{{"keys":[{{"kty":"OKP","crv":"Ed25519","kid":"cloud-test","d":"{d}","x":"{x}"}}]}}"#
    );
    Arc::new(PrivateKeyRing::from_json(&json, None).expect("keyring"))
}

fn ed25519_signing_key() -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::from_bytes(&[5u8; 32])
}

fn base64_url(bytes: &[u8]) -> String {
    pulse_core::encoding::encode_base64_url(bytes)
}

async fn seeded_instance(
    store: &PulseStore,
    site_id: &str,
    next_run_at: DateTime<Utc>,
) -> InstanceId {
    let instance_id = InstanceId::generate();
    store
        .insert_instance(&NewInstance {
            instance_id,
            site_id: site_id.to_string(),
            site_url: Some("https://site.test".to_string()),
            status: InstanceStatus::Active,
            pending_reason: None,
            site_pub_key: "ignored-by-dispatch".to_string(),
            site_key_alg: "ed25519".to_string(),
            minute_of_day: 540,
            next_run_at: Some(next_run_at),
            app_version: None,
            build_id: None,
            commit_sha: None,
            built_at: None,
            now: next_run_at - Duration::days(1),
        })
        .await
        .expect("insert instance");
    instance_id
}

/// Stub transport that accepts every trigger.
struct AcceptingClient {
    calls: AtomicU32,
}

impl AcceptingClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl TriggerClient for AcceptingClient {
    async fn trigger(
        &self,
        _site_url: &str,
        _token: &str,
        _request: &TriggerRequest,
    ) -> Result<TriggerResponse, TriggerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TriggerResponse {
            status: 200,
            body: serde_json::json!({
                "data": {
                    "protocolVerification": {
                        "accepted": true,
                        "dedupHit": false,
                        "verifyMs": 120,
                        "itemsChecked": 8,
                        "itemsFailed": 0
                    },
                    "timings": {"totalMs": 200},
                    "instance": {"appVersion": "2.1.0"}
                }
            })
            .to_string(),
        })
    }
}

/// Stub transport that always times out.
struct HangingClient;

#[async_trait]
impl TriggerClient for HangingClient {
    async fn trigger(
        &self,
        _site_url: &str,
        _token: &str,
        _request: &TriggerRequest,
    ) -> Result<TriggerResponse, TriggerError> {
        Err(TriggerError::Timeout)
    }
}

fn consumer_with(
    store: &PulseStore,
    queue: &Arc<InMemoryDispatchQueue>,
    trigger: Arc<dyn TriggerClient>,
) -> QueueConsumer {
    QueueConsumer::new(
        store.clone(),
        Arc::clone(queue) as Arc<dyn DispatchQueue>,
        trigger,
        test_keyring(),
        ConsumerConfig::default(),
    )
}

async fn queued_message(
    store: &PulseStore,
    instance_id: InstanceId,
    site_id: &str,
    attempt: u32,
) -> DispatchMessage {
    let delivery_id = DeliveryId::generate();
    let now = Utc::now();
    store
        .create_delivery(&delivery_id, &instance_id, now, now)
        .await
        .expect("create delivery");
    DispatchMessage {
        delivery_id,
        instance_id,
        site_id: site_id.to_string(),
        site_url: "https://site.test".to_string(),
        scheduled_for: now,
        enqueued_at: now,
        dispatch_attempt: attempt,
    }
}

fn as_queue_message(message: &DispatchMessage) -> pulse_flow::queue::QueueMessage {
    pulse_flow::queue::QueueMessage {
        id: "m-1".to_string(),
        body: message.to_json().expect("encode"),
    }
}

#[tokio::test]
async fn tick_enqueues_one_delivery_and_spills_the_second_to_the_next_minute() {
    let store = PulseStore::open_in_memory().await.expect("open");
    let queue = Arc::new(InMemoryDispatchQueue::new("pulse-dispatch"));
    let tick_time = Utc.with_ymd_and_hms(2026, 8, 2, 9, 15, 5).unwrap();

    seeded_instance(&store, "4f8a1c2e-0000-4000-8000-000000000011", tick_time).await;
    seeded_instance(&store, "4f8a1c2e-0000-4000-8000-000000000012", tick_time).await;

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::clone(&queue) as Arc<dyn DispatchQueue>,
        SchedulerConfig {
            max_dispatch_per_minute: 1,
            ..SchedulerConfig::default()
        },
    );
    let outcome = scheduler.run_tick(tick_time).await.expect("tick");

    assert_eq!(outcome.enqueued, 2);
    assert_eq!(outcome.skipped_no_slot, 0);
    assert_eq!(queue.queue_depth().await.expect("depth"), 2);

    // First reservation lands on the tick minute, the second spills.
    let minute = Utc.with_ymd_and_hms(2026, 8, 2, 9, 15, 0).unwrap();
    let first = store.minute_load(minute).await.expect("load").expect("bucket");
    assert_eq!(first.total_count, 1);
    let second = store
        .minute_load(minute + Duration::minutes(1))
        .await
        .expect("load")
        .expect("bucket");
    assert_eq!(second.total_count, 1);
    assert_eq!(second.scheduled_count, 1);
}

#[tokio::test]
async fn tick_advances_next_run_to_the_assigned_minute() {
    let store = PulseStore::open_in_memory().await.expect("open");
    let queue = Arc::new(InMemoryDispatchQueue::new("pulse-dispatch"));
    let tick_time = Utc.with_ymd_and_hms(2026, 8, 2, 9, 15, 5).unwrap();

    let instance_id =
        seeded_instance(&store, "4f8a1c2e-0000-4000-8000-000000000013", tick_time).await;

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::clone(&queue) as Arc<dyn DispatchQueue>,
        SchedulerConfig::default(),
    );
    scheduler.run_tick(tick_time).await.expect("tick");

    let row = store
        .get_instance(&instance_id)
        .await
        .expect("get")
        .expect("exists");
    let next = row.next_run_at.expect("advanced");
    assert!(next > tick_time);
    // minute_of_day 540 = 09:00
    assert_eq!((next.hour(), next.minute()), (9, 0));

    // The instance is no longer due; a second tick finds nothing.
    let outcome = scheduler.run_tick(tick_time).await.expect("tick");
    assert_eq!(outcome.enqueued, 0);
    assert_eq!(outcome.scanned, 0);
}

#[tokio::test]
async fn full_window_defers_instances_without_advancing_them() {
    let store = PulseStore::open_in_memory().await.expect("open");
    let queue = Arc::new(InMemoryDispatchQueue::new("pulse-dispatch"));
    let tick_time = Utc.with_ymd_and_hms(2026, 8, 2, 9, 15, 5).unwrap();

    seeded_instance(&store, "4f8a1c2e-0000-4000-8000-000000000014", tick_time).await;
    seeded_instance(&store, "4f8a1c2e-0000-4000-8000-000000000015", tick_time).await;

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::clone(&queue) as Arc<dyn DispatchQueue>,
        SchedulerConfig {
            max_dispatch_per_minute: 1,
            slot_lookahead_minutes: 0,
            ..SchedulerConfig::default()
        },
    );
    let outcome = scheduler.run_tick(tick_time).await.expect("tick");

    assert_eq!(outcome.enqueued, 1);
    // The deferred instance is counted once per scan pass.
    assert!(outcome.skipped_no_slot >= 1);

    // The deferred instance is still due for the next tick.
    let due = store.due_instances(tick_time, 10).await.expect("scan");
    assert_eq!(due.len(), 1);
}

#[tokio::test]
async fn successful_dispatch_marks_delivered_and_records_telemetry() {
    let store = PulseStore::open_in_memory().await.expect("open");
    let queue = Arc::new(InMemoryDispatchQueue::new("pulse-dispatch"));
    let site_id = "4f8a1c2e-0000-4000-8000-000000000021";
    let instance_id = seeded_instance(&store, site_id, Utc::now()).await;

    let trigger = AcceptingClient::new();
    let consumer = consumer_with(&store, &queue, trigger.clone());
    let message = queued_message(&store, instance_id, site_id, 1).await;

    consumer
        .handle_batch("pulse-dispatch", &[as_queue_message(&message)])
        .await;

    assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);

    let delivery = store
        .get_delivery(&message.delivery_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.response_status, Some(200));
    assert_eq!(delivery.accepted, Some(true));
    assert!(delivery.completed_at.is_some());

    let sample = store
        .get_telemetry_sample(&message.delivery_id)
        .await
        .expect("get")
        .expect("sample");
    assert!(sample.accepted);
    assert_eq!(sample.verify_ms, Some(120));
    assert_eq!(sample.app_version.as_deref(), Some("2.1.0"));

    let instance = store
        .get_instance(&instance_id)
        .await
        .expect("get")
        .expect("exists");
    assert!(instance.last_success_at.is_some());

    // Nothing was re-enqueued.
    assert_eq!(queue.queue_depth().await.expect("depth"), 0);
}

#[tokio::test]
async fn timeout_schedules_a_backed_off_second_attempt() {
    let store = PulseStore::open_in_memory().await.expect("open");
    let queue = Arc::new(InMemoryDispatchQueue::new("pulse-dispatch"));
    let site_id = "4f8a1c2e-0000-4000-8000-000000000022";
    let instance_id = seeded_instance(&store, site_id, Utc::now()).await;

    let consumer = consumer_with(&store, &queue, Arc::new(HangingClient));
    let message = queued_message(&store, instance_id, site_id, 1).await;

    let before = Utc::now();
    consumer
        .handle_batch("pulse-dispatch", &[as_queue_message(&message)])
        .await;

    let delivery = store
        .get_delivery(&message.delivery_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.last_error_code.as_deref(), Some("REQUEST_TIMEOUT"));
    assert!(delivery.completed_at.is_none());

    let attempts = store
        .delivery_attempts(&message.delivery_id)
        .await
        .expect("attempts");
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].timed_out);

    // A copy with dispatchAttempt=2 is waiting, due roughly 30-90s out
    // (30s backoff, then up to a minute of bucket rounding).
    let due_times = queue.due_times().expect("due times");
    assert_eq!(due_times.len(), 1);
    let delay = due_times[0] - before;
    assert!(delay >= Duration::zero());
    assert!(delay <= Duration::seconds(90));

    let pending = queue
        .receive_due(before + Duration::minutes(2), 10)
        .expect("receive");
    assert_eq!(pending.len(), 1);
    let next = DispatchMessage::from_json(&pending[0].body).expect("decode");
    assert_eq!(next.dispatch_attempt, 2);
    assert_eq!(next.delivery_id, message.delivery_id);
}

#[tokio::test]
async fn final_attempt_timeout_buries_the_delivery() {
    let store = PulseStore::open_in_memory().await.expect("open");
    let queue = Arc::new(InMemoryDispatchQueue::new("pulse-dispatch"));
    let site_id = "4f8a1c2e-0000-4000-8000-000000000023";
    let instance_id = seeded_instance(&store, site_id, Utc::now()).await;

    let consumer = consumer_with(&store, &queue, Arc::new(HangingClient));
    let message = queued_message(&store, instance_id, site_id, 6).await;

    consumer
        .handle_batch("pulse-dispatch", &[as_queue_message(&message)])
        .await;

    let delivery = store
        .get_delivery(&message.delivery_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(delivery.status, DeliveryStatus::Dead);
    assert_eq!(
        delivery.last_error_code.as_deref(),
        Some("MAX_ATTEMPTS_EXCEEDED")
    );
    assert!(delivery.completed_at.is_some());

    // Burial ends the ladder: nothing re-enqueued.
    assert_eq!(queue.queue_depth().await.expect("depth"), 0);
}

#[tokio::test]
async fn missing_instance_drops_without_retry() {
    let store = PulseStore::open_in_memory().await.expect("open");
    let queue = Arc::new(InMemoryDispatchQueue::new("pulse-dispatch"));

    let consumer = consumer_with(&store, &queue, AcceptingClient::new());
    let delivery_id = DeliveryId::generate();
    let orphan_instance = InstanceId::generate();
    let now = Utc::now();
    store
        .create_delivery(&delivery_id, &orphan_instance, now, now)
        .await
        .expect("create");

    let message = DispatchMessage {
        delivery_id,
        instance_id: orphan_instance,
        site_id: "4f8a1c2e-0000-4000-8000-000000000024".to_string(),
        site_url: "https://site.test".to_string(),
        scheduled_for: now,
        enqueued_at: now,
        dispatch_attempt: 1,
    };
    consumer
        .handle_batch("pulse-dispatch", &[as_queue_message(&message)])
        .await;

    let delivery = store
        .get_delivery(&delivery_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(delivery.status, DeliveryStatus::Dead);
    assert_eq!(
        delivery.last_error_code.as_deref(),
        Some("INSTANCE_NOT_ACTIVE")
    );
    assert_eq!(queue.queue_depth().await.expect("depth"), 0);
}

#[tokio::test]
async fn dead_letter_drain_buries_and_acks() {
    let store = PulseStore::open_in_memory().await.expect("open");
    let dlq = Arc::new(InMemoryDispatchQueue::new("pulse-dispatch-dlq"));
    let site_id = "4f8a1c2e-0000-4000-8000-000000000025";
    let instance_id = seeded_instance(&store, site_id, Utc::now()).await;

    let consumer = consumer_with(&store, &dlq, AcceptingClient::new());
    let message = queued_message(&store, instance_id, site_id, 3).await;

    dlq.enqueue(message.clone(), EnqueueOptions::default())
        .await
        .expect("enqueue");
    let batch = dlq.receive_due(Utc::now(), 10).expect("receive");
    consumer.handle_batch("pulse-dispatch-dlq", &batch).await;

    let delivery = store
        .get_delivery(&message.delivery_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(delivery.status, DeliveryStatus::Dead);
    assert_eq!(delivery.last_error_code.as_deref(), Some("DLQ_REACHED"));
}

#[tokio::test]
async fn invalid_dead_letter_payload_is_acked_without_store_writes() {
    let store = PulseStore::open_in_memory().await.expect("open");
    let dlq = Arc::new(InMemoryDispatchQueue::new("pulse-dispatch-dlq"));
    let consumer = consumer_with(&store, &dlq, AcceptingClient::new());

    dlq.push_raw("{definitely not json", Utc::now()).expect("push");
    let batch = dlq.receive_due(Utc::now(), 10).expect("receive");
    consumer.handle_batch("pulse-dispatch-dlq", &batch).await;

    // Drained, nothing left, no panic.
    assert_eq!(dlq.queue_depth().await.expect("depth"), 0);
}
