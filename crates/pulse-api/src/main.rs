//! `pulse-api` binary entrypoint.
//!
//! Loads configuration from environment variables, opens the store, and
//! runs three cooperating tasks: the HTTP server, the minute-granularity
//! scheduler tick, and the queue-consumer poll loop.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use pulse_api::config::Config;
use pulse_api::server::{AppState, Server};
use pulse_core::jwks::validate_jwks_json;
use pulse_core::observability::{LogFormat, init_logging};
use pulse_flow::consumer::QueueConsumer;
use pulse_flow::queue::DispatchQueue;
use pulse_flow::queue::memory::InMemoryDispatchQueue;
use pulse_flow::scheduler::Scheduler;
use pulse_flow::trigger::HttpTriggerClient;
use pulse_store::{PulseStore, SigningKeyStatus};

const DISPATCH_QUEUE_NAME: &str = "pulse-dispatch";
const DEAD_LETTER_QUEUE_NAME: &str = "pulse-dispatch-dlq";
const CONSUMER_BATCH_SIZE: usize = 32;

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

/// Projects the published JWKS into signing-key rows: the active kid stays
/// `active`, every other published key is in its verification grace period.
async fn seed_signing_keys(store: &PulseStore, state: &AppState) -> Result<()> {
    let jwks = validate_jwks_json(&state.config.jwks_json)?;
    let now = Utc::now();

    if let Some(keys) = jwks.get("keys").and_then(serde_json::Value::as_array) {
        for entry in keys {
            let Some(kid) = entry.get("kid").and_then(serde_json::Value::as_str) else {
                continue;
            };
            let status = if kid == state.keyring.active_kid() {
                SigningKeyStatus::Active
            } else {
                SigningKeyStatus::Grace
            };
            store
                .upsert_signing_key(kid, status, &entry.to_string(), now)
                .await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(choose_log_format(&config));

    let store = if let Some(path) = config.db_path.as_deref() {
        tracing::info!(path = path, "opening sqlite store");
        PulseStore::open(path).await?
    } else {
        if !config.debug {
            anyhow::bail!("PULSE_DB_PATH is required when PULSE_DEBUG=false");
        }
        tracing::warn!("PULSE_DB_PATH not set; using in-memory store (debug only)");
        PulseStore::open_in_memory().await?
    };

    let state = AppState::new(store.clone(), config)?;
    seed_signing_keys(&store, &state).await?;

    let queue = Arc::new(InMemoryDispatchQueue::new(DISPATCH_QUEUE_NAME));
    let dead_letters = Arc::new(InMemoryDispatchQueue::new(DEAD_LETTER_QUEUE_NAME));

    let trigger = Arc::new(HttpTriggerClient::new(
        state.config.trigger_path.clone(),
        state.config.request_timeout_ms,
    ));
    let consumer = Arc::new(QueueConsumer::new(
        store.clone(),
        Arc::clone(&queue) as Arc<dyn DispatchQueue>,
        trigger,
        Arc::clone(&state.keyring),
        state.config.consumer_config(),
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::clone(&queue) as Arc<dyn DispatchQueue>,
        state.config.scheduler_config(),
    );

    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(Duration::from_secs(60));
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticks.tick().await;
            if let Err(e) = scheduler.run_tick(Utc::now()).await {
                tracing::error!(error = %e, "scheduler tick failed");
            }
        }
    });

    {
        let queue = Arc::clone(&queue);
        let dead_letters = Arc::clone(&dead_letters);
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            let mut polls = tokio::time::interval(Duration::from_secs(1));
            loop {
                polls.tick().await;
                let now = Utc::now();
                for source in [&queue, &dead_letters] {
                    match source.receive_due(now, CONSUMER_BATCH_SIZE) {
                        Ok(batch) if !batch.is_empty() => {
                            consumer.handle_batch(source.queue_name(), &batch).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "queue receive failed");
                        }
                    }
                }
            }
        });
    }

    Server::new(state).serve().await?;
    Ok(())
}
