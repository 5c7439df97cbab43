//! Instance registration endpoints: sync, deregister, status.
//!
//! All three are signed requests and serialize as
//! parse -> freshness -> load -> verify -> mutate -> respond. Sync pins the
//! instance's public key on first contact; every later request verifies
//! against the stored key, never the submitted one.

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use pulse_flow::scheduler::compute_next_run_at;
use pulse_store::build_events::fallback_idempotency_key;
use pulse_store::time::fmt_ts;
use pulse_store::{InstanceRow, InstanceStatus, InstanceSyncUpdate, NewInstance};
use pulse_core::InstanceId;

use crate::auth::{freshness_gate, verify_request};
use crate::error::{ApiError, ApiResult, Envelope, ok_response};
use crate::server::AppState;
use crate::site_url::normalize_site_url;

/// Route paths, shared with the router and the signature message.
pub const SYNC_PATH: &str = "/v1/instances/sync";
/// Deregister route path.
pub const DEREGISTER_PATH: &str = "/v1/instances/deregister";
/// Status route path.
pub const STATUS_PATH: &str = "/v1/instances/status";

/// Minutes in a day; assigned minutes live in `[0, 1439]`.
const MINUTES_PER_DAY: u16 = 1440;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    site_id: String,
    site_pub_key: String,
    #[serde(default)]
    site_key_alg: Option<String>,
    #[serde(default)]
    site_url: Option<String>,
    #[serde(default)]
    app_version: Option<String>,
    #[serde(default)]
    build_id: Option<String>,
    #[serde(default)]
    commit: Option<String>,
    #[serde(default)]
    built_at: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    minute_of_day: Option<i64>,
}

/// Sync response payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Generated instance identifier.
    pub instance_id: String,
    /// Resulting lifecycle status.
    pub status: String,
    /// Why the instance is not active, when it is not.
    pub pending_reason: Option<String>,
    /// Assigned daily trigger minute.
    pub minute_of_day: u16,
    /// Next scheduled trigger, when active.
    pub next_run_at: Option<String>,
    /// Which kid currently signs trigger tokens.
    pub cloud_active_kid: String,
    /// Server-side sync time.
    pub synced_at: String,
}

fn parse_body<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, ApiError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ApiError::bad_request(format!("invalid request payload: {e}")))
}

fn require_uuid(site_id: &str) -> Result<(), ApiError> {
    Uuid::parse_str(site_id)
        .map(|_| ())
        .map_err(|_| ApiError::bad_request("siteId must be a UUID"))
}

fn assign_minute_of_day() -> u16 {
    rand::thread_rng().gen_range(0..MINUTES_PER_DAY)
}

/// POST `/v1/instances/sync`.
pub async fn sync(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Envelope<SyncResponse>>> {
    let now = Utc::now();
    let request: SyncRequest = parse_body(&payload)?;
    require_uuid(&request.site_id)?;
    if request.site_pub_key.trim().is_empty() {
        return Err(ApiError::bad_request("sitePubKey is required"));
    }

    freshness_gate(&payload, now, state.config.signature_window_ms)?;

    let existing = state.store.find_instance_by_site_id(&request.site_id).await?;

    // Trust-on-first-use: a known instance is verified against its pinned
    // key, so knowing a siteId is not enough to rebind it.
    let key_material = existing
        .as_ref()
        .map_or(request.site_pub_key.as_str(), |row| row.site_pub_key.as_str());
    verify_request(
        key_material,
        "POST",
        SYNC_PATH,
        &payload,
        now,
        state.config.signature_window_ms,
    )?;

    let normalized = normalize_site_url(request.site_url.as_deref());
    let status = if normalized.pending_reason.is_some() {
        InstanceStatus::PendingUrl
    } else {
        InstanceStatus::Active
    };

    let (instance_id, minute_of_day, next_run_at) = match existing {
        Some(row) => {
            let next_run_at = if status == InstanceStatus::Active {
                Some(
                    row.next_run_at
                        .unwrap_or_else(|| compute_next_run_at(row.minute_of_day, now)),
                )
            } else {
                None
            };
            state
                .store
                .apply_sync_update(
                    &row.instance_id,
                    &InstanceSyncUpdate {
                        site_url: normalized.url.clone(),
                        status,
                        pending_reason: normalized.pending_reason.map(str::to_string),
                        next_run_at,
                        app_version: request.app_version.clone(),
                        build_id: request.build_id.clone(),
                        commit_sha: request.commit.clone(),
                        built_at: request.built_at.clone(),
                        now,
                    },
                )
                .await?;
            (row.instance_id, row.minute_of_day, next_run_at)
        }
        None => {
            // A minuteOfDay on the payload is honored only here, at first
            // registration; the assignment is permanent afterwards.
            let minute_of_day = request
                .minute_of_day
                .and_then(|m| u16::try_from(m).ok())
                .filter(|m| *m < MINUTES_PER_DAY)
                .unwrap_or_else(assign_minute_of_day);
            let next_run_at = (status == InstanceStatus::Active)
                .then(|| compute_next_run_at(minute_of_day, now));

            let new = NewInstance {
                instance_id: InstanceId::generate(),
                site_id: request.site_id.clone(),
                site_url: normalized.url.clone(),
                status,
                pending_reason: normalized.pending_reason.map(str::to_string),
                site_pub_key: request.site_pub_key.clone(),
                site_key_alg: request
                    .site_key_alg
                    .clone()
                    .unwrap_or_else(|| "ed25519".to_string()),
                minute_of_day,
                next_run_at,
                app_version: request.app_version.clone(),
                build_id: request.build_id.clone(),
                commit_sha: request.commit.clone(),
                built_at: request.built_at.clone(),
                now,
            };
            state.store.insert_instance(&new).await?;
            (new.instance_id, minute_of_day, next_run_at)
        }
    };

    let idempotency_key = request
        .idempotency_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .unwrap_or_else(|| {
            fallback_idempotency_key(
                &request.site_id,
                request.build_id.as_deref(),
                request.built_at.as_deref().unwrap_or_default(),
            )
        });
    state
        .store
        .record_build_event(
            &instance_id,
            &idempotency_key,
            request.app_version.as_deref(),
            request.build_id.as_deref(),
            request.commit.as_deref(),
            request.built_at.as_deref(),
            now,
        )
        .await?;

    tracing::info!(
        site_id = %request.site_id,
        instance_id = %instance_id,
        status = status.as_str(),
        "instance sync"
    );

    Ok(ok_response(SyncResponse {
        instance_id: instance_id.to_string(),
        status: status.as_str().to_string(),
        pending_reason: normalized.pending_reason.map(str::to_string),
        minute_of_day,
        next_run_at: next_run_at.map(fmt_ts),
        cloud_active_kid: state.keyring.active_kid().to_string(),
        synced_at: fmt_ts(now),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeregisterRequest {
    site_id: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    requested_at: Option<String>,
}

/// Deregister response payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterResponse {
    /// Instance identifier.
    pub instance_id: String,
    /// Always `disabled`.
    pub status: String,
    /// Server-side processing time.
    pub deregistered_at: String,
}

/// POST `/v1/instances/deregister`.
pub async fn deregister(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Envelope<DeregisterResponse>>> {
    let now = Utc::now();
    let request: DeregisterRequest = parse_body(&payload)?;
    require_uuid(&request.site_id)?;

    freshness_gate(&payload, now, state.config.signature_window_ms)?;

    let row = state
        .store
        .find_instance_by_site_id(&request.site_id)
        .await?
        .ok_or_else(ApiError::instance_not_found)?;

    verify_request(
        &row.site_pub_key,
        "POST",
        DEREGISTER_PATH,
        &payload,
        now,
        state.config.signature_window_ms,
    )?;

    let reason = request
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("deregistered");
    state
        .store
        .disable_instance(&row.instance_id, reason, now)
        .await?;

    tracing::info!(
        site_id = %request.site_id,
        instance_id = %row.instance_id,
        reason = reason,
        "instance deregistered"
    );

    Ok(ok_response(DeregisterResponse {
        instance_id: row.instance_id.to_string(),
        status: InstanceStatus::Disabled.as_str().to_string(),
        deregistered_at: fmt_ts(now),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusRequest {
    site_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    requested_at: Option<String>,
}

/// Status projection payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Instance identifier.
    pub instance_id: String,
    /// Site UUID.
    pub site_id: String,
    /// Lifecycle status.
    pub status: String,
    /// Why the instance is not active, when it is not.
    pub pending_reason: Option<String>,
    /// Normalized site origin.
    pub site_url: Option<String>,
    /// Assigned daily trigger minute.
    pub minute_of_day: u16,
    /// Next scheduled trigger.
    pub next_run_at: Option<String>,
    /// Last successful signed request.
    pub last_seen_at: Option<String>,
    /// Last successful delivery.
    pub last_success_at: Option<String>,
    /// Reported application version.
    pub app_version: Option<String>,
}

impl StatusResponse {
    fn project(row: &InstanceRow) -> Self {
        Self {
            instance_id: row.instance_id.to_string(),
            site_id: row.site_id.clone(),
            status: row.status.as_str().to_string(),
            pending_reason: row.pending_reason.clone(),
            site_url: row.site_url.clone(),
            minute_of_day: row.minute_of_day,
            next_run_at: row.next_run_at.map(fmt_ts),
            last_seen_at: row.last_seen_at.map(fmt_ts),
            last_success_at: row.last_success_at.map(fmt_ts),
            app_version: row.app_version.clone(),
        }
    }
}

/// POST `/v1/instances/status`.
pub async fn status(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Envelope<StatusResponse>>> {
    let now = Utc::now();
    let request: StatusRequest = parse_body(&payload)?;
    require_uuid(&request.site_id)?;

    freshness_gate(&payload, now, state.config.signature_window_ms)?;

    let row = state
        .store
        .find_instance_by_site_id(&request.site_id)
        .await?
        .ok_or_else(ApiError::instance_not_found)?;

    verify_request(
        &row.site_pub_key,
        "POST",
        STATUS_PATH,
        &payload,
        now,
        state.config.signature_window_ms,
    )?;

    Ok(ok_response(StatusResponse::project(&row)))
}
