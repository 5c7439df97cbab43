//! Unauthenticated system routes: banner, health, JWKS.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use pulse_core::jwks::{JWKS_CACHE_MAX_AGE_SECONDS, validate_jwks_json};

use crate::error::{ApiError, ApiResult, Envelope, ok_response};
use crate::server::AppState;

/// Service banner payload.
#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    /// Service name.
    pub service: &'static str,
    /// Crate version.
    pub version: &'static str,
}

/// GET `/`.
pub async fn root() -> Json<Envelope<ServiceInfo>> {
    ok_response(ServiceInfo {
        service: "pulse-cloud",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Health payload.
#[derive(Debug, Serialize)]
pub struct HealthData {
    /// Service status.
    pub status: &'static str,
}

/// GET `/v1/health`.
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<Envelope<HealthData>>> {
    state.store.health_check().await?;
    Ok(ok_response(HealthData { status: "ok" }))
}

/// GET `/.well-known/jwks.json`.
///
/// Serves the configured JWKS document verbatim after structural
/// validation; cacheable for five minutes.
pub async fn jwks(State(state): State<AppState>) -> Result<Response, ApiError> {
    validate_jwks_json(&state.config.jwks_json)
        .map_err(|e| ApiError::jwks_parse_error(e.to_string()))?;

    let mut response = state.config.jwks_json.clone().into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    let cache_control = format!("public, max-age={JWKS_CACHE_MAX_AGE_SECONDS}");
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(&cache_control)
            .unwrap_or_else(|_| HeaderValue::from_static("public, max-age=300")),
    );
    Ok(response)
}

/// Fallback for unknown routes.
pub async fn not_found() -> ApiError {
    ApiError::not_found()
}
