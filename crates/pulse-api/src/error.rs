//! API error types, the wire envelope, and HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Success envelope: `{ok: true, data}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    /// Always true on the success path.
    pub ok: bool,
    /// Endpoint-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Wraps a payload in the success envelope.
pub fn ok_response<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        ok: true,
        data: Some(data),
    })
}

/// Error body nested under `error`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    ok: bool,
    error: ErrorBody,
}

/// HTTP API error with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// 400: schema or field validation failed.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// 401: the signature timestamp fell outside the freshness window.
    #[must_use]
    pub fn signature_timestamp_expired() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "SIGNATURE_TIMESTAMP_EXPIRED",
            "signature timestamp outside freshness window",
        )
    }

    /// 401: cryptographic verification failed.
    pub fn invalid_signature(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE", message)
    }

    /// 404: no instance registered under the given site id.
    #[must_use]
    pub fn instance_not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "INSTANCE_NOT_FOUND",
            "no instance registered for this siteId",
        )
    }

    /// 404: unknown route.
    #[must_use]
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", "no such route")
    }

    /// 500: the configured JWKS failed structural validation.
    pub fn jwks_parse_error(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "JWKS_PARSE_ERROR",
            message,
        )
    }

    /// 500: anything the handlers did not anticipate.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            message,
        )
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorEnvelope {
                ok: false,
                error: ErrorBody {
                    code: self.code.to_string(),
                    message: self.message,
                },
            }),
        )
            .into_response()
    }
}

impl From<pulse_store::StoreError> for ApiError {
    fn from(value: pulse_store::StoreError) -> Self {
        Self::internal(value.to_string())
    }
}
