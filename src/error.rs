//! Unified HTTP error type for axum request handlers.
//!
//! [`AppError`] carries one of the canonical machine-readable codes the
//! external interface promises (`policy_violation`, `rate_limit`,
//! `service_unavailable`, `upstream_unavailable`, `internal_error`) and
//! converts into the matching HTTP status and JSON body via
//! [`IntoResponse`]. Handlers return `Result<T, AppError>` and propagate
//! failures with `?`; anything that doesn't construct an [`AppError`]
//! explicitly falls through the blanket [`From`] impl and becomes
//! `internal_error`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// A typed gateway error with a stable machine code.
#[derive(Debug)]
pub enum AppError {
    /// The policy gate rejected the request. Not retried.
    PolicyViolation { category: String, description: String },
    /// The rate limiter rejected the request.
    RateLimit { message: String, wait_seconds: f64 },
    /// The kill switch is blocking all traffic.
    ServiceUnavailable { reason: String, retry_after_seconds: i64 },
    /// A backend could not be reached after retries.
    UpstreamUnavailable { message: String },
    /// Authentication failed.
    Unauthorized,
    /// Anything else — logged with full detail, shown generically to the caller.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::PolicyViolation { category, description } => {
                tracing::warn!(category = %category, "policy violation");
                (
                    StatusCode::FORBIDDEN,
                    json!({ "error": "policy_violation", "category": category, "message": description }),
                )
            }
            AppError::RateLimit { message, wait_seconds } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "rate_limit", "message": message, "retry_after": wait_seconds }),
            ),
            AppError::ServiceUnavailable { reason, retry_after_seconds } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "service_unavailable", "reason": reason, "retry_after": retry_after_seconds }),
            ),
            AppError::UpstreamUnavailable { message } => {
                tracing::warn!(message = %message, "upstream unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({ "error": "upstream_unavailable", "message": message }),
                )
            }
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "unauthorized", "message": "valid bearer token required" }),
            ),
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal_error", "message": e.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self::Internal(e.into())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::PolicyViolation { category, .. } => write!(f, "policy violation: {category}"),
            AppError::RateLimit { message, .. } => write!(f, "rate limit: {message}"),
            AppError::ServiceUnavailable { reason, .. } => write!(f, "service unavailable: {reason}"),
            AppError::UpstreamUnavailable { message } => write!(f, "upstream unavailable: {message}"),
            AppError::Unauthorized => write!(f, "unauthorized"),
            AppError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}
