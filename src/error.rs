use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::db::StoreError;

/// Bugs detected by the engine's self-checks. Always surfaced as `internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
    LeakDetected,
    RuleInconsistency,
    KBoundViolation,
}

impl InvariantViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvariantViolation::LeakDetected => "leak_detected",
            InvariantViolation::RuleInconsistency => "rule_inconsistency",
            InvariantViolation::KBoundViolation => "k_bound_violation",
        }
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid blend weights: {0}")]
    InvalidBlend(String),

    #[error("Requested k={requested} exceeds the maximum of {max}")]
    LimitTooLarge { requested: i64, max: usize },

    #[error("Namespace is required")]
    MissingNamespace,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store failure: {0}")]
    StorePermanent(String),

    #[error("Request canceled")]
    Canceled,

    #[error("Invariant violated ({kind}): {message}")]
    Invariant {
        kind: InvariantViolation,
        message: String,
    },

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Canceled => AppError::Canceled,
            StoreError::Permanent(msg) => AppError::StorePermanent(msg),
            other => AppError::StoreUnavailable(other.to_string()),
        }
    }
}

impl AppError {
    /// Stable machine-readable code for the error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::InvalidBlend(_) => "invalid_blend",
            AppError::LimitTooLarge { .. } => "limit_too_large",
            AppError::MissingNamespace => "missing_namespace",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::StoreUnavailable(_) => "store_unavailable",
            AppError::StorePermanent(_) => "store_permanent",
            AppError::Canceled => "canceled",
            AppError::Invariant { .. } | AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_)
            | AppError::InvalidBlend(_)
            | AppError::LimitTooLarge { .. }
            | AppError::MissingNamespace => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Canceled => StatusCode::REQUEST_TIMEOUT,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::StorePermanent(_) | AppError::Invariant { .. } | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            AppError::LimitTooLarge { requested, max } => {
                Some(json!({ "requested": requested, "max": max }))
            }
            AppError::Invariant { kind, .. } => Some(json!({ "kind": kind.as_str() })),
            _ => None,
        }
    }

    pub fn with_correlation(self, correlation_id: impl Into<String>) -> ApiError {
        ApiError {
            error: self,
            correlation_id: correlation_id.into(),
        }
    }
}

/// An error bound to the request's correlation id, rendered as a problem body.
#[derive(Debug)]
pub struct ApiError {
    pub error: AppError,
    pub correlation_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();

        // Store and invariant failures keep their detail in the logs only.
        let message = match &self.error {
            AppError::StorePermanent(_) | AppError::Invariant { .. } | AppError::Internal(_) => {
                tracing::error!(
                    error = %self.error,
                    correlation_id = %self.correlation_id,
                    "Request failed"
                );
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": self.error.code(),
            "message": message,
            "correlation_id": self.correlation_id,
        });
        if let Some(details) = self.error.details() {
            body["details"] = details;
        }

        let mut response = (status, Json(body)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;
