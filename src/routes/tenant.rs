use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::{ApiError, AppError};
use crate::middleware::RequestId;

use super::AppState;

pub const ORG_ID_HEADER: &str = "x-org-id";

/// Tenant and correlation id resolved from request headers
#[derive(Debug, Clone)]
pub struct Tenant {
    pub org_id: Uuid,
    pub request_id: RequestId,
}

impl Tenant {
    /// A context bound to the server shutdown token and the request timeout
    pub fn context(&self, state: &AppState) -> RequestContext {
        RequestContext::new(self.org_id)
            .with_token(state.shutdown.child_token())
            .with_timeout(state.request_timeout)
    }

    pub fn fail(&self, error: AppError) -> ApiError {
        error.with_correlation(self.request_id.as_str())
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_default();

        let Some(raw) = parts.headers.get(ORG_ID_HEADER) else {
            return Err(AppError::Unauthorized("X-Org-ID header is required".to_string())
                .with_correlation(request_id.as_str()));
        };
        let org_id = raw
            .to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .ok_or_else(|| {
                AppError::InvalidRequest("X-Org-ID must be a UUID".to_string())
                    .with_correlation(request_id.as_str())
            })?;

        Ok(Self { org_id, request_id })
    }
}
