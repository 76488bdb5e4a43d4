use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};

use crate::error::{ApiError, AppError};
use crate::models::{RecommendRequest, RecommendResponse};

use super::{AppState, Tenant};

/// POST /v1/recommendations
pub async fn recommend(
    State(state): State<AppState>,
    tenant: Tenant,
    payload: Result<Json<RecommendRequest>, JsonRejection>,
) -> Result<Json<RecommendResponse>, ApiError> {
    let Json(mut request) =
        payload.map_err(|e| tenant.fail(AppError::InvalidRequest(e.body_text())))?;
    // Only offline tooling may evaluate in the past.
    request.as_of = None;

    let ctx = tenant.context(&state);
    let (response, summary) = state
        .engine
        .recommend(&ctx, &request)
        .await
        .map_err(|e| tenant.fail(e))?;

    tracing::info!(
        namespace = %request.namespace,
        items = response.items.len(),
        filtered = summary.constraint_filtered_count,
        "Served recommendations"
    );
    Ok(Json(response))
}
