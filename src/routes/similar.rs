use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::error::{ApiError, AppError};
use crate::models::{RecommendResponse, SimilarRequest};

use super::{AppState, Tenant};

const DEFAULT_K: i64 = 20;

#[derive(Debug, Deserialize)]
pub struct SimilarQuery {
    pub k: Option<i64>,
    #[serde(default)]
    pub namespace: String,
    pub surface: Option<String>,
    #[serde(default)]
    pub include_reasons: bool,
}

/// GET /v1/items/:item_id/similar
pub async fn similar(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(item_id): Path<String>,
    query: Result<Query<SimilarQuery>, QueryRejection>,
) -> Result<Json<RecommendResponse>, ApiError> {
    let Query(query) = query.map_err(|e| tenant.fail(AppError::InvalidRequest(e.body_text())))?;
    let request = SimilarRequest {
        item_id,
        namespace: query.namespace,
        surface: query.surface,
        k: query.k.unwrap_or(DEFAULT_K),
        include_reasons: query.include_reasons,
    };

    let ctx = tenant.context(&state);
    let (response, _) = state
        .engine
        .similar(&ctx, &request)
        .await
        .map_err(|e| tenant.fail(e))?;
    Ok(Json(response))
}
