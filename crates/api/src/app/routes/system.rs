//! Health and operational endpoints.

use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::errors;
use crate::app::services::AppServices;

/// GET /health: aggregated dependency health, 503 when degraded.
pub async fn health(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let snapshot = services.enrichment.health();
    let status = if snapshot.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot)).into_response()
}

/// GET /v1/admin/stats: queue depth and per-status counts.
pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.enrichment.stats().await {
        Ok((queue_depth, counts)) => Json(serde_json::json!({
            "queueDepth": queue_depth,
            "statusCounts": counts,
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
