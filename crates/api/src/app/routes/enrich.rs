//! Enrichment submission and status endpoints.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use enrichd_infra::jobs::JobId;
use enrichd_infra::service::CallerContext;

use crate::app::dto::{JobResponse, JobStatusResponse, SubmitEnrichmentRequest};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/profile", post(submit_profile))
        .route("/status/:job_id", get(job_status))
}

/// POST /v1/enrich/profile
///
/// Accepts the job (202) or, when `async=false`, blocks up to the configured
/// wait and answers 200 with the terminal record.
pub async fn submit_profile(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallerContext>,
    Json(request): Json<SubmitEnrichmentRequest>,
) -> axum::response::Response {
    let run_async = request.run_async;

    let (job, _created) = match services.enrichment.submit(&ctx, request.into_submit()).await {
        Ok(accepted) => accepted,
        Err(e) => return errors::submit_error_to_response(e),
    };

    if run_async {
        return (StatusCode::ACCEPTED, Json(JobResponse { job })).into_response();
    }

    match services
        .enrichment
        .wait_for_completion(job.job_id, services.sync_wait)
        .await
    {
        Ok(Some(record)) if record.status.is_terminal() => {
            (StatusCode::OK, Json(JobResponse { job: record })).into_response()
        }
        // Timeout is a caller-visible state: answer with the latest known
        // record, still accepted.
        Ok(Some(record)) => (StatusCode::ACCEPTED, Json(JobResponse { job: record })).into_response(),
        Ok(None) => (StatusCode::ACCEPTED, Json(JobResponse { job })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /v1/enrich/status/:job_id
pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallerContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let Ok(job_id) = JobId::from_str(&job_id) else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_job_id",
            "job id must be a UUID",
        );
    };

    match services.enrichment.get_status(job_id).await {
        Ok(job) => {
            // Jobs are tenant-scoped; another tenant's job looks absent.
            let job = job.filter(|record| record.tenant_id == ctx.tenant_id);
            (StatusCode::OK, Json(JobStatusResponse { job })).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}
