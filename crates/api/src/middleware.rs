//! Caller-context middleware.
//!
//! Identity and tenant resolution happen upstream (gateway); this middleware
//! only materializes the headers that contract populates into a
//! [`CallerContext`] request extension. Requests without a valid tenant are
//! rejected before reaching any handler.

use std::str::FromStr;

use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use enrichd_core::{CorrelationId, TenantId};
use enrichd_infra::service::CallerContext;

/// Header carrying the caller's tenant id (UUID).
pub const TENANT_HEADER: &str = "x-tenant-id";
/// Optional header carrying an upstream correlation id (UUID); one is minted
/// when absent so every job is traceable.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

pub async fn context_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let context = extract_context(req.headers())?;
    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

fn extract_context(headers: &HeaderMap) -> Result<CallerContext, StatusCode> {
    let tenant_raw = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let tenant_id = TenantId::from_str(tenant_raw.trim()).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| CorrelationId::from_str(v.trim()).ok())
        .unwrap_or_default();

    Ok(CallerContext {
        tenant_id,
        correlation_id,
    })
}
