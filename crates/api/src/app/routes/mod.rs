use axum::{Router, routing::get};

pub mod enrich;
pub mod system;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/v1/enrich", enrich::router())
        .route("/v1/admin/stats", get(system::stats))
}
