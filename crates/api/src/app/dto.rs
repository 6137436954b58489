//! Request/response DTOs and JSON mapping helpers.

use serde::{Deserialize, Serialize};

use enrichd_infra::jobs::JobRecord;
use enrichd_infra::service::SubmitRequest;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitEnrichmentRequest {
    pub entity_id: String,
    /// `false` blocks the request (up to the configured wait) for a terminal
    /// result.
    #[serde(rename = "async", default = "default_async")]
    pub run_async: bool,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub force: bool,
    pub payload: Option<serde_json::Value>,
    /// Advisory only; lower values mean more urgent.
    #[serde(default)]
    pub priority: i32,
}

fn default_async() -> bool {
    true
}

impl SubmitEnrichmentRequest {
    pub fn into_submit(self) -> SubmitRequest {
        SubmitRequest {
            entity_id: self.entity_id,
            idempotency_key: self.idempotency_key,
            force: self.force,
            payload: self.payload,
            priority: self.priority,
        }
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job: JobRecord,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job: Option<JobRecord>,
}
