//! Core job types: the unit of work and its audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use enrichd_core::{CorrelationId, EntityId, TenantId, UntrustedDocument};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Job lifecycle status.
///
/// Transitions are monotonic and one-directional:
/// `queued → processing → {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting on the shared queue.
    Queued,
    /// Claimed by a worker loop.
    Processing,
    /// Transformation succeeded (embedding may still have been degraded).
    Completed,
    /// Transformation retries exhausted.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase durations in milliseconds for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDurations {
    pub queue: u64,
    pub transform: u64,
    pub embed: u64,
    pub total: u64,
}

/// Terminal payload attached to a completed (or failed) job.
///
/// `embedding_upserted == false` does NOT imply the job failed; embedding is
/// best-effort and additive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentResult {
    pub processing_time_seconds: f64,
    pub entity_snapshot: UntrustedDocument,
    pub embedding_upserted: bool,
    pub embedding_skipped_reason: Option<String>,
    pub model_version: Option<String>,
    pub prompt_version: Option<String>,
    pub phase_durations_ms: PhaseDurations,
    pub attempts: u32,
    pub queue_duration_ms: u64,
}

/// One request to enrich a single entity, tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    /// Tenant-qualified entity reference (`tenant:entity`).
    pub entity_document_id: String,
    pub dedupe_key: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    /// Advisory only; the queue stays FIFO.
    pub priority: i32,
    pub attempt_count: u32,
    pub error: Option<String>,
    pub result: Option<EnrichmentResult>,
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub idempotency_key: Option<String>,
    pub force: bool,
    pub payload: Value,
    pub correlation_id: CorrelationId,
    pub priority: i32,
}

impl NewJob {
    /// Dedupe key for this submission.
    pub fn dedupe_key(&self) -> String {
        dedupe_key(
            self.tenant_id,
            &self.entity_id,
            self.idempotency_key.as_deref(),
            &self.payload,
        )
    }
}

impl JobRecord {
    /// Build a fresh `queued` record from submission parameters.
    pub fn from_new(new: &NewJob) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            tenant_id: new.tenant_id,
            entity_id: new.entity_id.clone(),
            entity_document_id: new.entity_id.document_id(new.tenant_id),
            dedupe_key: new.dedupe_key(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            correlation_id: new.correlation_id,
            priority: new.priority,
            attempt_count: 0,
            error: None,
            result: None,
        }
    }
}

/// Deduplication key: SHA-256 over tenant, entity, and either the caller's
/// idempotency key or the canonical request payload.
pub fn dedupe_key(
    tenant_id: TenantId,
    entity_id: &EntityId,
    idempotency_key: Option<&str>,
    payload: &Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(entity_id.as_str().as_bytes());
    hasher.update(b"|");
    match idempotency_key {
        Some(key) => hasher.update(key.as_bytes()),
        // Canonical serialization: serde_json keeps object keys sorted, so
        // equal payloads hash equally regardless of construction order.
        None => hasher.update(payload.to_string().as_bytes()),
    }
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
