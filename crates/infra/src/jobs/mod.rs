//! Job persistence: types, store contract, and backends.

pub mod store;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use store::{
    JobStore, JobStoreError, MemoryJobStore, QueueConsumer, StatusChange, StatusCounts,
};
pub use types::{
    EnrichmentResult, JobId, JobRecord, JobStatus, NewJob, PhaseDurations, dedupe_key,
};

#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
