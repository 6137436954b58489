//! Redis-backed job store (durable across process restarts, TTL-bounded).
//!
//! ## Key layout
//!
//! - `enrich:job:<id>`: hash with `data` (JSON record) and `attempts`
//!   (atomic counter) fields, expiring after the retention window
//! - `enrich:dedupe:<hash>`: dedupe key to job id, expiring after the
//!   dedupe TTL
//! - `enrich:queue`: work queue list (RPUSH/BLPOP)
//! - `enrich:counts`: per-status counters hash (HINCRBY)
//!
//! Counter swaps on status updates are two HINCRBYs, approximately
//! consistent, which is all the contract asks for. The dedupe write is a
//! plain SET: concurrent identical submissions race last-writer-wins onto a
//! key that is only ever set once per unique payload-hash-plus-time.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::warn;

use super::store::{JobStore, JobStoreError, QueueConsumer, StatusChange, StatusCounts};
use super::types::{JobId, JobRecord, JobStatus, NewJob};

const KEY_QUEUE: &str = "enrich:queue";
const KEY_COUNTS: &str = "enrich:counts";
const FIELD_DATA: &str = "data";
const FIELD_ATTEMPTS: &str = "attempts";

fn job_key(job_id: JobId) -> String {
    format!("enrich:job:{job_id}")
}

fn dedupe_slot(hash: &str) -> String {
    format!("enrich:dedupe:{hash}")
}

/// Redis-backed [`JobStore`].
#[derive(Clone)]
pub struct RedisJobStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    retention: Duration,
    dedupe_ttl: Duration,
}

impl RedisJobStore {
    /// Connect and hold one multiplexed connection for regular operations.
    /// Queue consumers get their own dedicated connections (blocking pops
    /// must not starve the shared one).
    pub async fn connect(
        url: &str,
        retention: Duration,
        dedupe_ttl: Duration,
    ) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| JobStoreError::Backend(format!("redis open: {e}")))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| JobStoreError::Backend(format!("redis connect: {e}")))?;
        Ok(Self {
            client,
            conn,
            retention,
            dedupe_ttl,
        })
    }

    async fn write_record(
        &self,
        conn: &mut MultiplexedConnection,
        record: &JobRecord,
    ) -> Result<(), JobStoreError> {
        let data = serde_json::to_string(record)
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        let key = job_key(record.job_id);
        let _: () = conn
            .hset(&key, FIELD_DATA, data)
            .await
            .map_err(backend_err)?;
        let _: () = conn
            .expire(&key, self.retention.as_secs() as i64)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn read_record(
        &self,
        conn: &mut MultiplexedConnection,
        job_id: JobId,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let fields: HashMap<String, String> =
            conn.hgetall(job_key(job_id)).await.map_err(backend_err)?;
        let Some(data) = fields.get(FIELD_DATA) else {
            return Ok(None);
        };
        let mut record: JobRecord = serde_json::from_str(data)
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        // The attempt counter is bumped out-of-band (HINCRBY); the hash field
        // is authoritative over the serialized snapshot.
        if let Some(attempts) = fields.get(FIELD_ATTEMPTS).and_then(|v| v.parse().ok()) {
            record.attempt_count = attempts;
        }
        Ok(Some(record))
    }
}

fn backend_err(e: redis::RedisError) -> JobStoreError {
    JobStoreError::Backend(e.to_string())
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create_job(&self, new: NewJob) -> Result<(JobRecord, bool), JobStoreError> {
        let mut conn = self.conn.clone();
        let key = new.dedupe_key();

        if !new.force {
            let existing: Option<String> =
                conn.get(dedupe_slot(&key)).await.map_err(backend_err)?;
            if let Some(raw_id) = existing {
                match JobId::from_str(&raw_id) {
                    Ok(job_id) => {
                        if let Some(record) = self.read_record(&mut conn, job_id).await? {
                            let _: i64 = conn
                                .hincr(KEY_COUNTS, "dedupe_hits", 1)
                                .await
                                .map_err(backend_err)?;
                            return Ok((record, false));
                        }
                    }
                    Err(_) => {
                        warn!(dedupe_key = %key, "dropping malformed dedupe entry");
                    }
                }
            }
        }

        let record = JobRecord::from_new(&new);
        let _: () = conn
            .set_ex(
                dedupe_slot(&key),
                record.job_id.to_string(),
                self.dedupe_ttl.as_secs(),
            )
            .await
            .map_err(backend_err)?;
        self.write_record(&mut conn, &record).await?;
        let _: () = conn
            .hset(job_key(record.job_id), FIELD_ATTEMPTS, 0)
            .await
            .map_err(backend_err)?;
        let _: i64 = conn
            .hincr(KEY_COUNTS, JobStatus::Queued.as_str(), 1)
            .await
            .map_err(backend_err)?;

        Ok((record, true))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let mut conn = self.conn.clone();
        self.read_record(&mut conn, job_id).await
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        change: StatusChange,
    ) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let mut record = self
            .read_record(&mut conn, job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let previous = record.status;
        record.status = status;
        record.updated_at = chrono::Utc::now();
        if let Some(error) = change.error {
            record.error = Some(error);
        }
        if let Some(result) = change.result {
            record.result = Some(result);
        }
        self.write_record(&mut conn, &record).await?;

        let _: i64 = conn
            .hincr(KEY_COUNTS, previous.as_str(), -1)
            .await
            .map_err(backend_err)?;
        let _: i64 = conn
            .hincr(KEY_COUNTS, status.as_str(), 1)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn push_queue(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .rpush(KEY_QUEUE, job_id.to_string())
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn queue_consumer(&self) -> Result<Box<dyn QueueConsumer>, JobStoreError> {
        // Dedicated connection per consumer: BLPOP parks the connection.
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| JobStoreError::Backend(format!("redis consumer connect: {e}")))?;
        Ok(Box::new(RedisQueueConsumer { conn }))
    }

    async fn increment_attempt(&self, job_id: JobId) -> Result<u32, JobStoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn
            .hincr(job_key(job_id), FIELD_ATTEMPTS, 1)
            .await
            .map_err(backend_err)?;
        Ok(count.max(0) as u32)
    }

    async fn queue_depth(&self) -> Result<u64, JobStoreError> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(KEY_QUEUE).await.map_err(backend_err)?;
        Ok(len.max(0) as u64)
    }

    async fn status_counts(&self) -> Result<StatusCounts, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, i64> = conn.hgetall(KEY_COUNTS).await.map_err(backend_err)?;
        let read = |field: &str| raw.get(field).copied().unwrap_or(0).max(0) as u64;
        Ok(StatusCounts {
            queued: read("queued"),
            processing: read("processing"),
            completed: read("completed"),
            failed: read("failed"),
            dedupe_hits: read("dedupe_hits"),
        })
    }
}

struct RedisQueueConsumer {
    conn: MultiplexedConnection,
}

#[async_trait]
impl QueueConsumer for RedisQueueConsumer {
    async fn pop(&mut self, timeout: Duration) -> Result<Option<JobId>, JobStoreError> {
        let popped: Option<(String, String)> = self
            .conn
            .blpop(KEY_QUEUE, timeout.as_secs_f64())
            .await
            .map_err(backend_err)?;
        match popped {
            Some((_, raw_id)) => JobId::from_str(&raw_id)
                .map(Some)
                .map_err(|e| JobStoreError::Serialization(format!("queue entry: {e}"))),
            None => Ok(None),
        }
    }
}
