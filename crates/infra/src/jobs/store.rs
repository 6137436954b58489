//! Job storage: durable (TTL-bounded) records, dedupe index, work queue.
//!
//! The store holds no business logic, just CRUD plus atomic counters. All
//! lifecycle decisions live in the worker pool and the façade.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use super::types::{EnrichmentResult, JobId, JobRecord, JobStatus, NewJob};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Terminal data applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    pub error: Option<String>,
    pub result: Option<EnrichmentResult>,
}

impl StatusChange {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            result: None,
        }
    }

    pub fn completed(result: EnrichmentResult) -> Self {
        Self {
            error: None,
            result: Some(result),
        }
    }
}

/// Approximate per-status job counts plus the dedupe-hit counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dedupe_hits: u64,
}

/// Storage abstraction for job records, dedupe index, and the work queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job, or return the active duplicate when `force` is false and
    /// an unexpired dedupe entry exists. The boolean is `true` when a new job
    /// was created.
    async fn create_job(&self, new: NewJob) -> Result<(JobRecord, bool), JobStoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Apply a status transition, swapping the per-status counters.
    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        change: StatusChange,
    ) -> Result<(), JobStoreError>;

    async fn push_queue(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// One consumer per worker loop; each queued id is handed to exactly one
    /// consumer. The persistent store gives each consumer a dedicated
    /// connection so blocking pops cannot starve other operations.
    async fn queue_consumer(&self) -> Result<Box<dyn QueueConsumer>, JobStoreError>;

    /// Bump the attempt counter, returning the new count.
    async fn increment_attempt(&self, job_id: JobId) -> Result<u32, JobStoreError>;

    async fn queue_depth(&self) -> Result<u64, JobStoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, JobStoreError>;
}

/// A worker loop's handle onto the shared queue.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Bounded blocking pop: returns `None` on timeout so the loop can
    /// re-check its shutdown flag.
    async fn pop(&mut self, timeout: Duration) -> Result<Option<JobId>, JobStoreError>;
}

struct StoredJob {
    record: JobRecord,
    expires_at: Instant,
}

struct DedupeEntry {
    job_id: JobId,
    expires_at: Instant,
}

#[derive(Default)]
struct Counters {
    queued: i64,
    processing: i64,
    completed: i64,
    failed: i64,
}

impl Counters {
    fn slot(&mut self, status: JobStatus) -> &mut i64 {
        match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
        }
    }
}

struct MemoryState {
    jobs: HashMap<JobId, StoredJob>,
    dedupe: HashMap<String, DedupeEntry>,
    counters: Counters,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    queue: Mutex<VecDeque<JobId>>,
    queue_notify: Notify,
    dedupe_hits: AtomicU64,
    retention: Duration,
    dedupe_ttl: Duration,
}

/// In-memory job store for tests and single-process deployments.
#[derive(Clone)]
pub struct MemoryJobStore {
    inner: Arc<MemoryInner>,
}

impl MemoryJobStore {
    pub fn new(retention: Duration, dedupe_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState {
                    jobs: HashMap::new(),
                    dedupe: HashMap::new(),
                    counters: Counters::default(),
                }),
                queue: Mutex::new(VecDeque::new()),
                queue_notify: Notify::new(),
                dedupe_hits: AtomicU64::new(0),
                retention,
                dedupe_ttl,
            }),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), Duration::from_secs(600))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new: NewJob) -> Result<(JobRecord, bool), JobStoreError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().unwrap();

        if !new.force {
            let key = new.dedupe_key();
            let candidate = state
                .dedupe
                .get(&key)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.job_id);
            if let Some(job_id) = candidate {
                let existing = state
                    .jobs
                    .get(&job_id)
                    .filter(|stored| stored.expires_at > now)
                    .map(|stored| stored.record.clone());
                if let Some(record) = existing {
                    self.inner.dedupe_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((record, false));
                }
            }
        }

        let record = JobRecord::from_new(&new);
        state.dedupe.insert(
            record.dedupe_key.clone(),
            DedupeEntry {
                job_id: record.job_id,
                expires_at: now + self.inner.dedupe_ttl,
            },
        );
        state.jobs.insert(
            record.job_id,
            StoredJob {
                record: record.clone(),
                expires_at: now + self.inner.retention,
            },
        );
        state.counters.queued += 1;

        Ok((record, true))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().unwrap();

        let expired = match state.jobs.get(&job_id) {
            Some(stored) if stored.expires_at > now => return Ok(Some(stored.record.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.jobs.remove(&job_id);
        }
        Ok(None)
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        change: StatusChange,
    ) -> Result<(), JobStoreError> {
        let mut state = self.inner.state.lock().unwrap();
        let stored = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        let previous = stored.record.status;
        stored.record.status = status;
        stored.record.updated_at = Utc::now();
        if let Some(error) = change.error {
            stored.record.error = Some(error);
        }
        if let Some(result) = change.result {
            stored.record.result = Some(result);
        }

        *state.counters.slot(previous) -= 1;
        *state.counters.slot(status) += 1;
        Ok(())
    }

    async fn push_queue(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.inner.queue.lock().unwrap().push_back(job_id);
        self.inner.queue_notify.notify_one();
        Ok(())
    }

    async fn queue_consumer(&self) -> Result<Box<dyn QueueConsumer>, JobStoreError> {
        Ok(Box::new(MemoryQueueConsumer {
            inner: self.inner.clone(),
        }))
    }

    async fn increment_attempt(&self, job_id: JobId) -> Result<u32, JobStoreError> {
        let mut state = self.inner.state.lock().unwrap();
        let stored = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        stored.record.attempt_count += 1;
        stored.record.updated_at = Utc::now();
        Ok(stored.record.attempt_count)
    }

    async fn queue_depth(&self) -> Result<u64, JobStoreError> {
        Ok(self.inner.queue.lock().unwrap().len() as u64)
    }

    async fn status_counts(&self) -> Result<StatusCounts, JobStoreError> {
        let state = self.inner.state.lock().unwrap();
        let c = &state.counters;
        Ok(StatusCounts {
            queued: c.queued.max(0) as u64,
            processing: c.processing.max(0) as u64,
            completed: c.completed.max(0) as u64,
            failed: c.failed.max(0) as u64,
            dedupe_hits: self.inner.dedupe_hits.load(Ordering::Relaxed),
        })
    }
}

struct MemoryQueueConsumer {
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl QueueConsumer for MemoryQueueConsumer {
    async fn pop(&mut self, timeout: Duration) -> Result<Option<JobId>, JobStoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking the queue, so a push that
            // lands between the check and the await is not missed.
            let notified = self.inner.queue_notify.notified();

            if let Some(id) = self.inner.queue.lock().unwrap().pop_front() {
                // Wake the next waiter in case more items remain.
                self.inner.queue_notify.notify_one();
                return Ok(Some(id));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(self.inner.queue.lock().unwrap().pop_front());
            }
        }
    }
}
