//! Worker pool: N concurrent loops draining the shared job queue.
//!
//! Each loop owns one queue consumer and drives dequeued jobs through an
//! explicit state machine: `process_queued` (claim) → `process_transformed`
//! (subprocess with retries) → `finalize` (best-effort embedding + terminal
//! status). The queue primitive hands each id to exactly one loop, so no two
//! loops ever transition the same job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use enrichd_core::UntrustedDocument;
use enrichd_observability::metrics::EmbeddingOutcome;
use enrichd_observability::{LatencyWindow, MetricsSink};

use crate::embed::EmbeddingClient;
use crate::jobs::{
    EnrichmentResult, JobId, JobRecord, JobStatus, JobStore, PhaseDurations, QueueConsumer,
    StatusChange,
};
use crate::retry::{RetryPolicy, run_with_retry};
use crate::transform::Transformer;

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Bounded queue-pop wait; loops re-check the shutdown flag at this
    /// cadence.
    pub poll_timeout: Duration,
    /// Retry budget for the transformation phase.
    pub transform_retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_timeout: Duration::from_secs(1),
            transform_retry: RetryPolicy::default(),
        }
    }
}

/// Handle to a running pool; signals shutdown and joins the loops.
pub struct WorkerPoolHandle {
    shutdown: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for every loop to finish its
    /// current job. Loops notice the flag within one poll interval.
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// A job claimed off the queue, before transformation.
struct ClaimedJob {
    record: JobRecord,
    queue_ms: u64,
}

/// A job whose transformation succeeded, before finalization.
struct TransformedJob {
    record: JobRecord,
    queue_ms: u64,
    transform_ms: u64,
    attempts: u32,
    document: UntrustedDocument,
}

struct Shared {
    store: Arc<dyn JobStore>,
    transformer: Arc<dyn Transformer>,
    embedder: Arc<dyn EmbeddingClient>,
    metrics: Arc<dyn MetricsSink>,
    latency: LatencyWindow,
    config: WorkerPoolConfig,
}

/// The pool itself; [`WorkerPool::spawn`] starts the loops.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        transformer: Arc<dyn Transformer>,
        embedder: Arc<dyn EmbeddingClient>,
        metrics: Arc<dyn MetricsSink>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                transformer,
                embedder,
                metrics,
                latency: LatencyWindow::default(),
                config,
            }),
        }
    }

    /// Start the worker loops, each with its own queue consumer.
    pub async fn spawn(self) -> Result<WorkerPoolHandle, crate::jobs::JobStoreError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::with_capacity(self.shared.config.workers);

        for worker in 0..self.shared.config.workers {
            let consumer = self.shared.store.queue_consumer().await?;
            let shared = self.shared.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(worker_loop(shared, consumer, worker, shutdown)));
        }

        Ok(WorkerPoolHandle { shutdown, tasks })
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    mut consumer: Box<dyn QueueConsumer>,
    worker: usize,
    shutdown: Arc<AtomicBool>,
) {
    info!(worker, "worker loop started");

    while !shutdown.load(Ordering::Relaxed) {
        match consumer.pop(shared.config.poll_timeout).await {
            Ok(Some(job_id)) => shared.process(worker, job_id).await,
            Ok(None) => {}
            Err(e) => {
                warn!(worker, error = %e, "queue pop failed");
                tokio::time::sleep(shared.config.poll_timeout).await;
            }
        }
    }

    info!(worker, "worker loop stopped");
}

impl Shared {
    async fn process(&self, worker: usize, job_id: JobId) {
        let Some(claimed) = self.process_queued(worker, job_id).await else {
            return;
        };
        let Some(transformed) = self.process_transformed(worker, claimed).await else {
            self.publish_queue_depth().await;
            return;
        };
        self.finalize(worker, transformed).await;
        self.publish_queue_depth().await;
    }

    /// Claim a dequeued job: verify it is still `queued`, record queue wait,
    /// and move it to `processing`.
    async fn process_queued(&self, worker: usize, job_id: JobId) -> Option<ClaimedJob> {
        let record = match self.store.get_job(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(worker, %job_id, "dequeued job no longer exists");
                return None;
            }
            Err(e) => {
                warn!(worker, %job_id, error = %e, "failed to load dequeued job");
                return None;
            }
        };

        // Defensive against duplicate queue entries: only queued jobs start.
        if record.status != JobStatus::Queued {
            debug!(worker, %job_id, status = %record.status, "skipping non-queued job");
            return None;
        }

        let queue_ms = (Utc::now() - record.created_at).num_milliseconds().max(0) as u64;

        if let Err(e) = self
            .store
            .update_status(job_id, JobStatus::Processing, StatusChange::none())
            .await
        {
            warn!(worker, %job_id, error = %e, "failed to mark job processing");
            return None;
        }

        info!(
            worker,
            %job_id,
            tenant_id = %record.tenant_id,
            entity_id = %record.entity_id,
            correlation_id = %record.correlation_id,
            queue_ms,
            "processing started"
        );

        Some(ClaimedJob { record, queue_ms })
    }

    /// Run the transformation with retries. On exhaustion the job is failed
    /// terminally and `None` is returned; no embedding attempt is made.
    async fn process_transformed(&self, worker: usize, claimed: ClaimedJob) -> Option<TransformedJob> {
        let ClaimedJob { record, queue_ms } = claimed;
        let job_id = record.job_id;
        let phase_started = Instant::now();
        let attempts_seen = AtomicU32::new(0);

        let result = {
            let record = &record;
            let attempts_seen = &attempts_seen;
            run_with_retry(
                &self.config.transform_retry,
                self.transformer.breaker(),
                |attempt| async move {
                    let number = self
                        .store
                        .increment_attempt(job_id)
                        .await
                        .unwrap_or(attempt + 1);
                    attempts_seen.store(number, Ordering::Relaxed);
                    self.transformer.run(record, number).await
                },
            )
            .await
        };

        let transform_ms = phase_started.elapsed().as_millis() as u64;
        let attempts = attempts_seen.load(Ordering::Relaxed);

        match result {
            Ok(output) => Some(TransformedJob {
                record,
                queue_ms,
                transform_ms,
                attempts,
                document: output.document,
            }),
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = self
                    .store
                    .update_status(job_id, JobStatus::Failed, StatusChange::failed(message.clone()))
                    .await
                {
                    warn!(worker, %job_id, error = %store_err, "failed to record job failure");
                }
                self.metrics
                    .job_failed(&record.tenant_id.to_string(), e.kind());
                info!(
                    worker,
                    %job_id,
                    attempts,
                    transform_ms,
                    error = %message,
                    "processing failed"
                );
                None
            }
        }
    }

    /// Best-effort embedding, then completion. An embedding failure degrades
    /// the result; it never fails the job.
    async fn finalize(&self, worker: usize, transformed: TransformedJob) {
        let TransformedJob {
            record,
            queue_ms,
            transform_ms,
            attempts,
            document,
        } = transformed;
        let job_id = record.job_id;
        let tenant = record.tenant_id.to_string();

        let outcome = self.embedder.upsert(&record, &document).await;

        let phases = PhaseDurations {
            queue: queue_ms,
            transform: transform_ms,
            embed: outcome.duration_ms,
            total: queue_ms + transform_ms + outcome.duration_ms,
        };
        let result = EnrichmentResult {
            processing_time_seconds: (transform_ms + outcome.duration_ms) as f64 / 1000.0,
            entity_snapshot: document.clone(),
            embedding_upserted: outcome.success,
            embedding_skipped_reason: outcome.reason.clone(),
            model_version: document.str_field("model_version").map(str::to_string),
            prompt_version: document.str_field("prompt_version").map(str::to_string),
            phase_durations_ms: phases,
            attempts,
            queue_duration_ms: queue_ms,
        };

        if let Err(e) = self
            .store
            .update_status(job_id, JobStatus::Completed, StatusChange::completed(result))
            .await
        {
            warn!(worker, %job_id, error = %e, "failed to record job completion");
            return;
        }

        self.metrics.job_completed(&tenant, phases.total);
        if outcome.skipped {
            self.metrics.embedding_outcome(
                &tenant,
                EmbeddingOutcome::Skipped {
                    reason: outcome.reason.as_deref().unwrap_or("unknown"),
                },
            );
        } else if outcome.success {
            self.metrics
                .embedding_outcome(&tenant, EmbeddingOutcome::Upserted);
        } else {
            self.metrics
                .embedding_outcome(&tenant, EmbeddingOutcome::Failed);
        }

        self.latency.record(phases.total);
        if let Some((p50, p95, p99)) = self.latency.percentiles() {
            self.metrics.latency_percentiles(p50, p95, p99);
        }

        info!(
            worker,
            %job_id,
            attempts,
            queue_ms,
            transform_ms,
            embed_ms = outcome.duration_ms,
            embedding_upserted = outcome.success,
            "processing completed"
        );
    }

    async fn publish_queue_depth(&self) {
        if let Ok(depth) = self.store.queue_depth().await {
            self.metrics.queue_depth(depth);
        }
    }
}
