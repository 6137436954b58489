//! Operational metrics seam.
//!
//! The pipeline emits domain signals (submissions, completions, embedding
//! outcomes, breaker transitions, queue depth, latency percentiles) through
//! the [`MetricsSink`] trait; the concrete backend is a deployment choice.
//! [`TracingMetrics`] emits every signal as a structured log line and is the
//! production default. [`InMemoryMetrics`] records everything for
//! inspection in tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Sink for the operational signals the pipeline publishes.
pub trait MetricsSink: Send + Sync {
    /// A submission was accepted. `deduped` marks a dedupe hit (no new job).
    fn job_submitted(&self, tenant: &str, deduped: bool);

    /// A job reached `completed`.
    fn job_completed(&self, tenant: &str, total_ms: u64);

    /// A job reached `failed`. `reason` is the terminal error kind.
    fn job_failed(&self, tenant: &str, reason: &str);

    /// Current depth of the shared work queue.
    fn queue_depth(&self, depth: u64);

    /// Embedding phase outcome for a completed job.
    fn embedding_outcome(&self, tenant: &str, outcome: EmbeddingOutcome<'_>);

    /// A circuit breaker changed state. `state` is `closed`/`open`/`half_open`.
    fn breaker_state(&self, dependency: &str, state: &str);

    /// Rolling job-latency percentiles over recent completions.
    fn latency_percentiles(&self, p50_ms: f64, p95_ms: f64, p99_ms: f64);
}

/// Outcome of one embedding attempt sequence, for counter purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingOutcome<'a> {
    Upserted,
    Failed,
    Skipped { reason: &'a str },
}

/// Default sink: structured log lines under the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn job_submitted(&self, tenant: &str, deduped: bool) {
        tracing::info!(target: "metrics", tenant, deduped, "enrich.job.submitted");
    }

    fn job_completed(&self, tenant: &str, total_ms: u64) {
        tracing::info!(target: "metrics", tenant, total_ms, "enrich.job.completed");
    }

    fn job_failed(&self, tenant: &str, reason: &str) {
        tracing::info!(target: "metrics", tenant, reason, "enrich.job.failed");
    }

    fn queue_depth(&self, depth: u64) {
        tracing::info!(target: "metrics", depth, "enrich.queue.depth");
    }

    fn embedding_outcome(&self, tenant: &str, outcome: EmbeddingOutcome<'_>) {
        match outcome {
            EmbeddingOutcome::Upserted => {
                tracing::info!(target: "metrics", tenant, "enrich.embedding.upserted");
            }
            EmbeddingOutcome::Failed => {
                tracing::info!(target: "metrics", tenant, "enrich.embedding.failed");
            }
            EmbeddingOutcome::Skipped { reason } => {
                tracing::info!(target: "metrics", tenant, reason, "enrich.embedding.skipped");
            }
        }
    }

    fn breaker_state(&self, dependency: &str, state: &str) {
        tracing::info!(target: "metrics", dependency, state, "enrich.breaker.state");
    }

    fn latency_percentiles(&self, p50_ms: f64, p95_ms: f64, p99_ms: f64) {
        tracing::info!(target: "metrics", p50_ms, p95_ms, p99_ms, "enrich.job.latency");
    }
}

/// Recording sink for tests and diagnostics.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn gauge(&self, key: &str) -> Option<f64> {
        self.gauges.lock().unwrap().get(key).copied()
    }

    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters.lock().unwrap().clone()
    }

    fn incr(&self, key: String) {
        *self.counters.lock().unwrap().entry(key).or_insert(0) += 1;
    }

    fn set(&self, key: String, value: f64) {
        self.gauges.lock().unwrap().insert(key, value);
    }
}

impl MetricsSink for InMemoryMetrics {
    fn job_submitted(&self, tenant: &str, deduped: bool) {
        self.incr(format!("jobs_submitted.{tenant}"));
        if deduped {
            self.incr(format!("jobs_deduped.{tenant}"));
        }
    }

    fn job_completed(&self, tenant: &str, _total_ms: u64) {
        self.incr(format!("jobs_completed.{tenant}"));
    }

    fn job_failed(&self, tenant: &str, reason: &str) {
        self.incr(format!("jobs_failed.{tenant}"));
        self.incr(format!("jobs_failed_by_reason.{reason}"));
    }

    fn queue_depth(&self, depth: u64) {
        self.set("queue_depth".to_string(), depth as f64);
    }

    fn embedding_outcome(&self, tenant: &str, outcome: EmbeddingOutcome<'_>) {
        match outcome {
            EmbeddingOutcome::Upserted => self.incr(format!("embedding_upserted.{tenant}")),
            EmbeddingOutcome::Failed => self.incr(format!("embedding_failed.{tenant}")),
            EmbeddingOutcome::Skipped { reason } => {
                self.incr(format!("embedding_skipped.{reason}"));
            }
        }
    }

    fn breaker_state(&self, dependency: &str, state: &str) {
        let value = match state {
            "closed" => 0.0,
            "half_open" => 1.0,
            _ => 2.0,
        };
        self.set(format!("breaker.{dependency}"), value);
    }

    fn latency_percentiles(&self, p50_ms: f64, p95_ms: f64, p99_ms: f64) {
        self.set("latency_p50_ms".to_string(), p50_ms);
        self.set("latency_p95_ms".to_string(), p95_ms);
        self.set("latency_p99_ms".to_string(), p99_ms);
    }
}

/// Rolling window of recent job latencies.
///
/// Bounded to the most recent `capacity` completions; percentiles use the
/// nearest-rank method over a sorted copy.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, latency_ms: u64) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(p50, p95, p99)` in milliseconds, or `None` when no samples exist.
    pub fn percentiles(&self) -> Option<(f64, f64, f64)> {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        Some((
            nearest_rank(&sorted, 0.50),
            nearest_rank(&sorted, 0.95),
            nearest_rank(&sorted, 0.99),
        ))
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(200)
    }
}

fn nearest_rank(sorted: &[u64], quantile: f64) -> f64 {
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)] as f64
}
