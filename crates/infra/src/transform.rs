//! Transformation invoker: one external subprocess per attempt.
//!
//! The transformer is an opaque program that receives the entity reference
//! as arguments and contextual identifiers as environment variables, and must
//! emit exactly one JSON object on stdout. A hard wall-clock timeout kills a
//! stuck process. Failures are classified as retryable or not; the worker
//! pool drives the retries through the shared driver in [`crate::retry`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use enrichd_core::UntrustedDocument;

use crate::jobs::JobRecord;
use crate::retry::{CircuitBreaker, RetryableError};

/// Cap on how much stderr we carry into error messages and logs.
const STDERR_TAIL_LEN: usize = 400;

/// Transformation failure, classified for retry decisions.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Wall-clock timeout, or the process itself reported timing out.
    #[error("transform timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The process was killed by a signal.
    #[error("transform killed by signal: {detail}")]
    Signal { detail: String },

    /// Stdout did not contain a valid JSON object. Retrying cannot fix a bad
    /// output contract.
    #[error("transform output unparsable: {detail}")]
    OutputParse { detail: String },

    /// The transformer circuit is open; no process was spawned.
    #[error("transform circuit open")]
    CircuitOpen,

    /// Any other failure (spawn error, non-zero exit).
    #[error("transform failed: {detail}")]
    Generic { detail: String },
}

impl TransformError {
    /// Stable kind label for metrics and terminal error strings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Signal { .. } => "signal",
            Self::OutputParse { .. } => "output_parse",
            Self::CircuitOpen => "circuit_open",
            Self::Generic { .. } => "generic",
        }
    }
}

impl RetryableError for TransformError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Signal { .. } | Self::Generic { .. }
        )
    }

    fn counts_against_breaker(&self) -> bool {
        !matches!(self, Self::CircuitOpen)
    }
}

/// Successful transformation output.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub document: UntrustedDocument,
    pub duration_ms: u64,
}

/// Subprocess invocation settings.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Interpreter or binary to execute (e.g. `python3`).
    pub executable: String,
    /// Script passed as the first argument.
    pub script: String,
    /// Pass `--testing` to the script (sandboxed/stub mode).
    pub testing_flag: bool,
    /// Hard wall-clock limit per attempt; the process is killed on expiry.
    pub job_timeout: Duration,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            executable: "python3".to_string(),
            script: "scripts/transform_profile.py".to_string(),
            testing_flag: false,
            job_timeout: Duration::from_secs(120),
        }
    }
}

/// Seam for the worker pool; production uses [`SubprocessTransformer`].
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn run(&self, job: &JobRecord, attempt: u32) -> Result<TransformOutput, TransformError>;

    /// Breaker guarding this transformer, when it has one. The retry driver
    /// records attempt outcomes there.
    fn breaker(&self) -> Option<&CircuitBreaker> {
        None
    }
}

/// Spawns one external process per attempt.
pub struct SubprocessTransformer {
    config: TransformConfig,
    breaker: Arc<CircuitBreaker>,
}

impl SubprocessTransformer {
    pub fn new(config: TransformConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self { config, breaker }
    }
}

#[async_trait]
impl Transformer for SubprocessTransformer {
    async fn run(&self, job: &JobRecord, attempt: u32) -> Result<TransformOutput, TransformError> {
        if !self.breaker.check() {
            return Err(TransformError::CircuitOpen);
        }

        let started = Instant::now();

        let mut command = Command::new(&self.config.executable);
        command
            .arg(&self.config.script)
            .arg("--entity-id")
            .arg(job.entity_id.as_str())
            .arg("--json");
        if self.config.testing_flag {
            command.arg("--testing");
        }
        command
            .env("JOB_ID", job.job_id.to_string())
            .env("JOB_ATTEMPT", attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            job_id = %job.job_id,
            entity_id = %job.entity_id,
            attempt,
            "spawning transformer"
        );

        let child = command.spawn().map_err(|e| TransformError::Generic {
            detail: format!("spawn {}: {e}", self.config.executable),
        })?;

        let output = match tokio::time::timeout(self.config.job_timeout, child.wait_with_output())
            .await
        {
            // Timeout: dropping the in-flight future kills the child
            // (kill_on_drop).
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(job_id = %job.job_id, elapsed_ms, "transformer exceeded hard timeout");
                return Err(TransformError::Timeout { elapsed_ms });
            }
            Ok(Err(e)) => {
                return Err(TransformError::Generic {
                    detail: format!("wait: {e}"),
                });
            }
            Ok(Ok(output)) => output,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(classify_failure(&output.status, &stderr, duration_ms));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let document = UntrustedDocument::from_json_str(stdout.trim()).map_err(|e| {
            TransformError::OutputParse {
                detail: e.to_string(),
            }
        })?;

        Ok(TransformOutput {
            document,
            duration_ms,
        })
    }

    fn breaker(&self) -> Option<&CircuitBreaker> {
        Some(self.breaker.as_ref())
    }
}

fn classify_failure(
    status: &std::process::ExitStatus,
    stderr: &str,
    elapsed_ms: u64,
) -> TransformError {
    let stderr_lc = stderr.to_lowercase();

    if stderr_lc.contains("timeout") || stderr_lc.contains("timed out") {
        return TransformError::Timeout { elapsed_ms };
    }
    // `code()` is `None` when the process was terminated by a signal.
    if status.code().is_none() || stderr_lc.contains("killed") || stderr_lc.contains("signal") {
        return TransformError::Signal {
            detail: stderr_tail(stderr),
        };
    }
    TransformError::Generic {
        detail: format!(
            "exit code {}: {}",
            status.code().unwrap_or(-1),
            stderr_tail(stderr)
        ),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_LEN {
        return trimmed.to_string();
    }
    let start = trimmed.len() - STDERR_TAIL_LEN;
    let mut begin = start;
    while begin < trimmed.len() && !trimmed.is_char_boundary(begin) {
        begin += 1;
    }
    trimmed[begin..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewJob;
    use crate::retry::{BreakerConfig, CircuitState, RetryPolicy, run_with_retry};
    use enrichd_core::{CorrelationId, EntityId, TenantId};
    use serde_json::json;
    use std::path::PathBuf;

    fn test_job() -> JobRecord {
        JobRecord::from_new(&NewJob {
            tenant_id: TenantId::new(),
            entity_id: EntityId::new("cand_77").unwrap(),
            idempotency_key: None,
            force: false,
            payload: json!({}),
            correlation_id: CorrelationId::new(),
            priority: 0,
        })
    }

    fn write_script(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("enrichd_{}_{}.sh", name, uuid::Uuid::now_v7()));
        std::fs::write(&path, body).unwrap();
        path
    }

    fn transformer_for(script: &PathBuf, breaker: Arc<CircuitBreaker>) -> SubprocessTransformer {
        SubprocessTransformer::new(
            TransformConfig {
                executable: "sh".to_string(),
                script: script.to_string_lossy().into_owned(),
                testing_flag: false,
                job_timeout: Duration::from_secs(5),
            },
            breaker,
        )
    }

    fn default_breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(BreakerConfig::default()))
    }

    #[tokio::test]
    async fn parses_json_stdout_on_success() {
        let script = write_script(
            "ok",
            r#"echo '{"entity_id": "cand_77", "summary": "systems engineer", "model_version": "m-9"}'"#,
        );
        let transformer = transformer_for(&script, default_breaker());

        let out = transformer.run(&test_job(), 1).await.unwrap();
        assert_eq!(out.document.str_field("model_version"), Some("m-9"));
        assert_eq!(out.document.str_field("summary"), Some("systems engineer"));
    }

    #[tokio::test]
    async fn receives_entity_and_job_context() {
        // The script echoes its own inputs back so we can assert the contract.
        let script = write_script(
            "ctx",
            r#"printf '{"args": "%s", "job_id": "%s", "attempt": "%s"}' "$*" "$JOB_ID" "$JOB_ATTEMPT""#,
        );
        let transformer = transformer_for(&script, default_breaker());
        let job = test_job();

        let out = transformer.run(&job, 2).await.unwrap();
        let args = out.document.str_field("args").unwrap();
        assert!(args.contains("--entity-id cand_77"));
        assert!(args.contains("--json"));
        assert_eq!(out.document.str_field("job_id"), Some(job.job_id.to_string().as_str()));
        assert_eq!(out.document.str_field("attempt"), Some("2"));
    }

    #[tokio::test]
    async fn malformed_stdout_is_non_retryable() {
        let script = write_script("badout", "echo 'this is not json'");
        let transformer = transformer_for(&script, default_breaker());

        let err = transformer.run(&test_job(), 1).await.unwrap_err();
        assert!(matches!(err, TransformError::OutputParse { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn stderr_mentioning_timeout_classifies_as_timeout() {
        let script = write_script("timeout", "echo 'upstream call timed out' 1>&2; exit 1");
        let transformer = transformer_for(&script, default_breaker());

        let err = transformer.run(&test_job(), 1).await.unwrap_err();
        assert!(matches!(err, TransformError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn hard_timeout_kills_the_process() {
        let script = write_script("hang", "sleep 30");
        let breaker = default_breaker();
        let transformer = SubprocessTransformer::new(
            TransformConfig {
                executable: "sh".to_string(),
                script: script.to_string_lossy().into_owned(),
                testing_flag: false,
                job_timeout: Duration::from_millis(100),
            },
            breaker,
        );

        let started = Instant::now();
        let err = transformer.run(&test_job(), 1).await.unwrap_err();
        assert!(matches!(err, TransformError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_spawning() {
        let marker = std::env::temp_dir().join(format!("enrichd_marker_{}", uuid::Uuid::now_v7()));
        let script = write_script(
            "marker",
            &format!("echo ran >> {}\nexit 1", marker.display()),
        );

        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            threshold: 3,
            cooldown: Duration::from_secs(60),
        }));
        let transformer = transformer_for(&script, breaker.clone());
        let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(2));

        // Three consecutive failures across separate jobs open the circuit.
        for _ in 0..3 {
            let job = test_job();
            let result = run_with_retry(&policy, transformer.breaker(), |attempt| {
                transformer.run(&job, attempt + 1)
            })
            .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 3);

        // Fourth attempt fails fast: no new process, marker untouched.
        let err = transformer.run(&test_job(), 1).await.unwrap_err();
        assert!(matches!(err, TransformError::CircuitOpen));
        assert!(!err.counts_against_breaker());
        assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 3);
    }
}
