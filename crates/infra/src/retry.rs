//! Shared retry driver and circuit breaker.
//!
//! Every unreliable external dependency (transformation subprocess, embedding
//! endpoint) is called through [`run_with_retry`]: exponential backoff with
//! jitter, stop on non-retryable errors, and every real attempt's outcome
//! routed through the dependency's [`CircuitBreaker`] so breaker state tracks
//! the dependency's health independent of any single job's retry budget.
//!
//! Breakers are explicit injected instances (one per guarded dependency),
//! never ambient globals; state is process-local and resets on restart.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on the random jitter added to each backoff delay.
const MAX_JITTER_MS: u64 = 250;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Failing fast; calls are rejected immediately.
    Open,
    /// Cooldown elapsed; the next real call probes the dependency.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker tuning: consecutive failures before opening, and how long the
/// circuit stays open before a half-open probe is allowed.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

type TransitionHook = Arc<dyn Fn(CircuitState) + Send + Sync>;

/// Thread-safe circuit breaker with lock-free state reads.
pub struct CircuitBreaker {
    /// Consecutive failure count.
    failures: AtomicU32,
    /// Monotonic microseconds until which the circuit is open (0 = not open).
    open_until_us: AtomicU64,
    config: BreakerConfig,
    /// Anchor instant for monotonic time.
    epoch: Instant,
    on_transition: Option<TransitionHook>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failures", &self.failure_count())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            failures: AtomicU32::new(0),
            open_until_us: AtomicU64::new(0),
            config,
            epoch: Instant::now(),
            on_transition: None,
        }
    }

    /// Attach a hook invoked on open/close transitions (health flags, gauges).
    pub fn with_transition_hook(
        config: BreakerConfig,
        hook: impl Fn(CircuitState) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_transition: Some(Arc::new(hook)),
            ..Self::new(config)
        }
    }

    /// Current circuit state (lock-free read).
    pub fn state(&self) -> CircuitState {
        let open_until = self.open_until_us.load(Ordering::Acquire);
        if open_until > 0 && self.now_us() < open_until {
            return CircuitState::Open;
        }
        if self.failures.load(Ordering::Acquire) >= self.config.threshold {
            return CircuitState::HalfOpen;
        }
        CircuitState::Closed
    }

    /// Number of consecutive failures.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Whether a call may proceed (closed, or half-open probe).
    pub fn check(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    /// Record a successful call, closing the circuit.
    pub fn record_success(&self) {
        let was_closed = matches!(self.state(), CircuitState::Closed);
        self.failures.store(0, Ordering::Release);
        self.open_until_us.store(0, Ordering::Release);
        if !was_closed {
            self.notify(CircuitState::Closed);
        }
    }

    /// Record a failed call, which may open (or re-open) the circuit.
    pub fn record_failure(&self) {
        let was_open = matches!(self.state(), CircuitState::Open);
        let count = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= self.config.threshold {
            let open_until = self.now_us() + micros_from_duration(self.config.cooldown);
            self.open_until_us.store(open_until, Ordering::Release);
            if !was_open {
                self.notify(CircuitState::Open);
            }
        }
    }

    fn notify(&self, state: CircuitState) {
        if let Some(hook) = &self.on_transition {
            hook(state);
        }
    }

    fn now_us(&self) -> u64 {
        micros_from_duration(self.epoch.elapsed())
    }
}

/// Convert a [`Duration`] to microseconds as `u64`, saturating on overflow.
const fn micros_from_duration(d: Duration) -> u64 {
    let us = d.as_micros();
    if us > u64::MAX as u128 { u64::MAX } else { us as u64 }
}

/// Errors that can flow through the retry driver.
pub trait RetryableError {
    /// Whether another attempt could plausibly succeed.
    fn is_retryable(&self) -> bool;

    /// Whether this failure reflects the dependency's health. Fast-fail
    /// rejections (circuit already open) must not re-count as failures.
    fn counts_against_breaker(&self) -> bool {
        true
    }
}

/// Retry tuning shared by the transformation and embedding phases.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub limit: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(limit: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            limit,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retrying after attempt `attempt` (0-indexed):
    /// `min(max_delay, base_delay * 2^attempt)` plus up to 250ms jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exp = base_ms.saturating_mul(1_u64 << attempt.min(32));
        Duration::from_millis(exp.min(max_ms) + jitter_ms())
    }
}

/// Jitter in `0..=250` ms from a simple LCG.
///
/// This only needs to break synchronization between competing workers, not
/// be cryptographically random, so we avoid pulling in `rand`.
fn jitter_ms() -> u64 {
    static SEED: AtomicU64 = AtomicU64::new(0);

    let prev = SEED.load(Ordering::Relaxed);
    if prev == 0 {
        let init = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0x4d59_5df4_d0f3_3173, |d| d.as_nanos() as u64 | 1);
        let _ = SEED.compare_exchange(0, init, Ordering::Relaxed, Ordering::Relaxed);
    }

    let a: u64 = 6_364_136_223_846_793_005;
    let c: u64 = 1_442_695_040_888_963_407;
    let old = SEED
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.wrapping_mul(a).wrapping_add(c))
        })
        .unwrap_or(42);

    (old >> 33) % (MAX_JITTER_MS + 1)
}

/// Drive `op` with retries under `policy`.
///
/// `op` receives the 0-indexed attempt number. Retryable errors are retried
/// until the retry limit is exhausted; non-retryable errors return
/// immediately. When a breaker is supplied, every attempt that actually
/// exercised the dependency records its outcome there.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    breaker: Option<&CircuitBreaker>,
    mut op: F,
) -> Result<T, E>
where
    E: RetryableError,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if let Some(breaker) = breaker {
                    breaker.record_success();
                }
                return Ok(value);
            }
            Err(err) => {
                if let Some(breaker) = breaker {
                    if err.counts_against_breaker() {
                        breaker.record_failure();
                    }
                }
                if !err.is_retryable() || attempt >= policy.limit {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
        breaker_relevant: bool,
    }

    impl TestError {
        fn retryable() -> Self {
            Self {
                retryable: true,
                breaker_relevant: true,
            }
        }

        fn fatal() -> Self {
            Self {
                retryable: false,
                breaker_relevant: true,
            }
        }

        fn rejected() -> Self {
            Self {
                retryable: false,
                breaker_relevant: false,
            }
        }
    }

    impl RetryableError for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }

        fn counts_against_breaker(&self) -> bool {
            self.breaker_relevant
        }
    }

    fn fast_policy(limit: u32) -> RetryPolicy {
        RetryPolicy::new(limit, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));

        for (attempt, expected_ms) in [(0, 100), (1, 200), (2, 400), (3, 800), (4, 1000), (10, 1000)] {
            let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
            assert!(
                delay >= expected_ms && delay <= expected_ms + MAX_JITTER_MS,
                "attempt {attempt}: got {delay}ms, expected {expected_ms}..={}ms",
                expected_ms + MAX_JITTER_MS
            );
        }
    }

    #[tokio::test]
    async fn retryable_errors_consume_the_full_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), TestError> = run_with_retry(&fast_policy(2), None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::retryable()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), TestError> = run_with_retry(&fast_policy(5), None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::fatal()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_retries_returns_the_value() {
        let result: Result<u32, TestError> = run_with_retry(&fast_policy(3), None, |attempt| async move {
            if attempt < 2 {
                Err(TestError::retryable())
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn breaker_records_attempt_outcomes() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            threshold: 10,
            cooldown: Duration::from_secs(5),
        });

        let _: Result<(), TestError> = run_with_retry(&fast_policy(2), Some(&breaker), |_| async {
            Err(TestError::retryable())
        })
        .await;
        assert_eq!(breaker.failure_count(), 3);

        let _: Result<(), TestError> =
            run_with_retry(&fast_policy(0), Some(&breaker), |_| async { Ok(()) }).await;
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn fast_fail_rejections_do_not_trip_the_breaker() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            threshold: 1,
            cooldown: Duration::from_secs(5),
        });

        let _: Result<(), TestError> = run_with_retry(&fast_policy(0), Some(&breaker), |_| async {
            Err(TestError::rejected())
        })
        .await;
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn breaker_opens_at_threshold() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            threshold: 3,
            cooldown: Duration::from_secs(30),
        });

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.check());
    }

    #[test]
    fn breaker_half_opens_after_cooldown_then_closes_on_success() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            threshold: 1,
            cooldown: Duration::from_millis(20),
        });

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.check());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_rearms_the_cooldown() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            threshold: 1,
            cooldown: Duration::from_millis(20),
        });

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn transition_hook_sees_open_and_close() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = seen.clone();
        let breaker = CircuitBreaker::with_transition_hook(
            BreakerConfig {
                threshold: 1,
                cooldown: Duration::from_secs(5),
            },
            move |state| seen_hook.lock().unwrap().push(state),
        );

        breaker.record_failure();
        breaker.record_success();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[CircuitState::Open, CircuitState::Closed]);
    }
}
