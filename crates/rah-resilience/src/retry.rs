//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Bounded retry with exponential backoff, jitter, and cancellation."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rah_common::config::{FailureCounting, RetryConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::classifier::{AttemptResult, FailureClassifier, FaultClass, TimeoutFault};
use crate::error::{ConfigurationError, ExecutionError};
use crate::metrics::ResilienceMetrics;
use crate::snapshot::CircuitMetricsSnapshot;

/// Doubling stops here; `max_delay` bounds the result long before in practice.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Retry budget and backoff schedule for a guarded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total invocations allowed, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every later attempt.
    pub base_delay: Duration,
    /// Upper bound applied to the exponential component.
    pub max_delay: Duration,
    /// Uniform random jitter added on top of the bounded delay.
    pub jitter: Duration,
    /// Optional limit on a single attempt.
    pub attempt_timeout: Option<Duration>,
    pub counting: FailureCounting,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: Duration::ZERO,
            attempt_timeout: None,
            counting: FailureCounting::PerAttempt,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_counting(mut self, counting: FailureCounting) -> Self {
        self.counting = counting;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::InvalidPolicy(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigurationError::InvalidPolicy(
                "base_delay must not exceed max_delay".into(),
            ));
        }
        if self.attempt_timeout.is_some_and(|limit| limit.is_zero()) {
            return Err(ConfigurationError::InvalidPolicy(
                "attempt_timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Delay applied after the given failed attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let bounded = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter.is_zero() {
            bounded
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis() as u64);
            bounded.saturating_add(Duration::from_millis(jitter_ms))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter: config.jitter,
            attempt_timeout: config.attempt_timeout,
            counting: config.counting,
        }
    }
}

/// Ticket handed out with an admission and returned with the attempt's outcome.
///
/// The breaker stamps it with the generation it was issued in, so outcomes from
/// attempts admitted before a later transition can be told apart from the trial's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
}

impl Permit {
    pub(crate) fn new(generation: u64) -> Self {
        Self { generation }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// Whether an attempt may invoke the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(Permit),
    Rejected { retry_after: Duration },
}

impl Admission {
    /// The permit to report the outcome with; `None` when rejected.
    pub fn permit(&self) -> Option<Permit> {
        match self {
            Admission::Admitted(permit) => Some(*permit),
            Admission::Rejected { .. } => None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// What a single attempt produced, as seen by hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed { class: FaultClass, timeout: bool },
}

/// Observation points around every attempt.
///
/// `admit` runs before each invocation, `complete` after it, and `record` receives
/// the counter deltas the attempt loop decides to publish.
pub trait AttemptHook: Send + Sync {
    fn admit(&self, _attempt: u32) -> Admission {
        Admission::Admitted(Permit::default())
    }

    fn complete(&self, _permit: Permit, _outcome: &AttemptOutcome) {}

    fn record(&self, _delta: CircuitMetricsSnapshot) {}
}

/// Hook set that observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl AttemptHook for NoHooks {}

/// Runs an operation until it succeeds, fails fatally, or exhausts its attempts.
pub struct RetryExecutor<C> {
    classifier: C,
    rng: Mutex<StdRng>,
    metrics: Option<ResilienceMetrics>,
}

impl<C> RetryExecutor<C> {
    pub fn new(classifier: C) -> Self {
        Self {
            classifier,
            rng: Mutex::new(StdRng::from_entropy()),
            metrics: None,
        }
    }

    /// Seed the jitter RNG for deterministic testing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Run `operation` under `policy` with no hooks attached.
    pub async fn invoke<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, ExecutionError<E>>
    where
        C: FailureClassifier<E>,
        E: fmt::Debug + fmt::Display + TimeoutFault,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.invoke_with_hooks(policy, operation, &NoHooks, cancel)
            .await
    }

    /// Run `operation` under `policy`, consulting `hooks` around every attempt.
    ///
    /// The operation receives the 1-based attempt number. Cancellation is observed
    /// before each attempt and while waiting out a backoff delay; an attempt already
    /// in flight runs to completion or to its timeout.
    pub async fn invoke_with_hooks<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
        hooks: &dyn AttemptHook,
        cancel: &CancellationToken,
    ) -> Result<T, ExecutionError<E>>
    where
        C: FailureClassifier<E>,
        E: fmt::Debug + fmt::Display + TimeoutFault,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut pending = Pending::new(policy.counting);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                pending.flush(hooks);
                debug!(attempts = attempt, "invocation cancelled before attempt");
                return Err(ExecutionError::Cancelled { attempts: attempt });
            }

            let permit = match hooks.admit(attempt + 1) {
                Admission::Admitted(permit) => permit,
                Admission::Rejected { retry_after } => {
                    pending.flush(hooks);
                    hooks.record(CircuitMetricsSnapshot::rejected());
                    debug!(
                        attempts = attempt,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "attempt rejected by open circuit"
                    );
                    return Err(ExecutionError::CircuitOpen { retry_after });
                }
            };
            attempt += 1;

            let (result, timed_out) = match policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation(attempt)).await {
                    Ok(result) => (result, false),
                    Err(_) => (Err(E::elapsed(limit)), true),
                },
                None => (operation(attempt).await, false),
            };

            let (class, fault) = match AttemptResult::classify(result, &self.classifier) {
                AttemptResult::Success(value) => {
                    hooks.complete(permit, &AttemptOutcome::Succeeded);
                    pending.discard();
                    hooks.record(CircuitMetricsSnapshot::success());
                    if attempt > 1 {
                        debug!(attempt, "operation recovered after retry");
                    }
                    return Ok(value);
                }
                AttemptResult::Transient(fault) => (FaultClass::Transient, fault),
                AttemptResult::Fatal(fault) => (FaultClass::Fatal, fault),
            };

            let timeout = timed_out || self.classifier.is_timeout(&fault);
            hooks.complete(permit, &AttemptOutcome::Failed { class, timeout });
            let delta = if timeout {
                CircuitMetricsSnapshot::timeout()
            } else {
                CircuitMetricsSnapshot::failure()
            };
            pending.push(delta, hooks);

            if class == FaultClass::Fatal {
                pending.flush(hooks);
                error!(attempt, error = %fault, "fatal fault; not retrying");
                return Err(ExecutionError::Fatal {
                    attempts: attempt,
                    fault,
                });
            }

            if attempt >= max_attempts {
                pending.flush(hooks);
                error!(attempt, error = %fault, "retry budget exhausted");
                return Err(ExecutionError::Exhausted {
                    attempts: attempt,
                    fault,
                });
            }

            let delay = {
                let mut rng = self.rng.lock();
                policy.backoff_delay(attempt, &mut rng)
            };
            if let Some(metrics) = &self.metrics {
                metrics.observe_retry(delay);
            }
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %fault,
                "transient fault; backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    pending.flush(hooks);
                    debug!(attempts = attempt, "invocation cancelled during backoff");
                    return Err(ExecutionError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for RetryExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

/// Failure delta waiting to be published under terminal counting.
struct Pending {
    counting: FailureCounting,
    last: Option<CircuitMetricsSnapshot>,
}

impl Pending {
    fn new(counting: FailureCounting) -> Self {
        Self {
            counting,
            last: None,
        }
    }

    fn push(&mut self, delta: CircuitMetricsSnapshot, hooks: &dyn AttemptHook) {
        match self.counting {
            FailureCounting::PerAttempt => hooks.record(delta),
            FailureCounting::Terminal => self.last = Some(delta),
        }
    }

    fn flush(&mut self, hooks: &dyn AttemptHook) {
        if let Some(delta) = self.last.take() {
            hooks.record(delta);
        }
    }

    fn discard(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{OperationFault, PolicyClassifier};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Recording {
        deltas: Mutex<Vec<CircuitMetricsSnapshot>>,
    }

    impl Recording {
        fn total(&self) -> CircuitMetricsSnapshot {
            self.deltas.lock().iter().sum()
        }
    }

    impl AttemptHook for Recording {
        fn record(&self, delta: CircuitMetricsSnapshot) {
            self.deltas.lock().push(delta);
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    fn unavailable() -> OperationFault {
        OperationFault::Unavailable("connection refused".into())
    }

    #[test]
    fn backoff_doubles_and_respects_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(450));
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<_> = (1..=5)
            .map(|attempt| policy.backoff_delay(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 450, 450]);
        assert_eq!(
            policy.backoff_delay(u32::MAX, &mut rng),
            Duration::from_millis(450)
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(100))
            .with_jitter(Duration::from_millis(50));
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..64 {
            let delay = policy.backoff_delay(1, &mut rng);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn validate_rejects_inconsistent_policies() {
        assert!(fast_policy(0).validate().is_err());
        assert!(RetryPolicy::new(2, Duration::from_secs(2), Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(fast_policy(3)
            .with_attempt_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[tokio::test]
    async fn always_transient_runs_exactly_max_attempts() {
        let executor = RetryExecutor::new(PolicyClassifier::default()).with_seed(1);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .invoke(
                &fast_policy(4),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(unavailable()) }
                },
                &CancellationToken::new(),
            )
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ExecutionError::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn recovers_after_transient_faults() {
        let executor = RetryExecutor::new(PolicyClassifier::default());
        let hooks = Recording::default();
        let result = executor
            .invoke_with_hooks(
                &fast_policy(5),
                |attempt| async move {
                    if attempt <= 2 {
                        Err(unavailable())
                    } else {
                        Ok(attempt)
                    }
                },
                &hooks,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(hooks.total(), CircuitMetricsSnapshot::new(1, 2, 0, 0));
    }

    #[tokio::test]
    async fn fatal_fault_aborts_immediately() {
        let executor = RetryExecutor::new(PolicyClassifier::default());
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .invoke(
                &fast_policy(5),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(OperationFault::Other("malformed request".into())) }
                },
                &CancellationToken::new(),
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), "fatal_fault");
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_counting_records_only_the_surfaced_failure() {
        let executor = RetryExecutor::new(PolicyClassifier::default());
        let hooks = Recording::default();
        let policy = fast_policy(3).with_counting(FailureCounting::Terminal);
        let result: Result<(), _> = executor
            .invoke_with_hooks(
                &policy,
                |_| async { Err(unavailable()) },
                &hooks,
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(hooks.total(), CircuitMetricsSnapshot::failure());

        let hooks = Recording::default();
        let recovered = executor
            .invoke_with_hooks(
                &policy,
                |attempt| async move {
                    if attempt == 1 {
                        Err(unavailable())
                    } else {
                        Ok(())
                    }
                },
                &hooks,
                &CancellationToken::new(),
            )
            .await;
        assert!(recovered.is_ok());
        assert_eq!(hooks.total(), CircuitMetricsSnapshot::success());
    }

    #[tokio::test]
    async fn attempt_timeout_counts_as_timeout() {
        let executor = RetryExecutor::new(PolicyClassifier::default());
        let hooks = Recording::default();
        let policy = fast_policy(2).with_attempt_timeout(Duration::from_millis(10));
        let result: Result<(), _> = executor
            .invoke_with_hooks(
                &policy,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                &hooks,
                &CancellationToken::new(),
            )
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.fault(),
            Some(OperationFault::Timeout(_))
        ));
        assert_eq!(hooks.total(), CircuitMetricsSnapshot::new(0, 0, 2, 0));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let executor = RetryExecutor::new(PolicyClassifier::default());
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(30));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let counter = Arc::clone(&calls);
        let started = std::time::Instant::now();
        let result: Result<(), _> = executor
            .invoke(
                &policy,
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(unavailable()) }
                },
                &cancel,
            )
            .await;

        assert!(matches!(
            result.unwrap_err(),
            ExecutionError::Cancelled { attempts: 1 }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_token_prevents_first_attempt() {
        let executor = RetryExecutor::new(PolicyClassifier::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), ExecutionError<OperationFault>> = executor
            .invoke(&fast_policy(3), |_| async { Ok(()) }, &cancel)
            .await;
        assert!(matches!(
            result.unwrap_err(),
            ExecutionError::Cancelled { attempts: 0 }
        ));
    }
}
