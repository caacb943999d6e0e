//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Guarded invocation entry point combining breaker, retry, and recorder."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::classifier::{FailureClassifier, TimeoutFault};
use crate::error::ExecutionError;
use crate::recorder::MetricsRecorder;
use crate::retry::{Admission, AttemptHook, AttemptOutcome, Permit, RetryExecutor, RetryPolicy};
use crate::snapshot::CircuitMetricsSnapshot;

/// Runs operations through the breaker and retry loop and records every outcome.
///
/// The breaker is consulted before each attempt and told about each attempt's
/// result, so a burst of retries can open the circuit mid-invocation.
pub struct ResilienceExecutor<C> {
    breaker: Arc<CircuitBreaker>,
    recorder: Arc<MetricsRecorder>,
    retry: RetryExecutor<C>,
}

impl<C> ResilienceExecutor<C> {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        recorder: Arc<MetricsRecorder>,
        retry: RetryExecutor<C>,
    ) -> Self {
        Self {
            breaker,
            recorder,
            retry,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn recorder(&self) -> &Arc<MetricsRecorder> {
        &self.recorder
    }

    pub fn retry(&self) -> &RetryExecutor<C> {
        &self.retry
    }

    /// Invoke `operation` under `policy`.
    ///
    /// Fails with [`ExecutionError::CircuitOpen`] without invoking the operation when
    /// the breaker sheds the attempt.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: F,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<T, ExecutionError<E>>
    where
        C: FailureClassifier<E>,
        E: fmt::Debug + fmt::Display + TimeoutFault,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = Guard {
            breaker: &self.breaker,
            recorder: &self.recorder,
        };
        self.retry
            .invoke_with_hooks(policy, operation, &guard, cancel)
            .await
    }
}

impl<C: fmt::Debug> fmt::Debug for ResilienceExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceExecutor")
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

struct Guard<'a> {
    breaker: &'a CircuitBreaker,
    recorder: &'a MetricsRecorder,
}

impl AttemptHook for Guard<'_> {
    fn admit(&self, attempt: u32) -> Admission {
        self.breaker.admit(attempt)
    }

    fn complete(&self, permit: Permit, outcome: &AttemptOutcome) {
        self.breaker.complete(permit, outcome);
    }

    fn record(&self, delta: CircuitMetricsSnapshot) {
        AttemptHook::record(self.recorder, delta);
    }
}
