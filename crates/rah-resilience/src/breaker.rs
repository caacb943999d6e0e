//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Circuit breaker state machine shedding load under sustained failure."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rah_common::config::BreakerConfig;
use rah_common::time::{to_chrono, SharedClock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::metrics::ResilienceMetrics;
use crate::retry::{Admission, AttemptHook, AttemptOutcome, Permit};
use crate::snapshot::CircuitMetricsSnapshot;

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Breaker state; exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through.
    Closed,
    /// Requests are rejected without invoking the operation.
    Open,
    /// A single trial request probes whether the dependency recovered.
    HalfOpen,
}

impl CircuitState {
    /// Static label for metrics and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub(crate) fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published whenever the breaker changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    failure_times: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    trial_started_at: Option<DateTime<Utc>>,
    /// Bumped on every transition and every trial issue.
    generation: u64,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_times: VecDeque::new(),
            opened_at: None,
            trial_started_at: None,
            generation: 0,
        }
    }

    fn issue_trial(&mut self, now: DateTime<Utc>) -> Permit {
        self.generation = self.generation.wrapping_add(1);
        self.trial_started_at = Some(now);
        Permit::new(self.generation)
    }

    fn is_current(&self, permit: Permit) -> bool {
        permit.generation() == self.generation
    }
}

/// Circuit breaker guarding a single dependency.
///
/// Admission and outcome recording each run inside one critical section, so only one
/// caller can ever hold the HalfOpen trial. Outcomes are reported with the [`Permit`]
/// the admission returned; in HalfOpen only the trial's permit moves the state, and
/// outcomes from attempts admitted before the last transition are dropped. A trial
/// that never reports back (the caller dropped the future) is considered abandoned
/// after `reset_timeout` and handed to the next caller.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
    transitions: broadcast::Sender<StateTransition>,
    metrics: Option<ResilienceMetrics>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner::closed()),
            transitions,
            metrics: None,
        }
    }

    /// Publish transitions to the provided metrics handle.
    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state as last transitioned. An Open breaker whose reset timeout has
    /// elapsed still reports Open until the next admission attempt probes it.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Receive every subsequent state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Time until an Open breaker admits its trial; `None` unless Open.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => Some(self.remaining(inner.opened_at, self.clock.now())),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        }
    }

    /// Decide whether a request may invoke the wrapped operation.
    pub fn try_acquire(&self) -> Admission {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Admitted(Permit::new(inner.generation)),
            CircuitState::Open => {
                if self.elapsed(inner.opened_at, now) {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    Admission::Admitted(inner.issue_trial(now))
                } else {
                    Admission::Rejected {
                        retry_after: self.remaining(inner.opened_at, now),
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_started_at.is_none() || self.elapsed(inner.trial_started_at, now)
                {
                    if inner.trial_started_at.is_some() {
                        warn!("half-open trial abandoned; admitting a new trial");
                    }
                    Admission::Admitted(inner.issue_trial(now))
                } else {
                    Admission::Rejected {
                        retry_after: self.remaining(inner.trial_started_at, now),
                    }
                }
            }
        }
    }

    /// Report a successful invocation admitted with `permit`.
    pub fn on_success(&self, permit: Permit) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if !inner.is_current(permit) {
            debug!(state = %inner.state, "ignoring success from an earlier admission");
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Closed, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Report a failed invocation admitted with `permit`.
    pub fn on_failure(&self, permit: Permit) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if !inner.is_current(permit) {
            debug!(state = %inner.state, "ignoring failure from an earlier admission");
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                let failures = self.register_failure(&mut inner, now);
                if failures >= self.config.failure_threshold {
                    warn!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "failure threshold reached"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to Closed and forget recorded failures.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, now);
        }
        let generation = inner.generation.wrapping_add(1);
        *inner = BreakerInner::closed();
        inner.generation = generation;
    }

    fn register_failure(&self, inner: &mut BreakerInner, now: DateTime<Utc>) -> u32 {
        match self.config.failure_window {
            None => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.consecutive_failures
            }
            Some(window) => {
                let cutoff = now - to_chrono(window);
                inner.failure_times.push_back(now);
                while inner
                    .failure_times
                    .front()
                    .is_some_and(|oldest| *oldest < cutoff)
                {
                    inner.failure_times.pop_front();
                }
                u32::try_from(inner.failure_times.len()).unwrap_or(u32::MAX)
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: DateTime<Utc>) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.generation = inner.generation.wrapping_add(1);
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                inner.trial_started_at = None;
                warn!(from = %from, to = %to, reset_timeout_ms = self.config.reset_timeout.as_millis() as u64, "circuit opened");
            }
            CircuitState::HalfOpen => {
                info!(from = %from, to = %to, "circuit half-open; probing recovery");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.trial_started_at = None;
                inner.consecutive_failures = 0;
                inner.failure_times.clear();
                info!(from = %from, to = %to, "circuit closed");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(from, to);
        }
        // Nobody listening is fine.
        let _ = self.transitions.send(StateTransition { from, to, at: now });
    }

    fn elapsed(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match since {
            Some(since) => now - since >= to_chrono(self.config.reset_timeout),
            None => true,
        }
    }

    fn remaining(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        let Some(since) = since else {
            return Duration::ZERO;
        };
        let deadline = since + to_chrono(self.config.reset_timeout);
        (deadline - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl AttemptHook for CircuitBreaker {
    fn admit(&self, _attempt: u32) -> Admission {
        self.try_acquire()
    }

    fn complete(&self, permit: Permit, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::Succeeded => self.on_success(permit),
            AttemptOutcome::Failed { .. } => self.on_failure(permit),
        }
    }

    fn record(&self, _delta: CircuitMetricsSnapshot) {}
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rah_common::time::ManualClock;

    fn breaker(threshold: u32, reset: Duration) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::default();
        let config = BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: reset,
            failure_window: None,
        };
        (CircuitBreaker::new(config, clock.shared()), clock)
    }

    fn admit(breaker: &CircuitBreaker) -> Permit {
        breaker.try_acquire().permit().expect("breaker should admit")
    }

    fn fail(breaker: &CircuitBreaker) {
        let permit = admit(breaker);
        breaker.on_failure(permit);
    }

    fn succeed(breaker: &CircuitBreaker) {
        let permit = admit(breaker);
        breaker.on_success(permit);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let (breaker, _clock) = breaker(3, Duration::from_secs(5));
        for _ in 0..2 {
            fail(&breaker);
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.try_acquire(),
            Admission::Rejected { retry_after } if retry_after == Duration::from_secs(5)
        ));
    }

    #[test]
    fn success_resets_consecutive_count() {
        let (breaker, _clock) = breaker(2, Duration::from_secs(5));
        fail(&breaker);
        succeed(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_success_closes() {
        let (breaker, clock) = breaker(2, Duration::from_secs(5));
        fail(&breaker);
        fail(&breaker);
        clock.advance(Duration::from_secs(5));

        let trial = admit(&breaker);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_success(trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_admitted());
    }

    #[test]
    fn half_open_failure_reopens() {
        let (breaker, clock) = breaker(2, Duration::from_secs(5));
        fail(&breaker);
        fail(&breaker);
        clock.advance(Duration::from_secs(5));

        let trial = admit(&breaker);
        breaker.on_failure(trial);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));
    }

    #[test]
    fn only_one_half_open_trial_is_admitted() {
        let (breaker, clock) = breaker(1, Duration::from_secs(5));
        fail(&breaker);
        clock.advance(Duration::from_secs(6));

        assert!(breaker.try_acquire().is_admitted());
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));
    }

    #[test]
    fn late_success_from_closed_admission_does_not_end_trial() {
        let (breaker, clock) = breaker(1, Duration::from_secs(5));
        let slow = admit(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(5));
        let trial = admit(&breaker);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.on_success(slow);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(breaker.try_acquire(), Admission::Rejected { .. }));

        breaker.on_success(trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn late_failure_from_closed_admission_does_not_reopen() {
        let (breaker, clock) = breaker(1, Duration::from_secs(5));
        let slow = admit(&breaker);
        fail(&breaker);

        clock.advance(Duration::from_secs(5));
        let trial = admit(&breaker);
        breaker.on_failure(slow);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.on_failure(trial);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn abandoned_trial_is_reissued_after_reset_timeout() {
        let (breaker, clock) = breaker(1, Duration::from_secs(5));
        fail(&breaker);
        clock.advance(Duration::from_secs(5));
        let abandoned = admit(&breaker);

        clock.advance(Duration::from_secs(5));
        let trial = admit(&breaker);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.on_success(abandoned);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_success(trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn windowed_mode_ignores_stale_failures() {
        let clock = ManualClock::default();
        let config = BreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(5),
            failure_window: Some(Duration::from_secs(10)),
        };
        let breaker = CircuitBreaker::new(config, clock.shared());

        fail(&breaker);
        clock.advance(Duration::from_secs(11));
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);

        clock.advance(Duration::from_secs(1));
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn transitions_are_broadcast_in_order() {
        let (breaker, clock) = breaker(1, Duration::from_millis(10));
        let mut rx = breaker.subscribe();

        fail(&breaker);
        clock.advance(Duration::from_millis(20));
        succeed(&breaker);

        let observed: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            observed,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn reset_forces_closed() {
        let (breaker, _clock) = breaker(1, Duration::from_secs(60));
        let before_reset = admit(&breaker);
        fail(&breaker);
        assert!(breaker.retry_after().is_some());
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.retry_after(), None);

        breaker.on_failure(before_reset);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
