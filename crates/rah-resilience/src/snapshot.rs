//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Outcome counter tuples recorded per guarded invocation."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Outcome counters observed since the previously recorded snapshot.
///
/// Snapshots are deltas: adding two snapshots yields the element-wise sum, which is
/// how buckets and cumulative totals are built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitMetricsSnapshot {
    /// Attempts that returned successfully.
    pub success_count: u64,
    /// Attempts that failed with a non-timeout fault.
    pub failure_count: u64,
    /// Attempts that failed with a timeout-class fault.
    pub timeout_count: u64,
    /// Requests shed by an open circuit without invoking the operation.
    pub rejected_count: u64,
}

impl CircuitMetricsSnapshot {
    /// Construct a snapshot from explicit counter values.
    pub const fn new(
        success_count: u64,
        failure_count: u64,
        timeout_count: u64,
        rejected_count: u64,
    ) -> Self {
        Self {
            success_count,
            failure_count,
            timeout_count,
            rejected_count,
        }
    }

    /// Delta for a single successful attempt.
    pub const fn success() -> Self {
        Self::new(1, 0, 0, 0)
    }

    /// Delta for a single failed attempt.
    pub const fn failure() -> Self {
        Self::new(0, 1, 0, 0)
    }

    /// Delta for a single timed-out attempt.
    pub const fn timeout() -> Self {
        Self::new(0, 0, 1, 0)
    }

    /// Delta for a single request rejected while the circuit was open.
    pub const fn rejected() -> Self {
        Self::new(0, 0, 0, 1)
    }

    /// Sum of all counters.
    pub const fn total(&self) -> u64 {
        self.success_count + self.failure_count + self.timeout_count + self.rejected_count
    }

    /// Whether every counter is zero.
    pub const fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Failures including timeouts; rejections are excluded because they never reached
    /// the wrapped operation.
    pub const fn faults(&self) -> u64 {
        self.failure_count + self.timeout_count
    }
}

impl Add for CircuitMetricsSnapshot {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            success_count: self.success_count.saturating_add(rhs.success_count),
            failure_count: self.failure_count.saturating_add(rhs.failure_count),
            timeout_count: self.timeout_count.saturating_add(rhs.timeout_count),
            rejected_count: self.rejected_count.saturating_add(rhs.rejected_count),
        }
    }
}

impl AddAssign for CircuitMetricsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for CircuitMetricsSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl<'a> Sum<&'a CircuitMetricsSnapshot> for CircuitMetricsSnapshot {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}
