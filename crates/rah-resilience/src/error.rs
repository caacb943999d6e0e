//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Error taxonomy for guarded execution and history queries."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

/// Invalid parameters supplied to a history query or an execution policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// The maximum bucket count must be at least one.
    #[error("limit must be greater than zero")]
    InvalidLimit,
    /// Bucket width must be at least one minute.
    #[error("bucket width must be greater than zero minutes")]
    InvalidBucketWidth,
    /// Retry or breaker policy is internally inconsistent.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

impl ConfigurationError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        "configuration_error"
    }
}

/// Failure surfaced by a guarded invocation.
///
/// `E` is the caller's fault type; it is carried unchanged so callers can inspect the
/// last fault the operation produced.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError<E>
where
    E: fmt::Debug + fmt::Display,
{
    /// The circuit was open; the operation was not invoked.
    #[error("circuit open; retry after {}ms", .retry_after.as_millis())]
    CircuitOpen {
        /// Time remaining until the breaker admits a trial request.
        retry_after: Duration,
    },
    /// The operation raised a non-retryable fault.
    #[error("fatal fault after {attempts} attempt(s): {fault}")]
    Fatal {
        /// Attempts made, including the failing one.
        attempts: u32,
        /// Fault raised by the final attempt.
        fault: E,
    },
    /// Every attempt raised a transient fault.
    #[error("retries exhausted after {attempts} attempt(s): {fault}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Fault raised by the final attempt.
        fault: E,
    },
    /// The caller cancelled the invocation while it was waiting to retry.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

impl<E> ExecutionError<E>
where
    E: fmt::Debug + fmt::Display,
{
    /// Stable machine-readable code for API and CLI renderers.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::CircuitOpen { .. } => "circuit_open",
            ExecutionError::Fatal { .. } => "fatal_fault",
            ExecutionError::Exhausted { .. } => "retries_exhausted",
            ExecutionError::Cancelled { .. } => "cancelled",
        }
    }

    /// Number of times the operation was invoked before the error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            ExecutionError::CircuitOpen { .. } => 0,
            ExecutionError::Fatal { attempts, .. }
            | ExecutionError::Exhausted { attempts, .. }
            | ExecutionError::Cancelled { attempts } => *attempts,
        }
    }

    /// The fault produced by the operation, when one was observed.
    pub fn fault(&self) -> Option<&E> {
        match self {
            ExecutionError::Fatal { fault, .. } | ExecutionError::Exhausted { fault, .. } => {
                Some(fault)
            }
            ExecutionError::CircuitOpen { .. } | ExecutionError::Cancelled { .. } => None,
        }
    }

    /// Whether the request was shed by the breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ExecutionError::CircuitOpen { .. })
    }
}
