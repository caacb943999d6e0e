//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Guarded execution, circuit breaking, and outcome history."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---

pub mod alerts;
pub mod breaker;
pub mod classifier;
pub mod error;
pub mod executor;
pub mod history;
pub mod metrics;
pub mod recorder;
pub mod retry;
pub mod snapshot;

pub use alerts::{AlertEvent, AlertRule, AlertSeverity, ResilienceAlertStore};
pub use breaker::{CircuitBreaker, CircuitState, StateTransition};
pub use classifier::{
    AttemptResult, FailureClassifier, FaultClass, OperationFault, PolicyClassifier, TimeoutFault,
};
pub use error::{ConfigurationError, ExecutionError};
pub use executor::ResilienceExecutor;
pub use history::{Bucket, HistoryEntry, ResilienceHistoryStore, RetentionPolicy};
pub use metrics::ResilienceMetrics;
pub use recorder::MetricsRecorder;
pub use retry::{
    Admission, AttemptHook, AttemptOutcome, NoHooks, Permit, RetryExecutor, RetryPolicy,
};
pub use snapshot::CircuitMetricsSnapshot;

/// Crate prelude collecting the types needed to guard an operation.
pub mod prelude {
    pub use super::breaker::{CircuitBreaker, CircuitState};
    pub use super::classifier::{FailureClassifier, FaultClass, OperationFault, PolicyClassifier};
    pub use super::error::{ConfigurationError, ExecutionError};
    pub use super::executor::ResilienceExecutor;
    pub use super::history::{Bucket, ResilienceHistoryStore, RetentionPolicy};
    pub use super::metrics::ResilienceMetrics;
    pub use super::recorder::MetricsRecorder;
    pub use super::retry::{RetryExecutor, RetryPolicy};
    pub use super::snapshot::CircuitMetricsSnapshot;
}
