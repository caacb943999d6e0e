//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Transient versus fatal fault classification."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::time::Duration;

use rah_common::config::RetryConfig;

/// Retryability of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// Expected to resolve on its own; another attempt may succeed.
    Transient,
    /// Retrying cannot help; surface immediately.
    Fatal,
}

impl FaultClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultClass::Transient => "transient",
            FaultClass::Fatal => "fatal",
        }
    }
}

/// Result of one attempt after classification.
#[derive(Debug)]
pub enum AttemptResult<T, E> {
    Success(T),
    Transient(E),
    Fatal(E),
}

impl<T, E> AttemptResult<T, E> {
    /// Tag an operation result using the supplied classifier.
    pub fn classify<C>(result: Result<T, E>, classifier: &C) -> Self
    where
        C: FailureClassifier<E> + ?Sized,
    {
        match result {
            Ok(value) => AttemptResult::Success(value),
            Err(fault) => match classifier.classify(&fault) {
                FaultClass::Transient => AttemptResult::Transient(fault),
                FaultClass::Fatal => AttemptResult::Fatal(fault),
            },
        }
    }
}

/// Decides whether a fault raised by an operation is worth retrying.
pub trait FailureClassifier<E>: Send + Sync {
    fn classify(&self, fault: &E) -> FaultClass;

    /// Whether the fault is timeout-class; such faults increment the timeout counter
    /// rather than the failure counter.
    fn is_timeout(&self, _fault: &E) -> bool {
        false
    }
}

impl<E, F> FailureClassifier<E> for F
where
    F: Fn(&E) -> FaultClass + Send + Sync,
{
    fn classify(&self, fault: &E) -> FaultClass {
        self(fault)
    }
}

/// Fault types that can describe an attempt cut short by the per-attempt timeout.
pub trait TimeoutFault {
    fn elapsed(limit: Duration) -> Self;
}

impl TimeoutFault for String {
    fn elapsed(limit: Duration) -> Self {
        format!("attempt timed out after {}ms", limit.as_millis())
    }
}

impl TimeoutFault for anyhow::Error {
    fn elapsed(limit: Duration) -> Self {
        anyhow::anyhow!("attempt timed out after {}ms", limit.as_millis())
    }
}

/// Ready-made fault type for provider calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationFault {
    /// The call did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The provider could not be reached or refused the connection.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// The provider answered with an error status code.
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },
    /// Anything else; treated as fatal.
    #[error("{0}")]
    Other(String),
}

impl TimeoutFault for OperationFault {
    fn elapsed(limit: Duration) -> Self {
        OperationFault::Timeout(format!("attempt exceeded {}ms", limit.as_millis()))
    }
}

/// Classifies [`OperationFault`] according to the retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyClassifier {
    pub retry_on_timeout: bool,
    pub retry_on_unavailable: bool,
    pub retriable_status_codes: Vec<u16>,
}

impl Default for PolicyClassifier {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for PolicyClassifier {
    fn from(config: &RetryConfig) -> Self {
        Self {
            retry_on_timeout: config.retry_on_timeout,
            retry_on_unavailable: config.retry_on_unavailable,
            retriable_status_codes: config.retriable_status_codes.clone(),
        }
    }
}

impl FailureClassifier<OperationFault> for PolicyClassifier {
    fn classify(&self, fault: &OperationFault) -> FaultClass {
        let transient = match fault {
            OperationFault::Timeout(_) => self.retry_on_timeout,
            OperationFault::Unavailable(_) => self.retry_on_unavailable,
            OperationFault::Status { code, .. } => self.retriable_status_codes.contains(code),
            OperationFault::Other(_) => false,
        };
        if transient {
            FaultClass::Transient
        } else {
            FaultClass::Fatal
        }
    }

    fn is_timeout(&self, fault: &OperationFault) -> bool {
        matches!(fault, OperationFault::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> OperationFault {
        OperationFault::Status {
            code,
            message: "upstream".into(),
        }
    }

    #[test]
    fn default_policy_retries_timeouts_and_throttling() {
        let classifier = PolicyClassifier::default();
        assert_eq!(
            classifier.classify(&OperationFault::Timeout("slow".into())),
            FaultClass::Transient
        );
        assert_eq!(
            classifier.classify(&OperationFault::Unavailable("refused".into())),
            FaultClass::Transient
        );
        assert_eq!(classifier.classify(&status(429)), FaultClass::Transient);
        assert_eq!(classifier.classify(&status(503)), FaultClass::Transient);
        assert_eq!(classifier.classify(&status(400)), FaultClass::Fatal);
        assert_eq!(
            classifier.classify(&OperationFault::Other("bad prompt".into())),
            FaultClass::Fatal
        );
    }

    #[test]
    fn switches_disable_retry_classes() {
        let classifier = PolicyClassifier {
            retry_on_timeout: false,
            retry_on_unavailable: false,
            retriable_status_codes: Vec::new(),
        };
        assert_eq!(
            classifier.classify(&OperationFault::Timeout("slow".into())),
            FaultClass::Fatal
        );
        assert_eq!(classifier.classify(&status(503)), FaultClass::Fatal);
        assert!(classifier.is_timeout(&OperationFault::Timeout("slow".into())));
    }

    #[test]
    fn closures_act_as_classifiers() {
        let classifier = |fault: &String| {
            if fault.starts_with("retry") {
                FaultClass::Transient
            } else {
                FaultClass::Fatal
            }
        };
        let tagged: AttemptResult<(), String> =
            AttemptResult::classify(Err("retry later".to_owned()), &classifier);
        assert!(matches!(tagged, AttemptResult::Transient(_)));
        let tagged: AttemptResult<(), String> =
            AttemptResult::classify(Err("denied".to_owned()), &classifier);
        assert!(matches!(tagged, AttemptResult::Fatal(_)));
        let tagged: AttemptResult<u8, String> = AttemptResult::classify(Ok(7), &classifier);
        assert!(matches!(tagged, AttemptResult::Success(7)));
    }
}
