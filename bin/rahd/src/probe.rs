//! ---
//! rah_section: "01-core-functionality"
//! rah_subsection: "binary"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "HTTP health probe driven through the guarded executor."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rah_resilience::{OperationFault, PolicyClassifier, ResilienceExecutor, RetryPolicy};
use reqwest::{Client, StatusCode};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Issues GET requests against a single upstream URL.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build probe http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One request; non-success statuses become [`OperationFault::Status`].
    pub async fn call(&self) -> Result<u16, OperationFault> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(request_fault)?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(status_fault(status))
        }
    }
}

fn request_fault(err: reqwest::Error) -> OperationFault {
    if err.is_timeout() {
        OperationFault::Timeout(err.to_string())
    } else if err.is_connect() {
        OperationFault::Unavailable(err.to_string())
    } else if let Some(status) = err.status() {
        status_fault(status)
    } else {
        OperationFault::Other(err.to_string())
    }
}

fn status_fault(status: StatusCode) -> OperationFault {
    OperationFault::Status {
        code: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_owned(),
    }
}

/// Probe the upstream every `every` until `cancel` fires.
pub async fn run_probe(
    probe: HttpProbe,
    executor: Arc<ResilienceExecutor<PolicyClassifier>>,
    policy: RetryPolicy,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(url = probe.url(), interval_secs = every.as_secs(), "upstream probe started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match executor.execute(|_| probe.call(), &policy, &cancel).await {
                    Ok(status) => debug!(url = probe.url(), status, "probe succeeded"),
                    Err(err) => warn!(
                        url = probe.url(),
                        code = err.code(),
                        attempts = err.attempts(),
                        error = %err,
                        "probe failed"
                    ),
                }
            }
        }
    }
    info!("upstream probe stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rah_resilience::{FailureClassifier, FaultClass};

    #[test]
    fn throttling_statuses_are_retryable() {
        let classifier = PolicyClassifier::default();
        let throttled = status_fault(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(classifier.classify(&throttled), FaultClass::Transient);
        let missing = status_fault(StatusCode::NOT_FOUND);
        assert_eq!(classifier.classify(&missing), FaultClass::Fatal);
        assert_eq!(missing.to_string(), "status 404: Not Found");
    }
}
