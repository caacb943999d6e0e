//! ---
//! rah_section: "01-core-functionality"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Shared primitives and utilities for the core runtime."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8787))
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_jitter() -> Duration {
    Duration::from_millis(100)
}

fn default_true() -> bool {
    true
}

fn default_retriable_status_codes() -> Vec<u16> {
    vec![429, 503, 504]
}

fn default_history_max_entries() -> usize {
    300
}

fn default_history_horizon() -> Duration {
    Duration::from_secs(3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_alert_events() -> usize {
    200
}

fn default_alert_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_alert_severity() -> String {
    "warning".to_owned()
}

/// Primary configuration object for the RAH runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "RAH_CONFIG";

    /// Load configuration from disk, respecting the `RAH_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.resilience.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

/// Settings for the circuit breaker, retry loop, history retention, and alerting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<()> {
        self.breaker.validate()?;
        self.retry.validate()?;
        self.history.validate()?;
        Ok(())
    }
}

/// Trip and recovery thresholds for the circuit breaker.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures needed to move Closed -> Open.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent Open before a HalfOpen trial is admitted.
    #[serde(rename = "reset_timeout_ms", default = "default_reset_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reset_timeout: Duration,
    /// When set, failures are counted inside this rolling window instead of consecutively.
    #[serde(rename = "failure_window_ms", default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub failure_window: Option<Duration>,
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow!("breaker failure_threshold must be at least 1"));
        }
        if matches!(self.failure_window, Some(window) if window.is_zero()) {
            return Err(anyhow!("breaker failure_window_ms must be positive when set"));
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
            failure_window: None,
        }
    }
}

/// How failed retry attempts contribute to the failure counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCounting {
    /// Every failed attempt is counted, exposing the cost of retries.
    #[default]
    PerAttempt,
    /// Only the final surfaced failure is counted.
    Terminal,
}

/// Retry budget, backoff schedule, and fault classification switches.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(rename = "jitter_ms", default = "default_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
    #[serde(rename = "attempt_timeout_ms", default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub attempt_timeout: Option<Duration>,
    #[serde(default)]
    pub counting: FailureCounting,
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
    #[serde(default = "default_true")]
    pub retry_on_unavailable: bool,
    #[serde(default = "default_retriable_status_codes")]
    pub retriable_status_codes: Vec<u16>,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("retry max_attempts must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(anyhow!(
                "retry base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay.as_millis(),
                self.max_delay.as_millis()
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            attempt_timeout: None,
            counting: FailureCounting::default(),
            retry_on_timeout: true,
            retry_on_unavailable: true,
            retriable_status_codes: default_retriable_status_codes(),
        }
    }
}

/// Retention bounds for the metrics history store.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_max_entries")]
    pub max_entries: usize,
    #[serde(rename = "horizon_secs", default = "default_history_horizon")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub horizon: Duration,
    #[serde(rename = "sweep_interval_secs", default = "default_sweep_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sweep_interval: Duration,
}

impl HistoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(anyhow!("history max_entries must be at least 1"));
        }
        if self.horizon.is_zero() {
            return Err(anyhow!("history horizon_secs must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(anyhow!("history sweep_interval_secs must be positive"));
        }
        Ok(())
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_history_max_entries(),
            horizon: default_history_horizon(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_max_alert_events")]
    pub max_events: usize,
    #[serde(default)]
    pub rules: Vec<AlertRuleSeed>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_alert_events(),
            rules: Vec::new(),
        }
    }
}

/// Alert rule declared in configuration and installed at startup.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleSeed {
    pub name: String,
    #[serde(default)]
    pub failure_threshold: u64,
    #[serde(default)]
    pub rejected_threshold: u64,
    #[serde(rename = "window_secs", default = "default_alert_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub window: Duration,
    #[serde(default = "default_alert_severity")]
    pub severity: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.resilience.breaker.failure_threshold, 3);
        assert_eq!(config.resilience.breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.resilience.retry.max_attempts, 3);
        assert_eq!(config.resilience.retry.counting, FailureCounting::PerAttempt);
        assert_eq!(config.resilience.retry.retriable_status_codes, vec![429, 503, 504]);
        assert_eq!(config.resilience.history.max_entries, 300);
        assert_eq!(config.resilience.history.horizon, Duration::from_secs(3600));
        assert!(config.api.enabled);
    }

    #[test]
    fn parses_resilience_sections() {
        let config: AppConfig = r#"
            [resilience.breaker]
            failure_threshold = 5
            reset_timeout_ms = 1500
            failure_window_ms = 60000

            [resilience.retry]
            max_attempts = 4
            base_delay_ms = 10
            max_delay_ms = 80
            jitter_ms = 0
            attempt_timeout_ms = 2000
            counting = "terminal"
            retriable_status_codes = [503]

            [resilience.history]
            max_entries = 50
            horizon_secs = 600

            [[resilience.alerts.rules]]
            name = "rejections"
            rejected_threshold = 10
            window_secs = 300
            severity = "critical"
        "#
        .parse()
        .unwrap();

        let breaker = &config.resilience.breaker;
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.reset_timeout, Duration::from_millis(1500));
        assert_eq!(breaker.failure_window, Some(Duration::from_secs(60)));

        let retry = &config.resilience.retry;
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.max_delay, Duration::from_millis(80));
        assert_eq!(retry.attempt_timeout, Some(Duration::from_secs(2)));
        assert_eq!(retry.counting, FailureCounting::Terminal);
        assert_eq!(retry.retriable_status_codes, vec![503]);

        assert_eq!(config.resilience.history.max_entries, 50);
        assert_eq!(config.resilience.alerts.rules.len(), 1);
        assert_eq!(config.resilience.alerts.rules[0].window, Duration::from_secs(300));
    }

    #[test]
    fn rejects_zero_attempt_budget() {
        let err = r#"
            [resilience.retry]
            max_attempts = 0
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(format!("{err:#}").contains("max_attempts"));
    }

    #[test]
    fn rejects_base_delay_above_cap() {
        let err = r#"
            [resilience.retry]
            base_delay_ms = 900
            max_delay_ms = 100
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(format!("{err:#}").contains("exceeds"));
    }
}
