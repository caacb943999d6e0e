//! ---
//! rah_section: "01-core-functionality"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Shared primitives and utilities for the core runtime."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
//! Core shared primitives for the RAH resilience workspace.
//! This crate exposes configuration loading, logging, and the clock
//! abstraction consumed by the breaker and the history store.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AlertRuleSeed, AlertsConfig, ApiConfig, AppConfig, BreakerConfig, FailureCounting,
    HistoryConfig, LoggingConfig, MetricsConfig, ResilienceConfig, RetryConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{Clock, ManualClock, SharedClock, SystemClock};
