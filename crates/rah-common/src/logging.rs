//! ---
//! rah_section: "01-core-functionality"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Tracing setup shared by the resilience daemon and its HTTP surface."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "RAH_LOG";
/// Breaker transitions and retry warnings at `info`; connection chatter from the
/// HTTP stack stays at `warn` so probe traffic does not drown them out.
const DEFAULT_DIRECTIVE: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the global subscriber for `rahd`.
///
/// `RAH_LOG` takes precedence over `RUST_LOG`; with neither set the daemon logs its own
/// crates at `info`. Stdout follows `config.format`. The daily file under
/// `config.directory` is always JSON so circuit transitions can be replayed from it.
/// Calling this twice keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());

    let file_appender = daily(&config.directory, format!("{}.log", prefix));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let filter = resolve_filter(
        std::env::var(LOG_ENV)
            .ok()
            .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok()),
    );

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, "tracing initialised");
    Ok(())
}

fn resolve_filter(directive: Option<String>) -> EnvFilter {
    match directive {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid log directive {directive:?} ({err}); using {DEFAULT_DIRECTIVE}");
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        None => EnvFilter::new(DEFAULT_DIRECTIVE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: dir.path().join("logs"),
            format: LogFormat::Pretty,
            file_prefix: Some("rah-test".into()),
        };
        init_tracing("rah-test", &config).unwrap();
        assert!(config.directory.is_dir());
    }

    #[test]
    fn filter_falls_back_to_default_directive() {
        let default = resolve_filter(None).to_string();
        assert!(default.contains("hyper=warn"));
        assert_eq!(
            resolve_filter(Some("rah_resilience=loud".into())).to_string(),
            default
        );
        assert_eq!(
            resolve_filter(Some("rah_resilience=debug".into())).to_string(),
            "rah_resilience=debug"
        );
    }
}
