//! ---
//! rah_section: "01-core-functionality"
//! rah_subsection: "binary"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Binary entrypoint for the RAH resilience daemon."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
mod probe;
mod sweeper;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use rah_api::{spawn_api_server, ApiServer, ApiState};
use rah_common::config::AppConfig;
use rah_common::logging::init_tracing;
use rah_common::time::SystemClock;
use rah_metrics::{new_registry, DaemonMetrics, SharedRegistry};
use rah_resilience::{
    CircuitBreaker, MetricsRecorder, PolicyClassifier, ResilienceAlertStore, ResilienceExecutor,
    ResilienceHistoryStore, ResilienceMetrics, RetentionPolicy, RetryExecutor, RetryPolicy,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::probe::{run_probe, HttpProbe};
use crate::sweeper::run_sweeper;

#[derive(Debug, Parser)]
#[command(author, version, about = "RAH resilience daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "URL",
        help = "Periodically probe this URL through the guarded executor"
    )]
    probe_url: Option<String>,

    #[arg(long, default_value_t = 15, help = "Seconds between upstream probes")]
    probe_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/rahd.toml"));
    candidates.push(PathBuf::from("configs/example.toml"));

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let config = loaded_config.config;
    let load_duration = load_started.elapsed();

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();

    init_tracing("rahd", &config.logging)?;
    info!(config_path = %loaded_config.source.display(), "configuration loaded");

    run_daemon(config, metrics_registry, cli).await
}

async fn run_daemon(config: AppConfig, registry: SharedRegistry, cli: Cli) -> Result<()> {
    let clock = SystemClock::shared();
    let registry = if config.metrics.enabled {
        Some(registry)
    } else {
        info!("metrics disabled by configuration");
        None
    };
    let metrics = registry
        .clone()
        .map(ResilienceMetrics::new)
        .transpose()?;

    let resilience = &config.resilience;
    let policy = RetryPolicy::from(&resilience.retry);
    policy.validate()?;

    let mut store = ResilienceHistoryStore::new(
        RetentionPolicy::from(&resilience.history),
        clock.clone(),
    );
    let mut breaker = CircuitBreaker::new(resilience.breaker.clone(), clock.clone());
    let mut alerts = ResilienceAlertStore::from_config(&resilience.alerts);
    let mut retry = RetryExecutor::new(PolicyClassifier::from(&resilience.retry));
    if let Some(metrics) = &metrics {
        store = store.with_metrics(metrics.clone());
        breaker = breaker.with_metrics(metrics.clone());
        alerts = alerts.with_metrics(metrics.clone());
        retry = retry.with_metrics(metrics.clone());
    }
    let store = Arc::new(store);
    let breaker = Arc::new(breaker);
    let alerts = Arc::new(alerts);
    let mut recorder = MetricsRecorder::new(store.clone(), clock.clone());
    if let Some(metrics) = &metrics {
        recorder = recorder.with_metrics(metrics.clone());
    }
    let recorder = Arc::new(recorder);
    let executor = Arc::new(ResilienceExecutor::new(
        breaker.clone(),
        recorder.clone(),
        retry,
    ));

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(run_sweeper(
        store.clone(),
        alerts.clone(),
        clock.clone(),
        resilience.history.sweep_interval,
        cancel.clone(),
    ));

    let prober = match &cli.probe_url {
        Some(url) => {
            let timeout = policy
                .attempt_timeout
                .unwrap_or(Duration::from_secs(10));
            let probe = HttpProbe::new(url.clone(), timeout)?;
            Some(tokio::spawn(run_probe(
                probe,
                executor.clone(),
                policy.clone(),
                Duration::from_secs(cli.probe_interval_secs.max(1)),
                cancel.clone(),
            )))
        }
        None => None,
    };

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let mut state = ApiState::new(recorder.clone(), breaker.clone(), alerts.clone(), clock.clone());
        if let Some(registry) = registry.clone() {
            state = state.with_registry(registry);
        }
        match spawn_api_server(Arc::new(state), config.api.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "api server listening");
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %err, "failed to start api server");
            }
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!(state = %breaker.state(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    cancel.cancel();

    if let Err(err) = sweeper.await {
        warn!(error = %err, "retention sweeper task failed");
    }
    if let Some(prober) = prober {
        if let Err(err) = prober.await {
            warn!(error = %err, "probe task failed");
        }
    }
    if let Some(server) = api_server {
        server.shutdown().await?;
    }

    let flushed = store.flush();
    info!(flushed, totals = ?recorder.totals(), "history store flushed");
    Ok(())
}
