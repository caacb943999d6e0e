//! ---
//! rah_section: "05-networking-external-interfaces"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "HTTP surface for resilience totals, history, and alerts."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rah_common::time::{to_chrono, SharedClock};
use rah_metrics::SharedRegistry;
use rah_resilience::{
    AlertEvent, AlertRule, Bucket, CircuitBreaker, CircuitMetricsSnapshot, CircuitState,
    ConfigurationError, MetricsRecorder, ResilienceAlertStore,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_HISTORY_LIMIT: i64 = 300;
const DEFAULT_BUCKET_MINUTES: i64 = 1;
const DEFAULT_ALERT_LIMIT: usize = 50;

/// Components the HTTP handlers read from.
pub struct ApiState {
    recorder: Arc<MetricsRecorder>,
    breaker: Arc<CircuitBreaker>,
    alerts: Arc<ResilienceAlertStore>,
    clock: SharedClock,
    registry: Option<SharedRegistry>,
}

impl ApiState {
    pub fn new(
        recorder: Arc<MetricsRecorder>,
        breaker: Arc<CircuitBreaker>,
        alerts: Arc<ResilienceAlertStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            recorder,
            breaker,
            alerts,
            clock,
            registry: None,
        }
    }

    /// Serve the registry at `/metrics`.
    pub fn with_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    fn summary(&self) -> ResilienceSummary {
        let state = self.breaker.state();
        ResilienceSummary {
            circuit_state: state,
            retry_after_seconds: self.breaker.retry_after().map(|after| after.as_secs_f64()),
            totals: self.recorder.totals(),
            history_entries: self.recorder.store().len(),
        }
    }
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState")
            .field("breaker", &self.breaker)
            .field("metrics", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    /// Address actually bound; differs from the requested one when port 0 was used.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Build the resilience router without binding a listener.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/metrics/resilience", get(get_summary))
        .route("/metrics/resilience/history", get(get_history))
        .route("/metrics/resilience/alerts", get(get_alerts))
        .route("/metrics/resilience/alerts/:id/ack", post(post_ack))
        .route("/metrics/resilience/reset", post(post_reset))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve the resilience API until shutdown is requested.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let bound = listener
        .local_addr()
        .context("failed to read bound API address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;
    let app = router(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %bound, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %bound, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Error body shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "server_error",
        }
    }
}

impl From<ConfigurationError> for ApiError {
    fn from(err: ConfigurationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
        });
        (self.status(), body).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResilienceSummary {
    circuit_state: CircuitState,
    retry_after_seconds: Option<f64>,
    totals: CircuitMetricsSnapshot,
    history_entries: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<i64>,
    bucket_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    items: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AlertsResponse {
    rules: Vec<AlertRule>,
    items: Vec<AlertEvent>,
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Result<Response, ApiError> {
    let Some(registry) = &state.registry else {
        return Err(ApiError::NotFound("metrics are disabled".into()));
    };
    let body = rah_metrics::encode_text(registry)
        .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
    Ok((
        [(header::CONTENT_TYPE, rah_metrics::text_format_type())],
        body,
    )
        .into_response())
}

async fn get_summary(State(state): State<Arc<ApiState>>) -> Json<ResilienceSummary> {
    Json(state.summary())
}

async fn get_history(
    State(state): State<Arc<ApiState>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(query) = query?;
    let store = state.recorder.store();
    let end = query.end.unwrap_or_else(|| state.clock.now());
    let start = query
        .start
        .unwrap_or_else(|| end - to_chrono(store.horizon()));
    if start > end {
        return Err(ApiError::BadRequest("start must not be after end".into()));
    }

    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let limit = usize::try_from(limit)
        .ok()
        .filter(|limit| *limit > 0)
        .ok_or(ConfigurationError::InvalidLimit)?;
    let bucket_minutes = query.bucket_minutes.unwrap_or(DEFAULT_BUCKET_MINUTES);
    let bucket_minutes = u32::try_from(bucket_minutes)
        .ok()
        .filter(|minutes| *minutes > 0)
        .ok_or(ConfigurationError::InvalidBucketWidth)?;

    let items = store.snapshot_range(start, end, limit, bucket_minutes)?;
    Ok(Json(HistoryResponse { start, end, items }))
}

async fn get_alerts(
    State(state): State<Arc<ApiState>>,
    query: Result<Query<AlertsQuery>, QueryRejection>,
) -> Result<Json<AlertsResponse>, ApiError> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_ALERT_LIMIT);
    Ok(Json(AlertsResponse {
        rules: state.alerts.list_rules(),
        items: state.alerts.list_events(limit),
    }))
}

async fn post_ack(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<AlertEvent>, ApiError> {
    state
        .alerts
        .acknowledge(&id, state.clock.now())
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("alert event '{id}' not found")))
}

async fn post_reset(State(state): State<Arc<ApiState>>) -> StatusCode {
    state.recorder.reset();
    state.alerts.reset();
    state.breaker.reset();
    info!("resilience state reset");
    StatusCode::NO_CONTENT
}
