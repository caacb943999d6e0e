//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Stamps outcome deltas and forwards them to the history store."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rah_common::time::SharedClock;
use tracing::trace;

use crate::history::ResilienceHistoryStore;
use crate::metrics::ResilienceMetrics;
use crate::retry::AttemptHook;
use crate::snapshot::CircuitMetricsSnapshot;

/// Records outcome deltas into the history store and keeps running totals.
pub struct MetricsRecorder {
    store: Arc<ResilienceHistoryStore>,
    clock: SharedClock,
    totals: Mutex<CircuitMetricsSnapshot>,
    metrics: Option<ResilienceMetrics>,
}

impl MetricsRecorder {
    pub fn new(store: Arc<ResilienceHistoryStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            totals: Mutex::new(CircuitMetricsSnapshot::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<ResilienceHistoryStore> {
        &self.store
    }

    /// Stamp `delta` with the current time and record it. Empty deltas are ignored.
    pub fn record(&self, delta: CircuitMetricsSnapshot) -> bool {
        self.record_at(delta, self.clock.now())
    }

    /// Record `delta` with an explicit timestamp.
    pub fn record_at(&self, delta: CircuitMetricsSnapshot, timestamp: DateTime<Utc>) -> bool {
        if delta.is_empty() {
            return false;
        }
        *self.totals.lock() += delta;
        self.store.add(delta, timestamp);
        if let Some(metrics) = &self.metrics {
            metrics.record_outcomes(&delta);
        }
        trace!(
            success = delta.success_count,
            failure = delta.failure_count,
            timeout = delta.timeout_count,
            rejected = delta.rejected_count,
            "outcome recorded"
        );
        true
    }

    /// Cumulative counters since start or the last reset.
    pub fn totals(&self) -> CircuitMetricsSnapshot {
        *self.totals.lock()
    }

    /// Zero the running totals and drop the recorded history.
    pub fn reset(&self) {
        *self.totals.lock() = CircuitMetricsSnapshot::default();
        self.store.clear();
    }
}

impl AttemptHook for MetricsRecorder {
    fn record(&self, delta: CircuitMetricsSnapshot) {
        self.record_at(delta, self.clock.now());
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("totals", &self.totals())
            .finish_non_exhaustive()
    }
}
