//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Prometheus families published by the resilience subsystem."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use prometheus::{self, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts};
use rah_metrics::SharedRegistry;

use crate::breaker::CircuitState;
use crate::snapshot::CircuitMetricsSnapshot;

/// Metrics published by the resilience subsystem.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    outcomes_total: IntCounterVec,
    transitions_total: IntCounterVec,
    circuit_state: IntGauge,
    retry_attempts_total: IntCounter,
    retry_backoff_seconds: Histogram,
    history_entries: IntGauge,
    history_evictions_total: IntCounter,
    alerts_triggered_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let outcomes_total = IntCounterVec::new(
            Opts::new(
                "rah_resilience_outcomes_total",
                "Guarded invocation outcomes by kind (success, failure, timeout, rejected)",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(outcomes_total.clone()))?;

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "rah_resilience_circuit_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["from", "to"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let circuit_state = IntGauge::with_opts(Opts::new(
            "rah_resilience_circuit_state",
            "Current breaker state (0 = closed, 1 = half-open, 2 = open)",
        ))?;
        registry.register(Box::new(circuit_state.clone()))?;

        let retry_attempts_total = IntCounter::with_opts(Opts::new(
            "rah_resilience_retry_attempts_total",
            "Retries scheduled after a transient fault",
        ))?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "rah_resilience_retry_backoff_seconds",
            "Backoff delay applied before each retry",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?);
        let retry_backoff_seconds = Histogram::with_opts(histogram_opts)?;
        registry.register(Box::new(retry_backoff_seconds.clone()))?;

        let history_entries = IntGauge::with_opts(Opts::new(
            "rah_resilience_history_entries",
            "Snapshots currently retained by the history store",
        ))?;
        registry.register(Box::new(history_entries.clone()))?;

        let history_evictions_total = IntCounter::with_opts(Opts::new(
            "rah_resilience_history_evictions_total",
            "Snapshots evicted by the retention policy",
        ))?;
        registry.register(Box::new(history_evictions_total.clone()))?;

        let alerts_triggered_total = IntCounterVec::new(
            Opts::new(
                "rah_resilience_alerts_triggered_total",
                "Alert rules that transitioned into the triggered state",
            ),
            &["severity"],
        )?;
        registry.register(Box::new(alerts_triggered_total.clone()))?;

        Ok(Self {
            registry,
            outcomes_total,
            transitions_total,
            circuit_state,
            retry_attempts_total,
            retry_backoff_seconds,
            history_entries,
            history_evictions_total,
            alerts_triggered_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Add a recorded delta to the per-outcome counters.
    pub fn record_outcomes(&self, delta: &CircuitMetricsSnapshot) {
        let pairs = [
            ("success", delta.success_count),
            ("failure", delta.failure_count),
            ("timeout", delta.timeout_count),
            ("rejected", delta.rejected_count),
        ];
        for (label, value) in pairs {
            if value > 0 {
                self.outcomes_total.with_label_values(&[label]).inc_by(value);
            }
        }
    }

    /// Track a breaker transition and publish the new state.
    pub fn record_transition(&self, from: CircuitState, to: CircuitState) {
        self.transitions_total
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        self.circuit_state.set(to.gauge_value());
    }

    /// Register a scheduled retry and its backoff.
    pub fn observe_retry(&self, delay: Duration) {
        self.retry_attempts_total.inc();
        self.retry_backoff_seconds.observe(delay.as_secs_f64());
    }

    /// Publish the retained entry count and any evictions.
    pub fn record_history(&self, retained: usize, evicted: usize) {
        self.history_entries.set(retained as i64);
        if evicted > 0 {
            self.history_evictions_total.inc_by(evicted as u64);
        }
    }

    /// Count a freshly triggered alert.
    pub fn record_alert(&self, severity: &str) {
        self.alerts_triggered_total
            .with_label_values(&[severity])
            .inc();
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rah_metrics::new_registry;

    fn counter_value(registry: &SharedRegistry, name: &str, label: (&str, &str)) -> f64 {
        registry
            .gather()
            .iter()
            .find(|family| family.get_name() == name)
            .and_then(|family| {
                family.get_metric().iter().find(|metric| {
                    metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.get_name() == label.0 && pair.get_value() == label.1)
                })
            })
            .map(|metric| metric.get_counter().get_value())
            .unwrap_or_default()
    }

    #[test]
    fn outcomes_are_split_by_label() {
        let registry = new_registry();
        let metrics = ResilienceMetrics::new(registry.clone()).unwrap();
        metrics.record_outcomes(&CircuitMetricsSnapshot::new(2, 1, 0, 3));

        let name = "rah_resilience_outcomes_total";
        assert_eq!(counter_value(&registry, name, ("outcome", "success")), 2.0);
        assert_eq!(counter_value(&registry, name, ("outcome", "failure")), 1.0);
        assert_eq!(counter_value(&registry, name, ("outcome", "rejected")), 3.0);
        assert_eq!(counter_value(&registry, name, ("outcome", "timeout")), 0.0);
    }

    #[test]
    fn transitions_update_state_gauge() {
        let registry = new_registry();
        let metrics = ResilienceMetrics::new(registry.clone()).unwrap();
        metrics.record_transition(CircuitState::Closed, CircuitState::Open);

        assert_eq!(
            counter_value(
                &registry,
                "rah_resilience_circuit_transitions_total",
                ("to", "open")
            ),
            1.0
        );
        let gauge = registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "rah_resilience_circuit_state")
            .expect("state gauge registered");
        assert_eq!(gauge.get_metric()[0].get_gauge().get_value(), 2.0);
    }
}
