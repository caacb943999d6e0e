//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Threshold alert rules evaluated against the outcome history."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rah_common::config::{AlertRuleSeed, AlertsConfig};
use rah_common::time::to_chrono;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::{info, warn};
use uuid::Uuid;

use crate::history::ResilienceHistoryStore;
use crate::metrics::ResilienceMetrics;

const DEFAULT_EVENT_PAGE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    #[default]
    Warning,
    Critical,
}

impl AlertSeverity {
    /// Parse a configured severity; anything unrecognised is a warning.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("critical") {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Threshold rule over the trailing window of recorded outcomes.
///
/// A threshold of zero disables that arm of the rule.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    /// Failures plus timeouts tolerated inside the window.
    pub failure_threshold: u64,
    /// Rejections tolerated inside the window.
    pub rejected_threshold: u64,
    #[serde(rename = "windowSecs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub window: Duration,
    pub severity: AlertSeverity,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub id: String,
    pub rule_id: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub triggered_at: DateTime<Utc>,
    pub faults: u64,
    pub rejected: u64,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct AlertState {
    rules: IndexMap<String, AlertRule>,
    active: IndexMap<String, bool>,
    events: VecDeque<AlertEvent>,
}

/// Alert rules plus a bounded log of raised events.
pub struct ResilienceAlertStore {
    state: Mutex<AlertState>,
    max_events: usize,
    metrics: Option<ResilienceMetrics>,
}

impl ResilienceAlertStore {
    pub fn new(max_events: usize) -> Self {
        Self {
            state: Mutex::new(AlertState::default()),
            max_events: max_events.max(1),
            metrics: None,
        }
    }

    /// Build a store and install the configured seed rules.
    pub fn from_config(config: &AlertsConfig) -> Self {
        let store = Self::new(config.max_events);
        for seed in &config.rules {
            store.add_seed(seed);
        }
        store
    }

    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn add_seed(&self, seed: &AlertRuleSeed) -> AlertRule {
        self.add_rule(
            &seed.name,
            seed.failure_threshold,
            seed.rejected_threshold,
            seed.window,
            AlertSeverity::parse(&seed.severity),
        )
    }

    pub fn add_rule(
        &self,
        name: &str,
        failure_threshold: u64,
        rejected_threshold: u64,
        window: Duration,
        severity: AlertSeverity,
    ) -> AlertRule {
        let name = match name.trim() {
            "" => "threshold".to_owned(),
            trimmed => trimmed.to_owned(),
        };
        let rule = AlertRule {
            id: Uuid::new_v4().simple().to_string(),
            name,
            failure_threshold,
            rejected_threshold,
            window: window.max(Duration::from_secs(1)),
            severity,
            enabled: true,
        };
        let mut state = self.state.lock();
        state.active.insert(rule.id.clone(), false);
        state.rules.insert(rule.id.clone(), rule.clone());
        info!(rule = %rule.name, id = %rule.id, severity = rule.severity.as_str(), "alert rule installed");
        rule
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        state.active.shift_remove(id);
        state.rules.shift_remove(id).is_some()
    }

    /// Rules ordered by name.
    pub fn list_rules(&self) -> Vec<AlertRule> {
        let mut rules: Vec<_> = self.state.lock().rules.values().cloned().collect();
        rules.sort_by_key(|rule| rule.name.to_lowercase());
        rules
    }

    /// Newest events first; a zero limit falls back to a page of fifty.
    pub fn list_events(&self, limit: usize) -> Vec<AlertEvent> {
        let limit = if limit == 0 { DEFAULT_EVENT_PAGE } else { limit };
        self.state
            .lock()
            .events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Check every enabled rule against the history window ending at `now` and return
    /// the events raised by rules that just started triggering.
    pub fn evaluate(&self, history: &ResilienceHistoryStore, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut raised = Vec::new();
        let mut state = self.state.lock();
        let rules: Vec<AlertRule> = state
            .rules
            .values()
            .filter(|rule| rule.enabled)
            .cloned()
            .collect();

        for rule in rules {
            let totals = history.total_between(now - to_chrono(rule.window), now);
            let faults = totals.faults();
            let rejected = totals.rejected_count;
            let triggered = (rule.failure_threshold > 0 && faults > rule.failure_threshold)
                || (rule.rejected_threshold > 0 && rejected > rule.rejected_threshold);

            let was_active = state.active.insert(rule.id.clone(), triggered).unwrap_or(false);
            if !triggered || was_active {
                continue;
            }

            let event = AlertEvent {
                id: Uuid::new_v4().simple().to_string(),
                rule_id: rule.id.clone(),
                message: format!(
                    "alert '{}' triggered: faults={faults}, rejected={rejected} in {}s",
                    rule.name,
                    rule.window.as_secs()
                ),
                severity: rule.severity,
                triggered_at: now,
                faults,
                rejected,
                acknowledged_at: None,
            };
            warn!(rule = %rule.name, faults, rejected, severity = rule.severity.as_str(), "resilience alert triggered");
            if let Some(metrics) = &self.metrics {
                metrics.record_alert(rule.severity.as_str());
            }
            state.events.push_back(event.clone());
            while state.events.len() > self.max_events {
                state.events.pop_front();
            }
            raised.push(event);
        }
        raised
    }

    /// Mark an event acknowledged; returns the updated event, or `None` if unknown.
    pub fn acknowledge(&self, id: &str, now: DateTime<Utc>) -> Option<AlertEvent> {
        let mut state = self.state.lock();
        let event = state.events.iter_mut().find(|event| event.id == id)?;
        if event.acknowledged_at.is_none() {
            event.acknowledged_at = Some(now);
        }
        Some(event.clone())
    }

    /// Forget raised events and trigger state; installed rules are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.events.clear();
        for active in state.active.values_mut() {
            *active = false;
        }
    }
}

impl std::fmt::Debug for ResilienceAlertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceAlertStore")
            .field("max_events", &self.max_events)
            .finish_non_exhaustive()
    }
}
