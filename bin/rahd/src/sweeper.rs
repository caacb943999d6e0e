//! ---
//! rah_section: "01-core-functionality"
//! rah_subsection: "binary"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Periodic history retention and alert evaluation."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use rah_common::time::SharedClock;
use rah_resilience::{ResilienceAlertStore, ResilienceHistoryStore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run one retention pass followed by alert evaluation.
pub fn sweep_once(
    store: &ResilienceHistoryStore,
    alerts: &ResilienceAlertStore,
    clock: &SharedClock,
) -> (usize, usize) {
    let evicted = store.evict_expired();
    let raised = alerts.evaluate(store, clock.now()).len();
    debug!(evicted, raised, retained = store.len(), "retention sweep complete");
    (evicted, raised)
}

/// Sweep every `every` until `cancel` fires.
pub async fn run_sweeper(
    store: Arc<ResilienceHistoryStore>,
    alerts: Arc<ResilienceAlertStore>,
    clock: SharedClock,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = every.as_secs(), "retention sweeper started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sweep_once(&store, &alerts, &clock);
            }
        }
    }
    info!("retention sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rah_common::time::{Clock, ManualClock};
    use rah_resilience::{AlertSeverity, CircuitMetricsSnapshot, RetentionPolicy};

    #[test]
    fn sweep_evicts_and_raises_alerts() {
        let clock = ManualClock::default();
        let shared = clock.shared();
        let store = ResilienceHistoryStore::new(
            RetentionPolicy {
                max_entries: 100,
                horizon: Duration::from_secs(120),
            },
            shared.clone(),
        );
        let alerts = ResilienceAlertStore::new(10);
        alerts.add_rule("faults", 1, 0, Duration::from_secs(60), AlertSeverity::Warning);

        let now = clock.now();
        store.add(CircuitMetricsSnapshot::new(0, 2, 0, 0), now);
        store.add(CircuitMetricsSnapshot::success(), now - chrono::Duration::seconds(90));
        clock.advance(Duration::from_secs(45));

        assert_eq!(sweep_once(&store, &alerts, &shared), (1, 1));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let clock = ManualClock::default();
        let store = Arc::new(ResilienceHistoryStore::new(
            RetentionPolicy::default(),
            clock.shared(),
        ));
        let alerts = Arc::new(ResilienceAlertStore::new(10));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(
            store,
            alerts,
            clock.shared(),
            Duration::from_millis(5),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper exits promptly")
            .unwrap();
    }
}
