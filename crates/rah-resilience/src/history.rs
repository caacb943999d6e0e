//! ---
//! rah_section: "07-resilience-fault-tolerance"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Time-indexed outcome history with bucketed range queries."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
//! Outcome deltas are retained in insertion order inside a mutex-guarded deque.
//! Queries copy the matching entries out under the lock and do all bucketing on the
//! copy, so retention running concurrently never alters a result in progress.
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rah_common::config::HistoryConfig;
use rah_common::time::{to_chrono, SharedClock};
use serde::Serialize;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::metrics::ResilienceMetrics;
use crate::snapshot::CircuitMetricsSnapshot;

/// One recorded delta and the instant it was stamped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: CircuitMetricsSnapshot,
}

/// Aggregate of every entry stamped inside `[bucket_start, bucket_end)`.
///
/// The last bucket of a query is closed on the right so entries stamped exactly at
/// the query end are included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    #[serde(flatten)]
    pub aggregated: CircuitMetricsSnapshot,
}

/// Bounds applied to the retained entry set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Oldest insertions are dropped beyond this many entries.
    pub max_entries: usize,
    /// Entries stamped further than this in the past are dropped.
    pub horizon: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&HistoryConfig::default())
    }
}

impl From<&HistoryConfig> for RetentionPolicy {
    fn from(config: &HistoryConfig) -> Self {
        Self {
            max_entries: config.max_entries.max(1),
            horizon: config.horizon,
        }
    }
}

/// Process-lifetime store of outcome deltas.
pub struct ResilienceHistoryStore {
    retention: RetentionPolicy,
    clock: SharedClock,
    entries: Mutex<VecDeque<HistoryEntry>>,
    metrics: Option<ResilienceMetrics>,
}

impl ResilienceHistoryStore {
    /// Create an empty store.
    pub fn new(retention: RetentionPolicy, clock: SharedClock) -> Self {
        Self {
            retention,
            clock,
            entries: Mutex::new(VecDeque::with_capacity(retention.max_entries.min(4096))),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Horizon used when a caller does not bound a query.
    pub fn horizon(&self) -> Duration {
        self.retention.horizon
    }

    /// Append a delta stamped with `timestamp`; timestamps may arrive out of order.
    pub fn add(&self, snapshot: CircuitMetricsSnapshot, timestamp: DateTime<Utc>) {
        let cutoff = self.cutoff();
        let (retained, evicted) = {
            let mut entries = self.entries.lock();
            entries.push_back(HistoryEntry {
                timestamp,
                snapshot,
            });
            let evicted = self.enforce(&mut entries, cutoff);
            (entries.len(), evicted)
        };
        if evicted > 0 {
            debug!(evicted, retained, "history retention evicted entries");
        }
        self.publish(retained, evicted);
    }

    /// Apply retention without inserting; returns how many entries were evicted.
    pub fn evict_expired(&self) -> usize {
        let cutoff = self.cutoff();
        let (retained, evicted) = {
            let mut entries = self.entries.lock();
            let evicted = self.enforce(&mut entries, cutoff);
            (entries.len(), evicted)
        };
        if evicted > 0 {
            debug!(evicted, retained, "history sweep evicted entries");
        }
        self.publish(retained, evicted);
        evicted
    }

    /// Aggregate entries stamped inside `[start, end]` into buckets of
    /// `bucket_minutes`, anchored at `start`, returning at most `limit` buckets.
    ///
    /// Empty buckets are omitted. When more than `limit` buckets are non-empty the
    /// effective width is doubled until they fit; counter totals are unchanged.
    pub fn snapshot_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
        bucket_minutes: u32,
    ) -> Result<Vec<Bucket>, ConfigurationError> {
        if limit == 0 {
            return Err(ConfigurationError::InvalidLimit);
        }
        if bucket_minutes == 0 {
            return Err(ConfigurationError::InvalidBucketWidth);
        }
        if start > end {
            return Ok(Vec::new());
        }

        let matching = self.copy_between(start, end);
        if matching.is_empty() {
            return Ok(Vec::new());
        }

        let width_ms = i64::from(bucket_minutes) * 60_000;
        let span_ms = (end - start).num_milliseconds();
        let last_index = if span_ms == 0 { 0 } else { (span_ms - 1) / width_ms };

        let mut grouped: BTreeMap<i64, CircuitMetricsSnapshot> = BTreeMap::new();
        for entry in &matching {
            let offset = (entry.timestamp - start).num_milliseconds();
            let index = (offset / width_ms).min(last_index);
            *grouped.entry(index).or_default() += entry.snapshot;
        }

        let mut factor: i64 = 1;
        while grouped.len() > limit {
            factor *= 2;
            let mut coarser: BTreeMap<i64, CircuitMetricsSnapshot> = BTreeMap::new();
            for (index, aggregated) in grouped {
                *coarser.entry(index / 2).or_default() += aggregated;
            }
            grouped = coarser;
        }
        if factor > 1 {
            debug!(
                bucket_minutes,
                effective_minutes = i64::from(bucket_minutes) * factor,
                buckets = grouped.len(),
                limit,
                "history range downsampled"
            );
        }

        let effective_ms = width_ms.saturating_mul(factor);
        let buckets = grouped
            .into_iter()
            .map(|(index, aggregated)| {
                let bucket_start = start + chrono::Duration::milliseconds(index * effective_ms);
                let bucket_end = (start
                    + chrono::Duration::milliseconds((index + 1).saturating_mul(effective_ms)))
                .min(end);
                Bucket {
                    bucket_start,
                    bucket_end,
                    aggregated,
                }
            })
            .collect();
        Ok(buckets)
    }

    /// Raw entries stamped within `window` of now in ascending time order, keeping only
    /// the newest `limit` when one is given.
    pub fn recent(&self, window: Duration, limit: Option<usize>) -> Vec<HistoryEntry> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(window);
        let mut items = self.copy_between(cutoff, now);
        if let Some(limit) = limit.filter(|limit| *limit > 0) {
            if items.len() > limit {
                items.drain(..items.len() - limit);
            }
        }
        items
    }

    /// Element-wise sum of the entries stamped inside `[start, end]`.
    pub fn total_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CircuitMetricsSnapshot {
        if start > end {
            return CircuitMetricsSnapshot::default();
        }
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.timestamp >= start && entry.timestamp <= end)
            .map(|entry| entry.snapshot)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every retained entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            let removed = entries.len();
            entries.clear();
            removed
        };
        self.publish(0, 0);
        removed
    }

    /// Teardown: release retained entries and report how many were held.
    pub fn flush(&self) -> usize {
        let removed = self.clear();
        if removed > 0 {
            debug!(removed, "history store flushed");
        }
        removed
    }

    fn copy_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<HistoryEntry> {
        let mut matching: Vec<HistoryEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.timestamp >= start && entry.timestamp <= end)
            .copied()
            .collect();
        matching.sort_by_key(|entry| entry.timestamp);
        matching
    }

    fn cutoff(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        now.checked_sub_signed(to_chrono(self.retention.horizon))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn enforce(&self, entries: &mut VecDeque<HistoryEntry>, cutoff: DateTime<Utc>) -> usize {
        let before = entries.len();
        entries.retain(|entry| entry.timestamp >= cutoff);
        while entries.len() > self.retention.max_entries {
            entries.pop_front();
        }
        before - entries.len()
    }

    fn publish(&self, retained: usize, evicted: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.record_history(retained, evicted);
        }
    }
}

impl Drop for ResilienceHistoryStore {
    fn drop(&mut self) {
        let retained = self.entries.get_mut().len();
        if retained > 0 {
            debug!(retained, "dropping history store");
        }
    }
}

impl std::fmt::Debug for ResilienceHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceHistoryStore")
            .field("retention", &self.retention)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}
