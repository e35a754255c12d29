//! Pipeline statistics
//!
//! Append-only registration at startup, lock-free counter updates from
//! the workers, point-in-time snapshots for the watchdog and for
//! shutdown reporting.

use crate::pipeline::{PipelineState, SharedPipelineState};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    records_polled: AtomicU64,
    records_skipped: AtomicU64,
    rows_transformed: AtomicU64,
    rows_dispatched: AtomicU64,
    tasks_merged: AtomicU64,
    rows_merged: AtomicU64,
    tasks_loaded: AtomicU64,
    rows_loaded: AtomicU64,
    load_retries: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_polled(&self, records: u64) {
        self.records_polled.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transformed(&self) {
        self.rows_transformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self, rows: u64) {
        self.rows_dispatched.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_task_merged(&self, rows: u64) {
        self.tasks_merged.fetch_add(1, Ordering::Relaxed);
        self.rows_merged.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_task_loaded(&self, rows: u64) {
        self.tasks_loaded.fetch_add(1, Ordering::Relaxed);
        self.rows_loaded.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_load_retry(&self) {
        self.load_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Rows accepted by the dispatcher but not yet durable on the target.
    pub fn rows_in_flight(&self) -> u64 {
        self.rows_dispatched
            .load(Ordering::Relaxed)
            .saturating_sub(self.rows_loaded.load(Ordering::Relaxed))
    }

    /// Monotonic progress indicator for stall detection.
    pub fn progress(&self) -> u64 {
        self.rows_loaded.load(Ordering::Relaxed) + self.records_skipped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            records_polled: self.records_polled.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            rows_transformed: self.rows_transformed.load(Ordering::Relaxed),
            rows_dispatched: self.rows_dispatched.load(Ordering::Relaxed),
            tasks_merged: self.tasks_merged.load(Ordering::Relaxed),
            rows_merged: self.rows_merged.load(Ordering::Relaxed),
            tasks_loaded: self.tasks_loaded.load(Ordering::Relaxed),
            rows_loaded: self.rows_loaded.load(Ordering::Relaxed),
            load_retries: self.load_retries.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone)]
pub struct PipelineStatsSnapshot {
    pub records_polled: u64,
    pub records_skipped: u64,
    pub rows_transformed: u64,
    pub rows_dispatched: u64,
    pub tasks_merged: u64,
    pub rows_merged: u64,
    pub tasks_loaded: u64,
    pub rows_loaded: u64,
    pub load_retries: u64,
}

struct RegisteredPipeline {
    name: String,
    state: Arc<SharedPipelineState>,
    stats: Arc<PipelineStats>,
}

/// Process-wide registry of pipelines.
///
/// Registration happens once at startup; afterwards the watchdog samples
/// states and progress without taking the write lock.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<Vec<RegisteredPipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one pipeline's state and counters.
    pub fn register(
        &self,
        name: impl Into<String>,
        state: Arc<SharedPipelineState>,
        stats: Arc<PipelineStats>,
    ) {
        self.pipelines.write().push(RegisteredPipeline {
            name: name.into(),
            state,
            stats,
        });
    }

    /// Total registered pipelines.
    pub fn total(&self) -> usize {
        self.pipelines.read().len()
    }

    /// Pipelines currently in the NORMAL state.
    pub fn live(&self) -> usize {
        self.pipelines
            .read()
            .iter()
            .filter(|p| p.state.get() == PipelineState::Normal)
            .count()
    }

    /// Pipelines that reached the terminal STOPPED state.
    pub fn stopped(&self) -> Vec<String> {
        self.pipelines
            .read()
            .iter()
            .filter(|p| p.state.get() == PipelineState::Stopped)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Combined progress counter across pipelines.
    pub fn progress(&self) -> u64 {
        self.pipelines.read().iter().map(|p| p.stats.progress()).sum()
    }

    /// Combined in-flight row count across pipelines.
    pub fn rows_in_flight(&self) -> u64 {
        self.pipelines
            .read()
            .iter()
            .map(|p| p.stats.rows_in_flight())
            .sum()
    }

    /// Snapshots of every pipeline, for shutdown reporting.
    pub fn snapshots(&self) -> Vec<(String, PipelineStatsSnapshot)> {
        self.pipelines
            .read()
            .iter()
            .map(|p| (p.name.clone(), p.stats.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let stats = PipelineStats::new();
        stats.record_polled(10);
        stats.record_transformed();
        stats.record_skipped();
        stats.record_dispatched(5);
        stats.record_task_merged(5);
        stats.record_task_loaded(3);
        stats.record_load_retry();

        let snap = stats.snapshot();
        assert_eq!(snap.records_polled, 10);
        assert_eq!(snap.rows_transformed, 1);
        assert_eq!(snap.records_skipped, 1);
        assert_eq!(snap.rows_dispatched, 5);
        assert_eq!(snap.tasks_merged, 1);
        assert_eq!(snap.rows_merged, 5);
        assert_eq!(snap.tasks_loaded, 1);
        assert_eq!(snap.rows_loaded, 3);
        assert_eq!(snap.load_retries, 1);
        assert_eq!(stats.rows_in_flight(), 2);
        assert_eq!(stats.progress(), 4);
    }

    #[test]
    fn test_registry_gauges() {
        let registry = PipelineRegistry::new();
        let state_a = Arc::new(SharedPipelineState::new());
        let state_b = Arc::new(SharedPipelineState::new());
        registry.register("a", state_a.clone(), Arc::new(PipelineStats::new()));
        registry.register("b", state_b.clone(), Arc::new(PipelineStats::new()));

        assert_eq!(registry.total(), 2);
        assert_eq!(registry.live(), 2);

        state_b.set(PipelineState::Stopped);
        assert_eq!(registry.live(), 1);
        assert_eq!(registry.stopped(), vec!["b".to_string()]);

        state_a.set(PipelineState::Degraded);
        assert_eq!(registry.live(), 0);
    }
}
