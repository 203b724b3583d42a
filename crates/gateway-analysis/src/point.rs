//! Live per-key traffic counters.
//!
//! Lock-free counters mutated from the request path. All atomics use `Relaxed`
//! ordering: every field is an independent counter and no reader relies on
//! ordering between fields.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cumulative traffic counters and latency extremes for one monitored key.
///
/// `requests`, `rejects`, `failures`, `successes` and `costs` only ever grow.
/// `max`/`min` hold the latency extremes observed since the last
/// [`snapshot_into`](CounterPoint::snapshot_into).
#[derive(Debug, Default)]
pub struct CounterPoint {
    requests: AtomicU64,
    rejects: AtomicU64,
    failures: AtomicU64,
    successes: AtomicU64,
    continuous_failures: AtomicU64,
    costs: AtomicU64,
    max: AtomicU64,
    min: AtomicU64,
}

/// Plain copy of a [`CounterPoint`] taken at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointSnapshot {
    pub requests: u64,
    pub rejects: u64,
    pub failures: u64,
    pub successes: u64,
    /// Sum of successful response latencies, in nanoseconds.
    pub costs: u64,
    /// Largest latency since the previous snapshot, in nanoseconds.
    pub max: u64,
    /// Smallest latency since the previous snapshot, in nanoseconds.
    pub min: u64,
}

impl CounterPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reject(&self) {
        self.rejects.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed attempt and extend the current failure streak.
    pub fn increment_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.continuous_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a successful response, ending any failure streak.
    pub fn record_success(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);

        self.successes.fetch_add(1, Ordering::Relaxed);
        self.costs.fetch_add(nanos, Ordering::Relaxed);
        self.continuous_failures.store(0, Ordering::Relaxed);
        self.max.fetch_max(nanos, Ordering::Relaxed);

        // A zero minimum means "nothing observed yet".
        let _ = self
            .min
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current == 0 || nanos < current).then_some(nanos)
            });
    }

    /// Copy every field into `target`, then reset this point's extremes.
    ///
    /// Cumulative counters are left untouched.
    pub fn snapshot_into(&self, target: &mut PointSnapshot) {
        target.requests = self.requests.load(Ordering::Relaxed);
        target.rejects = self.rejects.load(Ordering::Relaxed);
        target.failures = self.failures.load(Ordering::Relaxed);
        target.successes = self.successes.load(Ordering::Relaxed);
        target.costs = self.costs.load(Ordering::Relaxed);
        target.max = self.max.swap(0, Ordering::Relaxed);
        target.min = self.min.swap(0, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn rejects(&self) -> u64 {
        self.rejects.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn continuous_failures(&self) -> u64 {
        self.continuous_failures.load(Ordering::Relaxed)
    }
}
