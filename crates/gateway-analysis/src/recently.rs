//! Rolling-window statistics derived from two alternating point snapshots.
//!
//! A [`RecentlyWindow`] is driven by exactly one background task. Every call to
//! [`RecentlyWindow::record`] copies the live point into one of two buffers,
//! alternating `prev`, `curr`, `prev`, ... Only the calls that fill `curr`
//! recompute the derived values, so a fresh result appears every second tick
//! and always spans the tick between the two copies.
//!
//! Derived values are published through [`WindowStats`], a block of atomics
//! shared with readers. Readers never see a torn value, but may see a mix of
//! two consecutive recomputations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::point::{CounterPoint, PointSnapshot};

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Derived statistics for one (key, interval) window, readable from any thread.
#[derive(Debug, Default)]
pub struct WindowStats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejects: AtomicU64,
    max_latency_ms: AtomicU64,
    min_latency_ms: AtomicU64,
    avg_latency_ms: AtomicU64,
    qps: AtomicU64,
    recalculations: AtomicU64,
}

/// Serializable copy of a window's derived statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub interval_ms: u64,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejects: u64,
    pub max_latency_ms: u64,
    pub min_latency_ms: u64,
    pub avg_latency_ms: u64,
    pub qps: u64,
    pub recalculations: u64,
}

impl WindowStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn rejects(&self) -> u64 {
        self.rejects.load(Ordering::Relaxed)
    }

    pub fn max_latency_ms(&self) -> u64 {
        self.max_latency_ms.load(Ordering::Relaxed)
    }

    pub fn min_latency_ms(&self) -> u64 {
        self.min_latency_ms.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> u64 {
        self.avg_latency_ms.load(Ordering::Relaxed)
    }

    pub fn qps(&self) -> u64 {
        self.qps.load(Ordering::Relaxed)
    }

    /// Number of completed recomputations since the window was registered.
    pub fn recalculations(&self) -> u64 {
        self.recalculations.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, interval: Duration) -> WindowSnapshot {
        WindowSnapshot {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            requests: self.requests(),
            successes: self.successes(),
            failures: self.failures(),
            rejects: self.rejects(),
            max_latency_ms: self.max_latency_ms(),
            min_latency_ms: self.min_latency_ms(),
            avg_latency_ms: self.avg_latency_ms(),
            qps: self.qps(),
            recalculations: self.recalculations(),
        }
    }
}

/// Ping-pong snapshot buffers plus the stats they feed.
#[derive(Debug)]
pub struct RecentlyWindow {
    period: Duration,
    prev: PointSnapshot,
    curr: PointSnapshot,
    dump_curr: bool,
    stats: Arc<WindowStats>,
}

impl RecentlyWindow {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            prev: PointSnapshot::default(),
            curr: PointSnapshot::default(),
            dump_curr: false,
            stats: Arc::new(WindowStats::default()),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Handle to the published statistics.
    pub fn stats(&self) -> Arc<WindowStats> {
        self.stats.clone()
    }

    /// Snapshot `live` into the next buffer, recomputing after filling `curr`.
    pub fn record(&mut self, live: &CounterPoint) {
        if self.dump_curr {
            live.snapshot_into(&mut self.curr);
            self.recalculate();
        } else {
            live.snapshot_into(&mut self.prev);
        }

        self.dump_curr = !self.dump_curr;
    }

    /// Recompute derived statistics from the `curr` - `prev` delta.
    pub fn recalculate(&mut self) {
        let requests = self.curr.requests.saturating_sub(self.prev.requests);
        let successes = self.curr.successes.saturating_sub(self.prev.successes);
        let failures = self.curr.failures.saturating_sub(self.prev.failures);
        let rejects = self.curr.rejects.saturating_sub(self.prev.rejects);
        let costs = self.curr.costs.saturating_sub(self.prev.costs);

        let avg_latency_ms = if requests == 0 || successes == 0 {
            0
        } else {
            costs / successes / NANOS_PER_MILLI
        };

        let secs = self.period.as_secs();
        let qps = if secs == 0 {
            0
        } else {
            requests.max(successes) / secs
        };

        let stats = &self.stats;
        stats.requests.store(requests, Ordering::Relaxed);
        stats.successes.store(successes, Ordering::Relaxed);
        stats.failures.store(failures, Ordering::Relaxed);
        stats.rejects.store(rejects, Ordering::Relaxed);
        stats
            .max_latency_ms
            .store(self.curr.max / NANOS_PER_MILLI, Ordering::Relaxed);
        stats
            .min_latency_ms
            .store(self.curr.min / NANOS_PER_MILLI, Ordering::Relaxed);
        stats.avg_latency_ms.store(avg_latency_ms, Ordering::Relaxed);
        stats.qps.store(qps, Ordering::Relaxed);
        stats.recalculations.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(point: &CounterPoint, requests: u64, successes: u64, latency: Duration) {
        for _ in 0..requests {
            point.increment_request();
        }
        for _ in 0..successes {
            point.record_success(latency);
        }
    }

    #[test]
    fn test_first_record_fills_prev_only() {
        let point = CounterPoint::new();
        let mut window = RecentlyWindow::new(Duration::from_secs(1));
        let stats = window.stats();

        drive(&point, 10, 10, Duration::from_millis(5));
        window.record(&point);

        assert_eq!(stats.recalculations(), 0);
        assert_eq!(stats.requests(), 0);
        assert_eq!(window.prev.requests, 10);
        assert_eq!(window.curr, PointSnapshot::default());
    }

    #[test]
    fn test_recalculates_on_every_second_record() {
        let point = CounterPoint::new();
        let mut window = RecentlyWindow::new(Duration::from_secs(1));
        let stats = window.stats();

        let mut observed = Vec::new();
        for tick in 1..=6u64 {
            drive(&point, tick, 0, Duration::ZERO);
            window.record(&point);
            observed.push((stats.recalculations(), stats.requests()));
        }

        // Each computed delta covers the traffic between the prev and curr copies.
        assert_eq!(
            observed,
            vec![(0, 0), (1, 2), (1, 2), (2, 4), (2, 4), (3, 6)]
        );
    }

    #[test]
    fn test_steady_rate_converges() {
        let point = CounterPoint::new();
        let mut window = RecentlyWindow::new(Duration::from_secs(2));
        let stats = window.stats();

        for _ in 0..10 {
            drive(&point, 40, 40, Duration::from_millis(20));
            window.record(&point);
        }

        assert_eq!(stats.requests(), 40);
        assert_eq!(stats.successes(), 40);
        assert_eq!(stats.avg_latency_ms(), 20);
        assert_eq!(stats.qps(), 20);
    }

    #[test]
    fn test_negative_deltas_clamp_to_zero() {
        let mut window = RecentlyWindow::new(Duration::from_secs(1));
        window.prev = PointSnapshot {
            requests: 50,
            rejects: 5,
            failures: 7,
            successes: 40,
            costs: 1_000,
            max: 0,
            min: 0,
        };
        window.curr = PointSnapshot {
            requests: 10,
            ..PointSnapshot::default()
        };
        window.recalculate();

        let snap = window.stats().snapshot(window.period());
        assert_eq!(snap.requests, 0);
        assert_eq!(snap.successes, 0);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.rejects, 0);
        assert_eq!(snap.avg_latency_ms, 0);
        assert_eq!(snap.qps, 0);
        assert_eq!(snap.recalculations, 1);
    }

    #[test]
    fn test_qps_uses_larger_population() {
        let mut window = RecentlyWindow::new(Duration::from_secs(5));
        window.curr = PointSnapshot {
            requests: 20,
            successes: 50,
            ..PointSnapshot::default()
        };
        window.recalculate();
        assert_eq!(window.stats().qps(), 10);

        window.curr = PointSnapshot {
            requests: 100,
            successes: 50,
            ..PointSnapshot::default()
        };
        window.recalculate();
        assert_eq!(window.stats().qps(), 20);
    }

    #[test]
    fn test_sub_second_period_reports_zero_qps() {
        let mut window = RecentlyWindow::new(Duration::from_millis(500));
        window.curr = PointSnapshot {
            requests: 100,
            successes: 100,
            ..PointSnapshot::default()
        };
        window.recalculate();
        assert_eq!(window.stats().qps(), 0);
        assert_eq!(window.stats().requests(), 100);
    }

    #[test]
    fn test_extremes_cover_only_the_last_tick() {
        let point = CounterPoint::new();
        let mut window = RecentlyWindow::new(Duration::from_secs(1));
        let stats = window.stats();

        window.record(&point);
        point.increment_request();
        point.record_success(Duration::from_millis(70));
        point.increment_request();
        point.record_success(Duration::from_millis(30));
        window.record(&point);
        assert_eq!(stats.max_latency_ms(), 70);
        assert_eq!(stats.min_latency_ms(), 30);
        assert_eq!(stats.avg_latency_ms(), 50);

        // Quiet window: both snapshots reset the extremes.
        window.record(&point);
        window.record(&point);
        assert_eq!(stats.max_latency_ms(), 0);
        assert_eq!(stats.min_latency_ms(), 0);
        assert_eq!(stats.avg_latency_ms(), 0);
    }

    #[test]
    fn test_extremes_seen_before_prev_snapshot_are_dropped() {
        let point = CounterPoint::new();
        let mut window = RecentlyWindow::new(Duration::from_secs(1));

        point.record_success(Duration::from_millis(250));
        window.record(&point);
        window.record(&point);

        let stats = window.stats();
        assert_eq!(stats.max_latency_ms(), 0);
        assert_eq!(stats.min_latency_ms(), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let window = RecentlyWindow::new(Duration::from_secs(10));
        let json = serde_json::to_value(window.stats().snapshot(window.period())).unwrap();
        assert_eq!(json["interval_ms"], 10_000);
        assert_eq!(json["qps"], 0);
    }
}
