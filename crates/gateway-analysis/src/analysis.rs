//! Registry of monitored keys, their live counters and their windows.
//!
//! Hot-path events resolve the key's [`CounterPoint`] through a sharded
//! concurrent map and then touch only atomics. Window registration takes the
//! exclusive side of an `RwLock`; window reads take the shared side.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::AnalysisError;
use crate::point::CounterPoint;
use crate::recently::{RecentlyWindow, WindowSnapshot, WindowStats};
use crate::task::TaskRunner;

type WindowMap = HashMap<String, HashMap<Duration, Arc<WindowStats>>>;

/// Per-key traffic statistics with independently ticking windows.
///
/// Construct once, register windows, feed events, then call
/// [`shutdown`](Analysis::shutdown) to cancel and drain every window task.
#[derive(Debug)]
pub struct Analysis {
    runner: TaskRunner,
    points: DashMap<String, Arc<CounterPoint>>,
    windows: RwLock<WindowMap>,
}

impl Default for Analysis {
    fn default() -> Self {
        Self::new(TaskRunner::new())
    }
}

impl Analysis {
    pub fn new(runner: TaskRunner) -> Self {
        Self {
            runner,
            points: DashMap::new(),
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the live point for `key`, creating it on first reference.
    ///
    /// Callers on a hot path may keep the returned handle to skip the map
    /// lookup on later events.
    pub fn point(&self, key: &str) -> Arc<CounterPoint> {
        if let Some(point) = self.points.get(key) {
            return point.clone();
        }
        self.points
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CounterPoint::new()))
            .clone()
    }

    pub fn request(&self, key: &str) {
        self.point(key).increment_request();
    }

    pub fn reject(&self, key: &str) {
        self.point(key).increment_reject();
    }

    pub fn failure(&self, key: &str) {
        self.point(key).increment_failure();
    }

    pub fn response(&self, key: &str, latency: Duration) {
        self.point(key).record_success(latency);
    }

    /// Start tracking `key` over `interval`.
    ///
    /// Registering an existing (key, interval) pair is a no-op, as is a zero
    /// interval. Fails only when the background task cannot be launched.
    pub fn register_window(&self, key: &str, interval: Duration) -> Result<(), AnalysisError> {
        if interval.is_zero() {
            return Ok(());
        }

        let mut windows = self.windows.write();
        if windows
            .get(key)
            .is_some_and(|per_key| per_key.contains_key(&interval))
        {
            tracing::info!(key = %key, interval = ?interval, "Analysis window already registered");
            return Ok(());
        }

        let existed = self.points.contains_key(key);
        let point = self.point(key);
        let mut window = RecentlyWindow::new(interval);
        let stats = window.stats();

        let launched = self.runner.run_recurring(
            format!("analysis:{key}:{interval:?}"),
            interval,
            {
                let point = point.clone();
                move || window.record(&point)
            },
        );
        if let Err(e) = launched {
            // Drop a point this call created unless someone else picked it up.
            if !existed {
                self.points
                    .remove_if(key, |_, p| Arc::ptr_eq(p, &point) && Arc::strong_count(p) == 2);
            }
            return Err(e);
        }

        windows
            .entry(key.to_string())
            .or_default()
            .insert(interval, stats);

        tracing::info!(key = %key, interval = ?interval, "Analysis window registered");
        Ok(())
    }

    fn read_window(&self, key: &str, interval: Duration, read: impl FnOnce(&WindowStats) -> u64) -> u64 {
        self.windows
            .read()
            .get(key)
            .and_then(|per_key| per_key.get(&interval))
            .map_or(0, |stats| read(stats.as_ref()))
    }

    pub fn request_count(&self, key: &str, interval: Duration) -> u64 {
        self.read_window(key, interval, WindowStats::requests)
    }

    pub fn success_count(&self, key: &str, interval: Duration) -> u64 {
        self.read_window(key, interval, WindowStats::successes)
    }

    pub fn failure_count(&self, key: &str, interval: Duration) -> u64 {
        self.read_window(key, interval, WindowStats::failures)
    }

    pub fn reject_count(&self, key: &str, interval: Duration) -> u64 {
        self.read_window(key, interval, WindowStats::rejects)
    }

    pub fn max_latency_ms(&self, key: &str, interval: Duration) -> u64 {
        self.read_window(key, interval, WindowStats::max_latency_ms)
    }

    pub fn min_latency_ms(&self, key: &str, interval: Duration) -> u64 {
        self.read_window(key, interval, WindowStats::min_latency_ms)
    }

    pub fn avg_latency_ms(&self, key: &str, interval: Duration) -> u64 {
        self.read_window(key, interval, WindowStats::avg_latency_ms)
    }

    pub fn qps(&self, key: &str, interval: Duration) -> u64 {
        self.read_window(key, interval, WindowStats::qps)
    }

    pub fn recalculation_count(&self, key: &str, interval: Duration) -> u64 {
        self.read_window(key, interval, WindowStats::recalculations)
    }

    /// Live failure streak for `key`, bypassing any window.
    pub fn continuous_failure_count(&self, key: &str) -> u64 {
        self.points
            .get(key)
            .map_or(0, |point| point.continuous_failures())
    }

    /// Every derived value of one window, or `None` if it is not registered.
    pub fn window_snapshot(&self, key: &str, interval: Duration) -> Option<WindowSnapshot> {
        self.windows
            .read()
            .get(key)
            .and_then(|per_key| per_key.get(&interval))
            .map(|stats| stats.snapshot(interval))
    }

    /// Monitored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.points.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Registered intervals for `key`, shortest first.
    pub fn intervals(&self, key: &str) -> Vec<Duration> {
        let mut intervals: Vec<Duration> = self
            .windows
            .read()
            .get(key)
            .map(|per_key| per_key.keys().copied().collect())
            .unwrap_or_default();
        intervals.sort();
        intervals
    }

    /// Number of live window tasks.
    pub fn task_count(&self) -> usize {
        self.runner.task_count()
    }

    /// Cancel every window task and wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.runner.stop_all().await;
    }
}
