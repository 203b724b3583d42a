//! Upstream targets and their admission control.
//!
//! Each target owns a concurrency semaphore and a circuit breaker fed by the
//! live failure streak from the analysis engine. Event recording goes through
//! the target's resolved [`CounterPoint`] so the request path never touches
//! the registry maps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gateway_analysis::{Analysis, AnalysisError, CounterPoint};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::{GatewayConfig, TargetConfig};

/// Why a request was turned away before reaching the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("circuit open after {0} consecutive failures")]
    CircuitOpen(u64),

    #[error("too many in-flight requests")]
    Saturated,
}

/// A configured upstream target.
#[derive(Debug)]
pub struct Upstream {
    name: String,
    base_url: String,
    timeout: Duration,
    windows: Vec<Duration>,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    failure_threshold: u64,
    probe_interval: Duration,
    last_probe: Mutex<Option<Instant>>,
    point: Arc<CounterPoint>,
}

impl Upstream {
    pub fn new(config: &TargetConfig, windows: Vec<Duration>, point: Arc<CounterPoint>) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            windows,
            max_concurrent: config.max_concurrent,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            failure_threshold: config.failure_threshold,
            probe_interval: Duration::from_secs(config.probe_interval_secs.max(1)),
            last_probe: Mutex::new(None),
            point,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Analysis windows registered for this target.
    pub fn windows(&self) -> &[Duration] {
        &self.windows
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    pub fn continuous_failures(&self) -> u64 {
        self.point.continuous_failures()
    }

    /// Whether the failure streak has reached the breaker threshold.
    pub fn circuit_open(&self) -> bool {
        self.failure_threshold > 0 && self.continuous_failures() >= self.failure_threshold
    }

    /// Decide whether a request may be sent upstream.
    ///
    /// An open circuit still lets one probe through per `probe_interval` so a
    /// success can close it again. The returned permit must be held for the
    /// duration of the upstream call.
    pub fn admit(&self) -> Result<OwnedSemaphorePermit, RejectReason> {
        if self.circuit_open() && !self.probe_due() {
            return Err(RejectReason::CircuitOpen(self.continuous_failures()));
        }

        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| RejectReason::Saturated)?;

        // The probe slot is only spent once the request can actually go out.
        if self.circuit_open() && !self.try_probe() {
            return Err(RejectReason::CircuitOpen(self.continuous_failures()));
        }
        Ok(permit)
    }

    fn probe_due(&self) -> bool {
        self.last_probe
            .lock()
            .map_or(true, |at| Instant::now().duration_since(at) >= self.probe_interval)
    }

    fn try_probe(&self) -> bool {
        let now = Instant::now();
        let mut last_probe = self.last_probe.lock();
        match *last_probe {
            Some(at) if now.duration_since(at) < self.probe_interval => false,
            _ => {
                *last_probe = Some(now);
                true
            }
        }
    }

    /// Upstream URL for a proxied `path` and optional raw query string.
    pub fn url_for(&self, path: &str, query: Option<&str>) -> String {
        let path = path.trim_start_matches('/');
        match query {
            Some(q) if !q.is_empty() => format!("{}/{path}?{q}", self.base_url),
            _ => format!("{}/{path}", self.base_url),
        }
    }

    pub fn record_request(&self) {
        self.point.increment_request();
    }

    pub fn record_reject(&self) {
        self.point.increment_reject();
    }

    pub fn record_failure(&self) {
        self.point.increment_failure();
    }

    pub fn record_response(&self, latency: Duration) {
        self.point.record_success(latency);
    }
}

/// All configured targets, keyed by name.
#[derive(Debug, Default)]
pub struct Upstreams {
    by_name: BTreeMap<String, Arc<Upstream>>,
}

impl Upstreams {
    /// Build every target and register its analysis windows.
    pub fn from_config(config: &GatewayConfig, analysis: &Analysis) -> Result<Self, AnalysisError> {
        let mut by_name = BTreeMap::new();

        for target in &config.targets {
            let windows = target.windows(&config.analysis.default_windows_secs);
            for interval in &windows {
                analysis.register_window(&target.name, *interval)?;
            }

            let upstream = Upstream::new(target, windows, analysis.point(&target.name));
            tracing::info!(
                target_name = %upstream.name(),
                url = %upstream.base_url(),
                windows = ?upstream.windows(),
                "Upstream target configured"
            );
            by_name.insert(target.name.clone(), Arc::new(upstream));
        }

        Ok(Self { by_name })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Upstream>> {
        self.by_name.get(name).cloned()
    }

    /// Targets in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use figment::providers::{Format, Toml};
    use figment::Figment;

    use super::*;

    fn target(max_concurrent: usize, failure_threshold: u64) -> TargetConfig {
        TargetConfig {
            name: "users".to_string(),
            url: "http://users.internal:8080/".to_string(),
            timeout_secs: 5,
            max_concurrent,
            failure_threshold,
            probe_interval_secs: 2,
            windows_secs: vec![],
        }
    }

    fn upstream(max_concurrent: usize, failure_threshold: u64) -> Upstream {
        Upstream::new(
            &target(max_concurrent, failure_threshold),
            vec![],
            Arc::new(CounterPoint::new()),
        )
    }

    #[test]
    fn test_url_for_joins_path_and_query() {
        let upstream = upstream(1, 0);
        assert_eq!(
            upstream.url_for("v1/users", Some("page=2")),
            "http://users.internal:8080/v1/users?page=2"
        );
        assert_eq!(upstream.url_for("/health", None), "http://users.internal:8080/health");
        assert_eq!(upstream.url_for("", Some("")), "http://users.internal:8080/");
    }

    #[tokio::test]
    async fn test_saturation_rejects_until_permit_released() {
        let upstream = upstream(2, 0);
        let first = upstream.admit().unwrap();
        let _second = upstream.admit().unwrap();
        assert_eq!(upstream.in_flight(), 2);
        assert_eq!(upstream.admit().unwrap_err(), RejectReason::Saturated);

        drop(first);
        assert!(upstream.admit().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_probes_and_closes() {
        let upstream = upstream(8, 3);
        for _ in 0..3 {
            upstream.record_request();
            upstream.record_failure();
        }
        assert!(upstream.circuit_open());

        // First admission after tripping is the probe; the next one is refused.
        assert!(upstream.admit().is_ok());
        assert_eq!(upstream.admit().unwrap_err(), RejectReason::CircuitOpen(3));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(upstream.admit().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(upstream.admit().is_ok());

        upstream.record_response(Duration::from_millis(12));
        assert!(!upstream.circuit_open());
        assert!(upstream.admit().is_ok());
        assert!(upstream.admit().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturation_does_not_spend_probe_slot() {
        let mut config = target(1, 1);
        config.probe_interval_secs = 10;
        let upstream = Upstream::new(&config, vec![], Arc::new(CounterPoint::new()));
        upstream.record_request();
        upstream.record_failure();

        let probe = upstream.admit().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        // Probe is due but the only permit is still held.
        assert_eq!(upstream.admit().unwrap_err(), RejectReason::Saturated);

        drop(probe);
        assert!(upstream.admit().is_ok());
    }

    #[test]
    fn test_zero_threshold_never_opens() {
        let upstream = upstream(1, 0);
        for _ in 0..100 {
            upstream.record_failure();
        }
        assert!(!upstream.circuit_open());
        assert_eq!(upstream.continuous_failures(), 100);
    }

    #[tokio::test]
    async fn test_from_config_registers_windows() {
        let config = GatewayConfig::from_figment(Figment::from(Toml::string(
            r#"
                [[targets]]
                name = "users"
                url = "http://users"
                windows_secs = [60]

                [[targets]]
                name = "billing"
                url = "http://billing"
            "#,
        )))
        .unwrap();
        let analysis = Analysis::default();
        let upstreams = Upstreams::from_config(&config, &analysis).unwrap();

        let names: Vec<&str> = upstreams.iter().map(|u| u.name()).collect();
        assert_eq!(names, vec!["billing", "users"]);
        assert_eq!(analysis.intervals("users").len(), 3);
        assert_eq!(analysis.intervals("billing").len(), 2);
        assert_eq!(analysis.task_count(), 5);

        // Events recorded through the upstream land in the shared point.
        let users = upstreams.get("users").unwrap();
        users.record_request();
        assert_eq!(analysis.point("users").requests(), 1);

        analysis.shutdown().await;
    }
}
