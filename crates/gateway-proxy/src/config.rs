//! Configuration types and loading logic.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::bail;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use gateway_tracing::TracingConfig;
use serde::Deserialize;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Largest request body forwarded upstream.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Windows registered for every target.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_windows_secs")]
    pub default_windows_secs: Vec<u64>,
}

/// One upstream target reachable under `/proxy/{name}/...`.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub url: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Consecutive failures that open the circuit. 0 disables the breaker.
    #[serde(default)]
    pub failure_threshold: u64,

    /// How often an open circuit lets one probe request through.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Windows registered for this target in addition to the defaults.
    #[serde(default)]
    pub windows_secs: Vec<u64>,
}

fn default_listen_address() -> String {
    "0.0.0.0:9093".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_windows_secs() -> Vec<u64> {
    vec![1, 10]
}

fn default_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    256
}

fn default_probe_interval() -> u64 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_windows_secs: default_windows_secs(),
        }
    }
}

impl TargetConfig {
    /// Default and per-target windows merged, deduplicated and sorted.
    ///
    /// Zero-second entries are dropped.
    pub fn windows(&self, defaults: &[u64]) -> Vec<Duration> {
        let mut secs: Vec<u64> = defaults
            .iter()
            .chain(self.windows_secs.iter())
            .copied()
            .filter(|&s| {
                if s == 0 {
                    tracing::warn!(target_name = %self.name, "Ignoring zero-second analysis window");
                }
                s > 0
            })
            .collect();
        secs.sort_unstable();
        secs.dedup();
        secs.into_iter().map(Duration::from_secs).collect()
    }
}

impl GatewayConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (GATEWAY_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(config_path))
                .merge(Env::prefixed("GATEWAY_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: GatewayConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                bail!("target with url {} has an empty name", target.url);
            }
            if target.name.contains('/') {
                bail!("target name {:?} must not contain '/'", target.name);
            }
            if !seen.insert(target.name.as_str()) {
                bail!("duplicate target name {:?}", target.name);
            }
            if target.max_concurrent == 0 {
                bail!("target {:?} needs max_concurrent > 0", target.name);
            }
        }
        Ok(())
    }
}
