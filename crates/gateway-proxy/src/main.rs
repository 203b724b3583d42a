//! gateway-proxy: API gateway that forwards to upstream targets and keeps
//! rolling per-target statistics for admission control and the management API.

mod config;
mod proxy;
mod server;

use std::sync::Arc;

use anyhow::Context;
use config::GatewayConfig;
use gateway_analysis::{Analysis, TaskRunner};
use gateway_tracing::LogLevelHandle;
use proxy::upstream::Upstreams;
use server::AppState;

fn main() -> anyhow::Result<()> {
    // Determine config path
    let config_path = {
        let args: Vec<String> = std::env::args().collect();
        // Check for --config flag first
        args.iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1).cloned())
            // Fall back to positional arg
            .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
            .or_else(|| std::env::var("GATEWAY_CONFIG").ok())
            .unwrap_or_else(|| "gateway.toml".to_string())
    };

    let config = GatewayConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    // Build the tokio runtime first: the gRPC exporter and the window tasks need a reactor
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize tracing (OTLP export is optional, falls back to fmt-only)
        let tracing_guard = gateway_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            targets = config.targets.len(),
            otlp = tracing_guard.otlp_enabled(),
            "Starting gateway-proxy"
        );

        let result = run(config, tracing_guard.log_level()).await;
        match &result {
            Ok(()) => tracing::info!("Gateway exited cleanly"),
            Err(e) => tracing::error!(error = %e, "Gateway exited with error"),
        }
        result
    })
}

async fn run(config: GatewayConfig, log_level: LogLevelHandle) -> anyhow::Result<()> {
    // Per-target timeouts are applied on each request
    let client = reqwest::Client::builder().build()?;

    let analysis = Arc::new(Analysis::new(TaskRunner::new()));
    let upstreams = Upstreams::from_config(&config, &analysis)
        .context("failed to start analysis windows")?;
    if upstreams.is_empty() {
        tracing::warn!("No upstream targets configured, only the management API is served");
    } else {
        tracing::info!(targets = upstreams.len(), windows = analysis.task_count(), "Analysis started");
    }

    let state = AppState {
        config,
        client,
        analysis: analysis.clone(),
        upstreams: Arc::new(upstreams),
        log_level,
    };

    let served = server::run(state).await;

    // Cancel and drain every window task before exiting
    analysis.shutdown().await;
    served
}
