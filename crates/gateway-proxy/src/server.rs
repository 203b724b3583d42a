//! Axum HTTP server: proxy route, management API, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, FromRequest, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use bytes::Bytes;
use gateway_analysis::{Analysis, WindowSnapshot};
use gateway_tracing::LogLevelHandle;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::GatewayConfig;
use crate::proxy::correlation;
use crate::proxy::forward::{self, Outcome};
use crate::proxy::upstream::{Upstream, Upstreams};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub client: reqwest::Client,
    pub analysis: Arc<Analysis>,
    pub upstreams: Arc<Upstreams>,
    pub log_level: LogLevelHandle,
}

/// Build the router for the proxy and management endpoints.
pub fn router(state: AppState) -> Router {
    let max_body_bytes = state.config.server.max_body_bytes;
    Router::new()
        .route("/proxy/{target}", any(handle_proxy_root))
        .route("/proxy/{target}/{*path}", any(handle_proxy))
        .route("/health", get(handle_health))
        .route("/api/v1/targets", get(handle_list_targets))
        .route("/api/v1/targets/{name}/stats", get(handle_target_stats))
        .route(
            "/api/v1/log-level",
            get(handle_get_log_level).put(handle_set_log_level),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Build and run the HTTP server until a shutdown signal arrives.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

async fn handle_proxy_root(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    request: Request,
) -> Response {
    proxy_request(state, target, String::new(), request).await
}

async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    Path((target, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    proxy_request(state, target, path, request).await
}

/// Relay one request to `target`, feeding exactly one outcome event into the
/// analysis engine after the request event.
async fn proxy_request(state: Arc<AppState>, target: String, path: String, request: Request) -> Response {
    let Some(upstream) = state.upstreams.get(&target) else {
        return json_error(StatusCode::NOT_FOUND, format!("unknown target {target:?}"));
    };

    let correlation_id = correlation::generate_id();
    let span = gateway_tracing::upstream_request_span!(&correlation_id, upstream.name());

    async {
        let method = request.method().clone();
        let query = request.uri().query().map(str::to_string);
        let headers = request.headers().clone();
        // Oversized bodies are rejected with 413, other read errors with 400
        let body = match Bytes::from_request(request, &()).await {
            Ok(b) => b,
            Err(rejection) => {
                tracing::warn!(
                    status = rejection.status().as_u16(),
                    error = %rejection.body_text(),
                    "Failed to read request body"
                );
                return rejection.into_response();
            }
        };

        upstream.record_request();

        let _permit = match upstream.admit() {
            Ok(permit) => permit,
            Err(reason) => {
                upstream.record_reject();
                tracing::Span::current().record("outcome", "reject");
                tracing::warn!(reason = %reason, "Request rejected by admission control");
                return json_error(StatusCode::SERVICE_UNAVAILABLE, reason.to_string());
            }
        };

        let url = upstream.url_for(&path, query.as_deref());
        let forwarded = forward::forward(
            &state.client,
            upstream.timeout(),
            method,
            &url,
            &headers,
            body,
            &correlation_id,
        )
        .await;

        let span = tracing::Span::current();
        span.record("status", forwarded.status.as_u16());
        span.record(
            "latency_ms",
            u64::try_from(forwarded.latency.as_millis()).unwrap_or(u64::MAX),
        );

        match forwarded.outcome {
            Outcome::Response => {
                upstream.record_response(forwarded.latency);
                span.record("outcome", "response");
            }
            Outcome::Failure => {
                upstream.record_failure();
                span.record("outcome", "failure");
                tracing::warn!(
                    status = forwarded.status.as_u16(),
                    continuous_failures = upstream.continuous_failures(),
                    "Upstream attempt failed"
                );
            }
        }

        forwarded.response
    }
    .instrument(span)
    .await
}

/// Entry of `GET /api/v1/targets`.
#[derive(Debug, Serialize)]
struct TargetSummary {
    name: String,
    url: String,
    intervals_secs: Vec<u64>,
    continuous_failures: u64,
    circuit_open: bool,
    in_flight: usize,
}

impl TargetSummary {
    fn new(upstream: &Upstream, analysis: &Analysis) -> Self {
        Self {
            name: upstream.name().to_string(),
            url: upstream.base_url().to_string(),
            intervals_secs: analysis
                .intervals(upstream.name())
                .iter()
                .map(Duration::as_secs)
                .collect(),
            continuous_failures: analysis.continuous_failure_count(upstream.name()),
            circuit_open: upstream.circuit_open(),
            in_flight: upstream.in_flight(),
        }
    }
}

/// GET /api/v1/targets: list configured targets.
async fn handle_list_targets(State(state): State<Arc<AppState>>) -> Response {
    let targets: Vec<TargetSummary> = state
        .upstreams
        .iter()
        .map(|upstream| TargetSummary::new(upstream, &state.analysis))
        .collect();
    Json(serde_json::json!({ "targets": targets })).into_response()
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    interval_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct TargetStats {
    name: String,
    continuous_failures: u64,
    windows: Vec<WindowSnapshot>,
}

/// GET /api/v1/targets/{name}/stats: windowed statistics for one target.
async fn handle_target_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Response {
    if state.upstreams.get(&name).is_none() {
        return json_error(StatusCode::NOT_FOUND, format!("unknown target {name:?}"));
    }

    let intervals = match query.interval_secs {
        Some(secs) => vec![Duration::from_secs(secs)],
        None => state.analysis.intervals(&name),
    };

    let mut windows = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match state.analysis.window_snapshot(&name, interval) {
            Some(snapshot) => windows.push(snapshot),
            None => {
                return json_error(
                    StatusCode::NOT_FOUND,
                    format!("no {}s window registered for {name:?}", interval.as_secs()),
                );
            }
        }
    }

    Json(TargetStats {
        continuous_failures: state.analysis.continuous_failure_count(&name),
        name,
        windows,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct LogLevelRequest {
    level: String,
}

/// GET /api/v1/log-level: return the active log filter.
async fn handle_get_log_level(State(state): State<Arc<AppState>>) -> Response {
    match state.log_level.current() {
        Ok(level) => Json(serde_json::json!({ "level": level })).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// PUT /api/v1/log-level: replace the active log filter.
async fn handle_set_log_level(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LogLevelRequest>,
) -> Response {
    match state.log_level.set(&payload.level) {
        Ok(()) => Json(serde_json::json!({ "level": payload.level })).into_response(),
        Err(e @ gateway_tracing::TracingError::InvalidFilter { .. }) => {
            json_error(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Health check endpoint.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "SIGINT", "Shutdown signal received, draining connections..."),
        _ = terminate => tracing::info!(signal = "SIGTERM", "Shutdown signal received, draining connections..."),
    }
}
