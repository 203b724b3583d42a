//! Subscriber assembly, OTLP exporter setup and TracingGuard.

use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer};

use crate::config::{OtlpProtocol, TracingConfig};
use crate::level::LogLevelHandle;

/// RAII guard that shuts down the tracer provider on drop.
///
/// Also carries the [`LogLevelHandle`] for the installed filter.
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
    log_level: LogLevelHandle,
}

impl TracingGuard {
    /// Handle for changing the log filter at runtime.
    pub fn log_level(&self) -> LogLevelHandle {
        self.log_level.clone()
    }

    pub fn otlp_enabled(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(ref mut provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {e}");
            }
        }
    }
}

/// Initialize the tracing subsystem with fmt logging and optional OTLP export.
///
/// The filter sits behind a reload layer so the management API can change it
/// while the gateway runs. If the OTLP exporter fails to initialize, falls
/// back to fmt-only tracing so the gateway can start without a collector.
///
/// Returns a [`TracingGuard`] that must be held for the lifetime of the
/// application to ensure traces are flushed on shutdown.
pub fn init_tracing(config: &TracingConfig) -> TracingGuard {
    let env_filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);
    let log_level = LogLevelHandle::new(filter_handle);

    // Skip OTLP entirely if no endpoint is configured
    let endpoint = match &config.otlp_endpoint {
        Some(url) => url.clone(),
        None => {
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer(config.json))
                .init();
            return TracingGuard {
                provider: None,
                log_level,
            };
        }
    };

    let provider = match build_provider(config, &endpoint) {
        Ok(provider) => provider,
        Err(e) => {
            // OTLP failed, fall back to fmt-only so the gateway still starts
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer(config.json))
                .init();

            tracing::warn!(
                error = %e,
                endpoint = %endpoint,
                "OTLP exporter failed to initialize, running with fmt-only tracing"
            );

            return TracingGuard {
                provider: None,
                log_level,
            };
        }
    };

    let tracer = provider.tracer(config.service_name.clone());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(fmt_layer(config.json))
        .init();

    tracing::info!(
        endpoint = %endpoint,
        service = %config.service_name,
        protocol = ?config.protocol,
        "OpenTelemetry OTLP tracing initialized"
    );

    TracingGuard {
        provider: Some(provider),
        log_level,
    }
}

fn fmt_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Build the batch-exporting tracer provider. Returns Err if the exporter
/// cannot be built.
fn build_provider(config: &TracingConfig, endpoint: &str) -> Result<SdkTracerProvider> {
    let otlp_exporter = match config.protocol {
        OtlpProtocol::Grpc => opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?,
        OtlpProtocol::Http => opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()?,
    };

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build())
}
