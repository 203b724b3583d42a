//! Span builder helpers for gateway instrumentation.

/// Create a tracing span for one proxied request to an upstream target.
///
/// Usage: `let span = upstream_request_span!(correlation_id, target);`
///
/// Fields recorded later by the proxy:
/// - `outcome`: `response`, `failure` or `reject`
/// - `status`: upstream HTTP status, when one was received
/// - `latency_ms`: milliseconds from send to upstream response headers
#[macro_export]
macro_rules! upstream_request_span {
    ($correlation_id:expr, $target:expr) => {
        tracing::info_span!(
            "upstream_request",
            correlation_id = %$correlation_id,
            target = %$target,
            outcome = tracing::field::Empty,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for the forward leg to an upstream URL.
#[macro_export]
macro_rules! upstream_forward_span {
    ($correlation_id:expr, $method:expr, $url:expr) => {
        tracing::info_span!(
            "upstream_forward",
            correlation_id = %$correlation_id,
            method = %$method,
            url = %$url,
        )
    };
}
