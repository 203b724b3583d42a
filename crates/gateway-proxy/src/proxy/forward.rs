//! Raw byte forwarding to an upstream target.
//!
//! Bodies are relayed verbatim in both directions. The caller gets back the
//! client-facing response plus what the analysis engine needs to classify the
//! attempt.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::Instrument;

use super::correlation::CORRELATION_HEADER;

/// Headers that should NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// How a forwarded attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The upstream answered with a non-5xx status.
    Response,
    /// Transport error, timeout or 5xx status.
    Failure,
}

/// Result of one forward: the client response and its classification.
pub struct Forwarded {
    pub outcome: Outcome,
    pub status: StatusCode,
    /// Time from send until upstream response headers (or the error).
    pub latency: Duration,
    pub response: Response,
}

/// Classify an upstream status. Server errors count against the target.
pub fn classify(status: StatusCode) -> Outcome {
    if status.is_server_error() {
        Outcome::Failure
    } else {
        Outcome::Response
    }
}

/// Forward a request with its original method, non-hop-by-hop headers and body.
pub async fn forward(
    client: &reqwest::Client,
    timeout: Duration,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
    correlation_id: &str,
) -> Forwarded {
    let span = gateway_tracing::upstream_forward_span!(correlation_id, method, url);

    async {
        let mut req_builder = client
            .request(method, url)
            .timeout(timeout)
            .body(body)
            .header(CORRELATION_HEADER, correlation_id);

        for (name, value) in headers.iter() {
            let name_str = name.as_str().to_lowercase();
            if HOP_BY_HOP_HEADERS.contains(&name_str.as_str()) || name_str == CORRELATION_HEADER {
                continue;
            }
            req_builder = req_builder.header(name, value);
        }

        let start = Instant::now();
        let upstream_result = req_builder.send().await;
        let latency = start.elapsed();

        build_response(upstream_result, latency, correlation_id)
    }
    .instrument(span)
    .await
}

fn build_response(
    upstream_result: Result<reqwest::Response, reqwest::Error>,
    latency: Duration,
    correlation_id: &str,
) -> Forwarded {
    let upstream_resp = match upstream_result {
        Ok(resp) => resp,
        Err(e) => {
            let (status, message) = if e.is_timeout() {
                tracing::error!(error = %e, "Upstream timeout");
                (StatusCode::GATEWAY_TIMEOUT, "upstream timeout")
            } else {
                tracing::error!(error = %e, "Upstream connection error");
                (StatusCode::BAD_GATEWAY, "upstream connection error")
            };
            return Forwarded {
                outcome: Outcome::Failure,
                status,
                latency,
                response: (status, message).into_response(),
            };
        }
    };

    let status = StatusCode::from_u16(upstream_resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    tracing::debug!(
        status = status.as_u16(),
        latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        "Forward complete"
    );

    let mut response_builder = Response::builder().status(status);

    for (name, value) in upstream_resp.headers().iter() {
        let name_str = name.as_str().to_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&name_str.as_str()) {
            continue;
        }
        response_builder = response_builder.header(name, value);
    }

    response_builder = response_builder.header(
        CORRELATION_HEADER,
        HeaderValue::from_str(correlation_id)
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    );

    // Stream the body verbatim
    let body = Body::from_stream(upstream_resp.bytes_stream());

    let response = response_builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to build response");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    });

    Forwarded {
        outcome: classify(status),
        status,
        latency,
        response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_counts_only_server_errors() {
        assert_eq!(classify(StatusCode::OK), Outcome::Response);
        assert_eq!(classify(StatusCode::NOT_FOUND), Outcome::Response);
        assert_eq!(classify(StatusCode::TOO_MANY_REQUESTS), Outcome::Response);
        assert_eq!(classify(StatusCode::INTERNAL_SERVER_ERROR), Outcome::Failure);
        assert_eq!(classify(StatusCode::SERVICE_UNAVAILABLE), Outcome::Failure);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_a_failure() {
        let client = reqwest::Client::new();
        // Port 9 (discard) on loopback is not expected to accept HTTP.
        let forwarded = forward(
            &client,
            Duration::from_secs(2),
            Method::GET,
            "http://127.0.0.1:9/unreachable",
            &HeaderMap::new(),
            Bytes::new(),
            "test-correlation",
        )
        .await;

        assert_eq!(forwarded.outcome, Outcome::Failure);
        assert!(matches!(
            forwarded.status,
            StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT
        ));
    }
}
