//! Transparent passthrough to the upstream Git server.
//!
//! Everything this proxy does not intercept flows through here: info/refs,
//! non-fetch upload-pack commands, receive-pack (pushes are never cached),
//! LFS endpoints other than the rewritten ones, and any other path.  Bodies
//! stream in both directions; nothing is buffered.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, instrument, warn};

/// Request headers that must not be forwarded: hop-by-hop, or invalidated
/// by re-encoding on the upstream connection.
const REQUEST_HEADER_BLACKLIST: [HeaderName; 5] = [
    header::HOST,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::CONNECTION,
];

/// Response headers dropped before relaying: the client connection does its
/// own framing.
const RESPONSE_HEADER_BLACKLIST: [HeaderName; 2] = [header::TRANSFER_ENCODING, header::CONNECTION];

/// Strip the blacklist from request headers before forwarding.
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = headers.clone();
    for name in &REQUEST_HEADER_BLACKLIST {
        filtered.remove(name);
    }
    filtered
}

fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = headers.clone();
    for name in &RESPONSE_HEADER_BLACKLIST {
        filtered.remove(name);
    }
    filtered
}

/// Forward one request to `<upstream_base><path_and_query>` and stream the
/// response back verbatim (status, headers, trailing data and all).
///
/// Upstream errors are relayed with their status; a connection failure
/// becomes a 502.
#[instrument(skip_all, fields(%method, path = %path_and_query))]
pub async fn forward(
    client: &reqwest::Client,
    upstream_base: &str,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: reqwest::Body,
) -> Response {
    let upstream_url = format!(
        "{}{}",
        upstream_base,
        path_and_query.trim_start_matches('/')
    );

    let result = client
        .request(method, &upstream_url)
        .headers(filter_request_headers(headers))
        .body(body)
        .send()
        .await;

    let upstream = match result {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, %upstream_url, "upstream unreachable");
            return (StatusCode::BAD_GATEWAY, "Bad gateway").into_response();
        }
    };

    let status = upstream.status();
    if status.is_server_error() {
        warn!(%status, %upstream_url, "upstream returned server error");
    } else {
        debug!(%status, "upstream responded");
    }

    let mut response = Response::builder().status(status.as_u16());
    if let Some(headers) = response.headers_mut() {
        *headers = filter_response_headers(upstream.headers());
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to assemble proxied response");
            (StatusCode::BAD_GATEWAY, "Bad gateway").into_response()
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
