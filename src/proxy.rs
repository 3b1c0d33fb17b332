// src/proxy.rs

use crate::config::UpstreamConfig;
use crate::error::{AppError, Result, UpstreamError};
use axum::{
    body::Bytes,
    http::{header, HeaderMap, HeaderValue},
};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace, warn};
use url::Url;

/// Upstream header carrying the tokens consumed by a request.
pub const USAGE_HEADER: &str = "x-ratelimit-used";
pub const REFERER_HEADER: &str = "http-referer";
pub const TITLE_HEADER: &str = "x-title";

// Hop-by-hop headers that should not be relayed back to the client
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    // The relayed body is re-framed, so the upstream length no longer applies
    "content-length",
];

/// Headers for the upstream request: bearer auth, JSON content type, and the
/// attribution headers taken from the inbound request or defaulted.
pub fn build_upstream_headers(
    inbound: &HeaderMap,
    secret: &SecretString,
    upstream: &UpstreamConfig,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(4);

    let mut bearer = HeaderValue::from_str(&format!("Bearer {}", secret.expose_secret()))
        .map_err(|_| {
            AppError::Internal("API key contains characters not allowed in a header".to_string())
        })?;
    bearer.set_sensitive(true);
    headers.insert(header::AUTHORIZATION, bearer);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    add_attribution_header(&mut headers, inbound, REFERER_HEADER, &upstream.default_referer);
    add_attribution_header(&mut headers, inbound, TITLE_HEADER, &upstream.default_title);
    Ok(headers)
}

fn add_attribution_header(
    headers: &mut HeaderMap,
    inbound: &HeaderMap,
    name: &'static str,
    default: &str,
) {
    if let Some(value) = inbound.get(name) {
        headers.insert(name, value.clone());
        return;
    }
    match HeaderValue::from_str(default) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => {
            warn!(header = %name, error = %e, "Default header value is not a valid header, skipping");
        }
    }
}

/// Creates the `HeaderMap` for the response sent back to the original client.
pub fn build_response_headers(original_headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(original_headers.len());
    for (name, value) in original_headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            trace!(header = %name, "Skipping hop-by-hop header");
        } else {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Tokens reported by the upstream, 0 when absent or unparseable.
pub fn tokens_used(headers: &HeaderMap) -> u64 {
    headers
        .get(USAGE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// POST `body` upstream. Non-success statuses come back as
/// [`AppError::Upstream`] with the upstream body already read.
pub async fn send(
    client: &Client,
    url: &Url,
    headers: HeaderMap,
    body: Bytes,
) -> Result<reqwest::Response> {
    debug!(url = %url, "Forwarding request upstream");
    let response = client
        .post(url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        debug!(status = %status, "Upstream accepted request");
        return Ok(response);
    }

    let retry_after = retry_after(response.headers());
    let body = response.bytes().await.unwrap_or_else(|e| {
        warn!(status = %status, error = %e, "Failed to read upstream error body");
        Bytes::new()
    });
    warn!(status = %status, retry_after, "Upstream returned an error status");
    Err(AppError::Upstream(UpstreamError {
        status,
        retry_after,
        body,
    }))
}
