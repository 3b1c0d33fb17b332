// src/orchestrator.rs

use crate::circuit_breaker::CircuitBreaker;
use crate::config::UpstreamConfig;
use crate::error::{AppError, Result};
use crate::key_manager::{KeyLease, KeyManager};
use crate::pool::ConnectionPool;
use crate::proxy;
use crate::stream::RelayStream;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::Instant as Deadline;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// An inbound chat-completion request, forwarded to the upstream verbatim.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub stream: bool,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ChatRequest {
    /// Reads `model` (default `"default"`) and `stream` (only a literal
    /// `true` streams) from the JSON body.
    pub fn from_json(headers: HeaderMap, body: Bytes) -> Result<Self> {
        let json: Value = serde_json::from_slice(&body)
            .map_err(|e| AppError::InvalidRequest(format!("Invalid JSON body: {e}")))?;
        let model = json
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("default")
            .to_string();
        let stream = json.get("stream").and_then(Value::as_bool) == Some(true);
        Ok(Self {
            model,
            stream,
            headers,
            body,
        })
    }
}

/// What a successful request hands back to the HTTP layer.
#[derive(Debug)]
pub enum ProxyResponse {
    Complete {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Stream {
        status: StatusCode,
        headers: HeaderMap,
        body: RelayStream,
    },
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Complete {
                status,
                headers,
                body,
            } => (status, headers, body).into_response(),
            Self::Stream {
                status,
                headers,
                body,
            } => (status, headers, Body::from_stream(body)).into_response(),
        }
    }
}

/// Delay before the next attempt after `error` on attempt number `attempt`.
///
/// Only upstream rate limits back off; the delay grows linearly with the
/// attempt number.
pub fn rate_limit_backoff(error: &AppError, attempt: u32, default_retry_after: u64) -> Option<Duration> {
    match error {
        AppError::Upstream(upstream) if upstream.is_rate_limited() => {
            let seconds = upstream.retry_after.unwrap_or(default_retry_after);
            Some(Duration::from_millis(
                seconds.saturating_mul(1000).saturating_mul(u64::from(attempt)),
            ))
        }
        _ => None,
    }
}

/// Per-request control loop: select a key, call upstream, classify the
/// outcome and retry, all inside the circuit breaker.
pub struct RequestOrchestrator {
    key_manager: Arc<KeyManager>,
    breaker: Arc<CircuitBreaker>,
    pool: Arc<ConnectionPool>,
    upstream: UpstreamConfig,
    url: Url,
    shutdown: CancellationToken,
}

impl RequestOrchestrator {
    pub fn new(
        key_manager: Arc<KeyManager>,
        breaker: Arc<CircuitBreaker>,
        pool: Arc<ConnectionPool>,
        upstream: UpstreamConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let url = Url::parse(&upstream.chat_completions_url()).map_err(|e| {
            AppError::config_validation(
                format!("Invalid upstream URL: {e}"),
                Some("upstream.base_url"),
            )
        })?;
        Ok(Self {
            key_manager,
            breaker,
            pool,
            upstream,
            url,
            shutdown,
        })
    }

    #[instrument(level = "info", skip(self, request), fields(model = %request.model, stream = request.stream))]
    pub async fn handle(&self, request: ChatRequest) -> Result<ProxyResponse> {
        self.breaker.execute(|| self.run(&request)).await
    }

    async fn run(&self, request: &ChatRequest) -> Result<ProxyResponse> {
        let max_attempts = self.upstream.max_attempts;
        let mut last_failure: Option<(AppError, KeyLease)> = None;

        for attempt in 1..=max_attempts {
            let lease = self.key_manager.select_key(&request.model).await?;
            let started = Instant::now();
            let token = self.shutdown.child_token();

            let error = match self.attempt(request, &lease, token.clone(), started).await {
                Ok(response) => {
                    debug!(attempt, key_id = %lease.key_id, "Upstream request succeeded");
                    return Ok(response);
                }
                Err(error) => error,
            };
            token.cancel();

            if matches!(error, AppError::Shutdown(_)) {
                return Err(error);
            }

            warn!(
                attempt,
                max_attempts,
                key_id = %lease.key_id,
                error = %error,
                "Upstream attempt failed"
            );

            let backoff = (attempt < max_attempts)
                .then(|| rate_limit_backoff(&error, attempt, self.upstream.default_retry_after_secs))
                .flatten();
            last_failure = Some((error, lease));

            if let Some(delay) = backoff {
                info!(delay_ms = delay.as_millis() as u64, "Rate limited, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => {
                        return Err(AppError::Shutdown("shutdown during retry backoff".to_string()));
                    }
                }
            }
        }

        let (error, lease) = last_failure
            .ok_or_else(|| AppError::Internal("no upstream attempt was made".to_string()))?;
        if error.upstream_status().is_some() {
            self.key_manager.report_failure(&lease, &error);
        }
        Err(error)
    }

    async fn attempt(
        &self,
        request: &ChatRequest,
        lease: &KeyLease,
        token: CancellationToken,
        started: Instant,
    ) -> Result<ProxyResponse> {
        let timeout = self.upstream.request_timeout();
        let deadline = Deadline::now() + timeout;
        let headers = proxy::build_upstream_headers(&request.headers, lease.secret(), &self.upstream)?;

        let (transport, response) = guarded(&token, deadline, timeout, async {
            let transport = self.pool.acquire(&self.url).await?;
            let response =
                proxy::send(transport.client(), &self.url, headers, request.body.clone()).await?;
            Ok::<_, AppError>((transport, response))
        })
        .await?;

        let status = response.status();
        let response_headers = proxy::build_response_headers(response.headers());

        if request.stream {
            let remaining = deadline.saturating_duration_since(Deadline::now());
            let body = RelayStream::start(
                response,
                transport,
                token,
                self.key_manager.clone(),
                lease.clone(),
                request.model.clone(),
                started,
                remaining,
            )
            .await?;
            return Ok(ProxyResponse::Stream {
                status,
                headers: response_headers,
                body,
            });
        }

        let tokens_used = proxy::tokens_used(response.headers());
        let body = guarded(&token, deadline, timeout, async {
            Ok::<_, AppError>(response.bytes().await?)
        })
        .await?;
        drop(transport);

        self.key_manager
            .report_success(lease, started.elapsed(), &request.model, tokens_used);
        Ok(ProxyResponse::Complete {
            status,
            headers: response_headers,
            body,
        })
    }
}

/// Run `work` until it finishes, the attempt is cancelled, or `deadline` passes.
async fn guarded<T>(
    token: &CancellationToken,
    deadline: Deadline,
    timeout: Duration,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AppError::Shutdown("upstream request cancelled".to_string())),
        outcome = tokio::time::timeout_at(deadline, work) => {
            outcome.map_err(|_| AppError::Timeout(timeout))?
        }
    }
}
