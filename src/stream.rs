// src/stream.rs

use crate::error::{AppError, Result};
use crate::key_manager::{KeyLease, KeyManager};
use crate::pool::PooledTransport;
use crate::proxy;
use axum::body::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Reported to the key manager once the body has been fully relayed.
struct Completion {
    key_manager: Arc<KeyManager>,
    lease: KeyLease,
    model: String,
    started: Instant,
    tokens_used: u64,
}

/// Upstream response body relayed to the client chunk by chunk.
///
/// Holds the pooled transport and the attempt's cancellation token for as
/// long as it lives. Dropping it (the client went away) cancels the upstream
/// read without reporting success.
pub struct RelayStream {
    inner: BoxStream<'static, std::result::Result<Bytes, reqwest::Error>>,
    primed: Option<Bytes>,
    completion: Option<Completion>,
    token: CancellationToken,
    transport: Option<PooledTransport>,
    finished: bool,
    _cancel_on_drop: DropGuard,
}

impl RelayStream {
    /// Wait for the first chunk so that failures before any byte reaches the
    /// client can still be retried or turned into an error response.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        response: reqwest::Response,
        transport: PooledTransport,
        token: CancellationToken,
        key_manager: Arc<KeyManager>,
        lease: KeyLease,
        model: String,
        started: Instant,
        first_chunk_timeout: Duration,
    ) -> Result<Self> {
        let tokens_used = proxy::tokens_used(response.headers());
        let mut inner = response
            .bytes_stream()
            .take_until(token.clone().cancelled_owned())
            .boxed();

        let primed = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(AppError::Shutdown("stream cancelled before first chunk".to_string()));
            }
            first = tokio::time::timeout(first_chunk_timeout, inner.next()) => match first {
                Err(_) => return Err(AppError::Timeout(first_chunk_timeout)),
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Upstream stream failed before first chunk");
                    return Err(AppError::Stream(e.to_string()));
                }
                Ok(Some(Ok(chunk))) => Some(chunk),
                Ok(None) => None,
            },
        };

        debug!(key_id = %lease.key_id, "Streaming upstream response");
        Ok(Self {
            inner,
            finished: false,
            primed,
            completion: Some(Completion {
                key_manager,
                lease,
                model,
                started,
                tokens_used,
            }),
            _cancel_on_drop: token.clone().drop_guard(),
            token,
            transport: Some(transport),
        })
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    fn finish(&mut self, success: bool) {
        self.finished = true;
        self.transport = None;
        let Some(completion) = self.completion.take() else {
            return;
        };
        if success && !self.token.is_cancelled() {
            completion.key_manager.report_success(
                &completion.lease,
                completion.started.elapsed(),
                &completion.model,
                completion.tokens_used,
            );
            debug!(key_id = %completion.lease.key_id, "Stream completed");
        }
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(chunk) = this.primed.take() {
            return Poll::Ready(Some(Ok(chunk)));
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                warn!(error = %e, "Upstream stream failed mid-response");
                this.token.cancel();
                this.finish(false);
                Poll::Ready(Some(Err(AppError::Stream(e.to_string()))))
            }
            Poll::Ready(None) => {
                this.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Client disconnected before stream completed, cancelling upstream read");
        }
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("finished", &self.finished)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
