// src/lib.rs

pub mod circuit_breaker;
pub mod cli;
pub mod config;
pub mod debounce;
pub mod error;
pub mod handlers;
pub mod key_manager;
pub mod orchestrator;
pub mod pool;
pub mod proxy;
pub mod state;
pub mod storage;
pub mod stream;

use crate::handlers::{chat_completions, health_check, status};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request as AxumRequest},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use state::AppState;

/// Builds the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.config.server.max_body_bytes;
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(axum::middleware::from_fn(trace_requests))
        .with_state(state)
}

/// Attaches a request id and a tracing span to every request.
async fn trace_requests(
    mut req: AxumRequest<Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let request_id = Uuid::new_v4();
    let start_time = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = info_span!(
        "request",
        request_id = %request_id,
        http.method = %method,
        url.path = %path,
    );

    req.extensions_mut().insert(request_id);

    async move {
        let mut response = next.run(req).await;
        let elapsed = start_time.elapsed();

        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert("X-Request-ID", value);
        }

        info!(
            http.response.duration = ?elapsed,
            http.status_code = response.status().as_u16(),
            "Finished processing request"
        );

        response
    }
    .instrument(span)
    .await
}

/// Bind `host:port`, moving up to `port + fallback_range` while the port is taken.
pub async fn bind_with_fallback(host: &str, port: u16, fallback_range: u16) -> Result<TcpListener> {
    let last = port.saturating_add(fallback_range);
    for candidate in port..=last {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                if candidate != port {
                    info!(server.port = candidate, requested_port = port, "Bound to fallback port");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!("Port {} in use, trying {}", candidate, candidate.saturating_add(1));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(AppError::Io(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("No available ports between {port}-{last}"),
    )))
}

/// Build the state, load the key pool and serve until `signal` resolves.
///
/// Shutdown order: stop accepting, cancel in-flight upstream calls, close the
/// connection pool, flush the key pool.
pub async fn serve(
    config: AppConfig,
    listener: TcpListener,
    signal: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let state = Arc::new(AppState::new(config)?);
    state.key_manager.initialize().await.map_err(|e| {
        error!(error = %e, "Failed to load key store. Exiting.");
        e
    })?;
    let stats = state.key_manager.stats();
    info!(keys.total = stats.total, keys.active = stats.active, "Key pool ready");

    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(server.address = ?addr, "Server listening");

    let shutdown = state.shutdown_token().clone();
    let app = create_router(state.clone());
    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            signal.await;
            // Open streams would otherwise hold graceful shutdown open.
            shutdown.cancel();
        })
        .await;

    if let Err(e) = &served {
        error!(error = ?e, "Server run loop encountered an error");
    }
    state.shutdown().await?;
    info!("Server shut down gracefully.");
    served.map_err(AppError::from)
}
