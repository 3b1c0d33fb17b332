// src/handlers/mod.rs

use crate::orchestrator::ChatRequest;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, warn};

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Breaker, pool and key-pool diagnostics.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "circuit_breaker": state.circuit_breaker.status(),
        "connection_pool": state.pool.snapshot(),
        "keys": state.key_manager.stats(),
    }))
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match ChatRequest::from_json(headers, body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected chat completion request");
            return e.into_response();
        }
    };

    match state.orchestrator.handle(request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            let status = e.status_code();
            error!(
                status = status.as_u16(),
                message = %e,
                circuit = ?state.circuit_breaker.status(),
                "Proxy request failed"
            );
            e.into_response()
        }
    }
}
