//! Common test utilities and fixtures
#![allow(dead_code)]

use openrouter_proxy::{
    config::AppConfig,
    storage::{InMemoryStore, PersistedKey},
    AppState,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Test configuration builder
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.upstream.default_retry_after_secs = 0;
        Self { config }
    }

    /// Point the upstream at a mock server root.
    pub fn with_upstream(mut self, server_uri: &str) -> Self {
        self.config.upstream.base_url = format!("{}/api/v1", server_uri.trim_end_matches('/'));
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.config.upstream.request_timeout_secs = secs;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.config.server.max_body_bytes = bytes;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `n` distinct, active, never-used keys.
pub fn test_keys(n: usize) -> Vec<PersistedKey> {
    (0..n)
        .map(|i| PersistedKey::new(format!("sk-or-v1-test-key-{i:04}-abcdefgh")))
        .collect()
}

pub fn test_secret(i: usize) -> String {
    format!("sk-or-v1-test-key-{i:04}-abcdefgh")
}

/// App state over an in-memory key store, with the pool already loaded.
pub async fn build_state(config: AppConfig, keys: Vec<PersistedKey>) -> (Arc<AppState>, InMemoryStore) {
    let store = InMemoryStore::new(keys);
    let state = AppState::with_store(config, Arc::new(store.clone())).expect("state should build");
    state
        .key_manager
        .initialize()
        .await
        .expect("key pool should load");
    (Arc::new(state), store)
}

/// A bare HTTP upstream that sends one SSE chunk and then never finishes.
///
/// Returns the server root URI and a receiver that fires once the proxy
/// closes the connection.
pub async fn spawn_hanging_stream_server() -> (String, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;

        let chunk = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
            chunk.len(),
            chunk
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();

        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        let _ = closed_tx.send(());
    });

    (format!("http://{addr}"), closed_rx)
}
