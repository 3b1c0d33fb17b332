// src/state.rs

use crate::circuit_breaker::CircuitBreaker;
use crate::config::AppConfig;
use crate::error::Result;
use crate::key_manager::{KeyManager, KeyPolicy};
use crate::orchestrator::RequestOrchestrator;
use crate::pool::ConnectionPool;
use crate::storage::{JsonFileStore, KeyStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Represents the shared application state that is accessible by all Axum handlers.
pub struct AppState {
    pub config: AppConfig,
    pub key_manager: Arc<KeyManager>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub pool: Arc<ConnectionPool>,
    pub orchestrator: RequestOrchestrator,
    shutdown: CancellationToken,
}

impl AppState {
    /// State backed by the JSON key file named in the configuration.
    pub fn new(config: AppConfig) -> Result<Self> {
        let store = Arc::new(JsonFileStore::new(&config.keys.store_path));
        Self::with_store(config, store)
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn KeyStore>) -> Result<Self> {
        let key_manager = Arc::new(KeyManager::new(store, KeyPolicy::from(&config.keys)));
        Self::with_key_manager(config, key_manager)
    }

    pub fn with_key_manager(config: AppConfig, key_manager: Arc<KeyManager>) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let pool = Arc::new(ConnectionPool::new(config.connection_pool.clone()));
        let orchestrator = RequestOrchestrator::new(
            key_manager.clone(),
            circuit_breaker.clone(),
            pool.clone(),
            config.upstream.clone(),
            shutdown.clone(),
        )?;

        Ok(Self {
            config,
            key_manager,
            circuit_breaker,
            pool,
            orchestrator,
            shutdown,
        })
    }

    /// Cancelled when the process starts shutting down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Cancel in-flight upstream calls, close the pool and flush the key pool.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down application state");
        self.shutdown.cancel();
        self.pool.close_all();
        self.key_manager.shutdown().await
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("key_manager", &self.key_manager)
            .field("circuit_breaker", &self.circuit_breaker.status())
            .finish_non_exhaustive()
    }
}
