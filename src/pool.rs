// src/pool.rs

use crate::config::ConnectionPoolConfig;
use crate::error::{AppError, Result};
use dashmap::DashMap;
use reqwest::{Client, ClientBuilder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone)]
struct HostTransport {
    client: Client,
    permits: Arc<Semaphore>,
}

/// A keep-alive client for one upstream host plus a concurrency slot.
///
/// The slot is released when this value is dropped, so a streaming response
/// keeps it for as long as the body is being relayed.
#[derive(Debug)]
pub struct PooledTransport {
    host: String,
    client: Client,
    _permit: OwnedSemaphorePermit,
}

impl PooledTransport {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HostSnapshot {
    pub in_flight: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub closed: bool,
    pub max_sockets: usize,
    pub hosts: BTreeMap<String, HostSnapshot>,
}

/// Host-keyed cache of keep-alive HTTP clients with a per-host cap on
/// concurrent requests.
#[derive(Debug)]
pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    transports: DashMap<String, HostTransport>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: ConnectionPoolConfig) -> Self {
        Self {
            config,
            transports: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn configure_builder(&self, builder: ClientBuilder) -> ClientBuilder {
        let keep_alive = Duration::from_secs(self.config.keep_alive_secs);
        builder
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .pool_idle_timeout(keep_alive)
            .pool_max_idle_per_host(self.config.max_free_sockets)
            .tcp_keepalive(Some(keep_alive))
    }

    fn host_key(url: &Url) -> Result<String> {
        let host = url
            .host_str()
            .ok_or_else(|| AppError::Internal(format!("Upstream URL has no host: {url}")))?;
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(format!("{host}:{port}"))
    }

    fn transport_for(&self, host: &str) -> Result<HostTransport> {
        if let Some(existing) = self.transports.get(host) {
            return Ok(existing.clone());
        }
        let entry = self.transports.entry(host.to_string()).or_try_insert_with(|| {
            let client = self
                .configure_builder(Client::builder())
                .build()
                .map_err(|e| AppError::HttpClientBuild(e.to_string()))?;
            info!(host, "Created pooled HTTP client");
            Ok::<_, AppError>(HostTransport {
                client,
                permits: Arc::new(Semaphore::new(self.config.max_sockets)),
            })
        })?;
        Ok(entry.clone())
    }

    /// Wait for a free slot on the host serving `url`.
    pub async fn acquire(&self, url: &Url) -> Result<PooledTransport> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Shutdown("connection pool is closed".to_string()));
        }
        let host = Self::host_key(url)?;
        let transport = self.transport_for(&host)?;
        let permit = transport
            .permits
            .acquire_owned()
            .await
            .map_err(|_| AppError::Shutdown("connection pool is closed".to_string()))?;
        debug!(host = %host, "Acquired pooled transport");
        Ok(PooledTransport {
            host,
            client: transport.client,
            _permit: permit,
        })
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let hosts = self
            .transports
            .iter()
            .map(|entry| {
                let available = entry.value().permits.available_permits();
                let snapshot = HostSnapshot {
                    in_flight: self.config.max_sockets.saturating_sub(available),
                    available,
                };
                (entry.key().clone(), snapshot)
            })
            .collect();
        PoolSnapshot {
            closed: self.closed.load(Ordering::SeqCst),
            max_sockets: self.config.max_sockets,
            hosts,
        }
    }

    /// Refuse new acquisitions and drop every cached client.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.transports.iter() {
            entry.value().permits.close();
        }
        self.transports.clear();
        info!("Connection pool closed");
    }
}
