// src/key_manager.rs

use crate::config::KeysConfig;
use crate::debounce::Debouncer;
use crate::error::{AppError, Result};
use crate::storage::{KeyRecord, KeyStore, PersistedKey};
use chrono::Utc;
use parking_lot::Mutex;
use secrecy::SecretString;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

/// A key handed out by [`KeyManager::select_key`].
///
/// Outcomes are reported back against the lease, so concurrent requests never
/// clobber each other's notion of the "current" key.
#[derive(Debug, Clone)]
pub struct KeyLease {
    pub index: usize,
    pub key_id: String,
    secret: SecretString,
}

impl KeyLease {
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }
}

#[derive(Debug, Clone)]
pub struct KeyPolicy {
    pub max_failures: u32,
    pub rate_limit_cooldown: Duration,
    pub persist_debounce: Duration,
    pub quota_limits: HashMap<String, u64>,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::from(&KeysConfig::default())
    }
}

impl From<&KeysConfig> for KeyPolicy {
    fn from(config: &KeysConfig) -> Self {
        Self {
            max_failures: config.max_failures,
            rate_limit_cooldown: config.rate_limit_cooldown(),
            persist_debounce: config.persist_debounce(),
            quota_limits: config.quota_limits.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct KeyPoolStats {
    pub total: usize,
    pub active: usize,
}

#[derive(Debug, Default)]
struct KeyPool {
    keys: Vec<KeyRecord>,
    active: usize,
}

impl KeyPool {
    fn new(keys: Vec<KeyRecord>) -> Self {
        let active = keys.iter().filter(|k| k.is_active).count();
        Self { keys, active }
    }

    fn persisted(&self) -> Vec<PersistedKey> {
        self.keys.iter().map(KeyRecord::to_persisted).collect()
    }

    /// Looks a lease up, ignoring it if the pool changed underneath.
    fn leased_mut(&mut self, lease: &KeyLease) -> Option<&mut KeyRecord> {
        self.keys
            .get_mut(lease.index)
            .filter(|key| key.id == lease.key_id)
    }
}

/// Owns the key pool: selection by score, quota and failure bookkeeping, and
/// debounced persistence to a [`KeyStore`].
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    policy: KeyPolicy,
    pool: Arc<Mutex<KeyPool>>,
    initialized: OnceCell<()>,
    closed: AtomicBool,
    debouncer: Debouncer,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>, policy: KeyPolicy) -> Self {
        let debouncer = Debouncer::new(policy.persist_debounce);
        Self {
            store,
            policy,
            pool: Arc::new(Mutex::new(KeyPool::default())),
            initialized: OnceCell::new(),
            closed: AtomicBool::new(false),
            debouncer,
        }
    }

    /// Build a manager that is already initialized with `records`.
    pub fn with_records(store: Arc<dyn KeyStore>, policy: KeyPolicy, records: Vec<KeyRecord>) -> Self {
        let manager = Self::new(store, policy);
        *manager.pool.lock() = KeyPool::new(records);
        // A fresh cell cannot already be set.
        let _ = manager.initialized.set(());
        manager
    }

    /// Load the pool from the store. Only the first call does any work.
    #[instrument(level = "debug", skip(self), name = "key_manager_init")]
    pub async fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                let persisted = self.store.load().await?;
                let records: Vec<KeyRecord> =
                    persisted.into_iter().map(KeyRecord::from_persisted).collect();
                let pool = KeyPool::new(records);
                info!(total = pool.keys.len(), active = pool.active, "Key pool loaded");
                *self.pool.lock() = pool;
                Ok::<(), AppError>(())
            })
            .await
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Pick the highest-scoring selectable key for `model`.
    #[instrument(level = "debug", skip(self))]
    pub async fn select_key(&self, model: &str) -> Result<KeyLease> {
        self.initialize().await?;

        let now = Utc::now();
        let mut pool = self.pool.lock();
        let mut best: Option<(usize, f64)> = None;
        let mut fallback: Option<usize> = None;

        for (index, key) in pool.keys.iter_mut().enumerate() {
            if !key.is_selectable(now) {
                continue;
            }
            if fallback.is_none() {
                fallback = Some(index);
            }
            let score = key.score(model, now);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((index, score));
            }
        }

        let Some((mut chosen, score)) = best else {
            warn!(model, "No selectable key");
            return Err(AppError::NoAvailableKeys {
                model: model.to_string(),
            });
        };

        if pool.keys[chosen].remaining_quota(model, now).is_exhausted() {
            if let Some(first) = fallback {
                info!(
                    event = "key_event",
                    action = "quota_fallback",
                    key_id = %pool.keys[first].id,
                    exhausted_key_id = %pool.keys[chosen].id,
                    model,
                    "Best key has no quota left, using fallback key"
                );
                chosen = first;
            }
        }

        let key = &pool.keys[chosen];
        debug!(key_id = %key.id, score, "Selected key");
        Ok(KeyLease {
            index: chosen,
            key_id: key.id.clone(),
            secret: key.secret.clone(),
        })
    }

    #[instrument(level = "debug", skip(self, lease), fields(key_id = %lease.key_id))]
    pub fn report_success(&self, lease: &KeyLease, elapsed: Duration, model: &str, tokens_used: u64) {
        {
            let mut pool = self.pool.lock();
            let Some(key) = pool.leased_mut(lease) else {
                debug!("Ignoring success report for a key no longer in the pool");
                return;
            };
            let now = Utc::now();
            key.last_used_at = Some(now);
            key.failure_count = 0;
            let limit = self.policy.quota_limits.get(model).copied();
            key.record_usage(model, tokens_used, limit, now);
            debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                tokens_used,
                "Request succeeded"
            );
        }
        self.schedule_persist();
    }

    #[instrument(level = "debug", skip(self, lease, error), fields(key_id = %lease.key_id))]
    pub fn report_failure(&self, lease: &KeyLease, error: &AppError) {
        {
            let mut pool = self.pool.lock();
            let mut deactivated = false;
            let Some(key) = pool.leased_mut(lease) else {
                debug!("Ignoring failure report for a key no longer in the pool");
                return;
            };
            key.failure_count += 1;

            if matches!(error, AppError::Upstream(upstream) if upstream.is_rate_limited()) {
                key.start_cooldown(self.policy.rate_limit_cooldown, Utc::now());
                info!(
                    event = "key_event",
                    action = "rate_limited",
                    key_id = %key.id,
                    cooldown_secs = self.policy.rate_limit_cooldown.as_secs(),
                    "Key rate limited, cooling down"
                );
            }

            if key.failure_count >= self.policy.max_failures && key.is_active {
                key.is_active = false;
                deactivated = true;
                warn!(
                    event = "key_event",
                    action = "deactivated",
                    key_id = %key.id,
                    failure_count = key.failure_count,
                    error = %error,
                    "Key deactivated after repeated failures"
                );
            } else {
                debug!(failure_count = key.failure_count, error = %error, "Recorded key failure");
            }

            if deactivated {
                pool.active = pool.active.saturating_sub(1);
            }
        }
        self.schedule_persist();
    }

    pub fn stats(&self) -> KeyPoolStats {
        let pool = self.pool.lock();
        KeyPoolStats {
            total: pool.keys.len(),
            active: pool.active,
        }
    }

    /// Clone of the in-memory pool, for diagnostics.
    pub fn records(&self) -> Vec<KeyRecord> {
        self.pool.lock().keys.clone()
    }

    /// Write the pool to the store immediately.
    pub async fn persist_now(&self) -> Result<()> {
        let keys = self.pool.lock().persisted();
        self.store.save(&keys).await
    }

    fn schedule_persist(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let store = self.store.clone();
        let pool = self.pool.clone();
        self.debouncer.schedule(move || async move {
            // Snapshot when the write runs, not when it was scheduled.
            let keys = pool.lock().persisted();
            if let Err(e) = store.save(&keys).await {
                error!(error = %e, "Failed to persist key pool");
            }
        });
    }

    /// Cancel any pending write, flush, and drop the in-memory pool.
    #[instrument(level = "info", skip(self), name = "key_manager_shutdown")]
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.debouncer.cancel_and_wait().await;

        if self.is_initialized() {
            self.persist_now()
                .await
                .map_err(|e| AppError::Shutdown(format!("failed to flush key pool: {e}")))?;
        }

        *self.pool.lock() = KeyPool::default();
        info!("Key manager shut down");
        Ok(())
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("stats", &self.stats())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
