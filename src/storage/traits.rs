// src/storage/traits.rs

use crate::error::Result;
use crate::storage::PersistedKey;
use async_trait::async_trait;

/// Durable home of the key pool.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load every persisted key, in pool order.
    async fn load(&self) -> Result<Vec<PersistedKey>>;

    /// Replace the stored pool with `keys`.
    async fn save(&self, keys: &[PersistedKey]) -> Result<()>;
}
