// src/storage/memory.rs

use crate::error::Result;
use crate::storage::{KeyStore, PersistedKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// In-memory key store; counts saves so callers can observe write coalescing.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    keys: Arc<Mutex<Vec<PersistedKey>>>,
    saves: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new(keys: Vec<PersistedKey>) -> Self {
        Self {
            keys: Arc::new(Mutex::new(keys)),
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<PersistedKey> {
        self.keys.lock().clone()
    }
}

#[async_trait]
impl KeyStore for InMemoryStore {
    async fn load(&self) -> Result<Vec<PersistedKey>> {
        trace!("InMemoryStore::load");
        Ok(self.keys.lock().clone())
    }

    async fn save(&self, keys: &[PersistedKey]) -> Result<()> {
        trace!(count = keys.len(), "InMemoryStore::save");
        *self.keys.lock() = keys.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
