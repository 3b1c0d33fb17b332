// src/storage/file.rs

use crate::error::Result;
use crate::storage::{KeyStore, PersistedKey};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// JSON-array key store on the local filesystem.
///
/// Saves through one store (and its clones) are serialized, since they all
/// stage through the same temp file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<PersistedKey>> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                let keys: Vec<PersistedKey> = serde_json::from_slice(&bytes)?;
                debug!(path = %self.path.display(), count = keys.len(), "Loaded key store");
                Ok(keys)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "Key store not found, creating an empty one");
                self.save(&[]).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, keys: &[PersistedKey]) -> Result<()> {
        let json = serde_json::to_vec_pretty(keys)?;
        let _guard = self.write_lock.lock().await;
        self.ensure_parent().await?;
        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), count = keys.len(), "Saved key store");
        Ok(())
    }
}
