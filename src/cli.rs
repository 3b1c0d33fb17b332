// src/cli.rs

use crate::error::{AppError, Result};
use crate::storage::{preview, JsonFileStore, KeyStore, PersistedKey};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Shortest key accepted by `keys add`.
pub const MIN_KEY_LENGTH: usize = 20;

#[derive(Parser, Debug)]
#[command(
    name = "openrouter-proxy",
    version,
    about = "Chat-completion proxy with scored key rotation, circuit breaking and retries"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "OPENROUTER_PROXY_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Server bind address
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Emit logs as JSON (`--json-logs=false` for human-readable output)
    #[arg(long, env = "OPENROUTER_PROXY_JSON_LOGS", default_value_t = true, action = ArgAction::Set)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the proxy server (default)
    Serve,

    /// Manage the persisted key pool
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum KeyCommands {
    /// Append a key to the store
    Add {
        /// The API key
        key: String,
    },

    /// List keys with their status
    List,

    /// Re-enable a deactivated key and clear its failures
    Reactivate {
        /// Position of the key as shown by `keys list`
        index: usize,
    },
}

/// Append `key` to the store; returns the new pool size.
pub async fn add_key(store: &JsonFileStore, key: &str) -> Result<usize> {
    let key = key.trim();
    if key.chars().count() < MIN_KEY_LENGTH {
        return Err(AppError::InvalidRequest(format!(
            "API key must be at least {MIN_KEY_LENGTH} characters"
        )));
    }
    let mut keys = store.load().await?;
    keys.push(PersistedKey::new(key));
    store.save(&keys).await?;
    Ok(keys.len())
}

/// One line per key: index, preview, active flag, failure count.
pub async fn list_keys(store: &JsonFileStore) -> Result<Vec<String>> {
    let keys = store.load().await?;
    Ok(keys
        .iter()
        .enumerate()
        .map(|(index, key)| {
            format!(
                "{index}\t{}\t{}\tfailures={}",
                preview(&key.key),
                if key.is_active { "active" } else { "inactive" },
                key.failure_count
            )
        })
        .collect())
}

pub async fn reactivate_key(store: &JsonFileStore, index: usize) -> Result<()> {
    let mut keys = store.load().await?;
    let total = keys.len();
    let key = keys.get_mut(index).ok_or_else(|| {
        AppError::InvalidRequest(format!("No key at index {index} (pool has {total} keys)"))
    })?;
    key.is_active = true;
    key.failure_count = 0;
    store.save(&keys).await
}

/// Run a `keys` subcommand against `store`, printing its outcome.
pub async fn run_key_command(store: &JsonFileStore, action: KeyCommands) -> Result<()> {
    match action {
        KeyCommands::Add { key } => {
            let total = add_key(store, &key).await?;
            println!("Added key {total} to {}", store.path().display());
        }
        KeyCommands::List => {
            let lines = list_keys(store).await?;
            if lines.is_empty() {
                println!("No keys in {}", store.path().display());
            }
            for line in lines {
                println!("{line}");
            }
        }
        KeyCommands::Reactivate { index } => {
            reactivate_key(store, index).await?;
            println!("Reactivated key {index}");
        }
    }
    Ok(())
}
