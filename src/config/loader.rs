// src/config/loader.rs

use crate::config::{AppConfig, ConfigValidator};
use crate::error::{AppError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Load configuration from an optional YAML file, then apply environment overrides.
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    let mut config = if config_path.exists() {
        info!(config.path = %config_path.display(), "Loading configuration from file");
        load_from_file(config_path)?
    } else {
        info!(config.path = %config_path.display(), "Configuration file not found, using defaults");
        AppConfig::default()
    };

    override_with_env(&mut config);

    ConfigValidator::validate(&config)?;

    debug!("Configuration loaded and validated successfully");
    Ok(config)
}

fn load_from_file(config_path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(config_path)?;
    if content.trim().is_empty() {
        warn!(config.path = %config_path.display(), "Config file is empty. Using defaults.");
        return Ok(AppConfig::default());
    }
    Ok(serde_yaml::from_str(&content)?)
}

fn override_with_env(config: &mut AppConfig) {
    if let Ok(host) = std::env::var("HOST") {
        info!("Overriding server host from environment variable: {}", host);
        config.server.host = host;
    }

    if let Ok(port_str) = std::env::var("PORT") {
        if let Ok(port) = port_str.parse::<u16>() {
            info!("Overriding server port from environment variable: {}", port);
            config.server.port = port;
        } else {
            warn!("Invalid PORT environment variable: {}", port_str);
        }
    }

    if let Ok(base_url) = std::env::var("UPSTREAM_BASE_URL") {
        info!("Overriding upstream base URL from environment variable");
        config.upstream.base_url = base_url;
    }

    if let Ok(store_path) = std::env::var("KEYS_FILE") {
        info!("Overriding key store path from environment variable: {}", store_path);
        config.keys.store_path = PathBuf::from(store_path);
    }
}
