// src/config/validation.rs

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use tracing::{debug, warn};
use url::Url;

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> Result<()> {
        debug!("Starting configuration validation");

        if let Err(e) = Self::validate_upstream(config) {
            warn!("Upstream config validation failed: {}", e);
            return Err(e);
        }

        if let Err(e) = Self::validate_policies(config) {
            warn!("Policy config validation failed: {}", e);
            return Err(e);
        }

        if let Err(e) = Self::validate_server(config) {
            warn!("Server config validation failed: {}", e);
            return Err(e);
        }

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_upstream(config: &AppConfig) -> Result<()> {
        let upstream = &config.upstream;
        let url = Url::parse(&upstream.base_url).map_err(|e| {
            AppError::config_validation(
                format!("Invalid upstream base_url '{}': {}", upstream.base_url, e),
                Some("upstream.base_url"),
            )
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::config_validation(
                format!("Unsupported upstream scheme: {}", url.scheme()),
                Some("upstream.base_url"),
            ));
        }
        if url.query().is_some() {
            return Err(AppError::config_validation(
                "Upstream base_url must not contain a query string",
                Some("upstream.base_url"),
            ));
        }
        if upstream.max_attempts == 0 {
            return Err(AppError::config_validation(
                "max_attempts must be at least 1",
                Some("upstream.max_attempts"),
            ));
        }
        if upstream.request_timeout_secs == 0 {
            return Err(AppError::config_validation(
                "Request timeout cannot be 0",
                Some("upstream.request_timeout_secs"),
            ));
        }
        Ok(())
    }

    fn validate_policies(config: &AppConfig) -> Result<()> {
        if config.keys.max_failures == 0 {
            return Err(AppError::config_validation(
                "max_failures must be at least 1",
                Some("keys.max_failures"),
            ));
        }
        if config.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::config_validation(
                "failure_threshold must be at least 1",
                Some("circuit_breaker.failure_threshold"),
            ));
        }
        if config.circuit_breaker.success_threshold == 0 {
            return Err(AppError::config_validation(
                "success_threshold must be at least 1",
                Some("circuit_breaker.success_threshold"),
            ));
        }
        if config.connection_pool.max_sockets == 0 {
            return Err(AppError::config_validation(
                "max_sockets must be at least 1",
                Some("connection_pool.max_sockets"),
            ));
        }
        Ok(())
    }

    fn validate_server(config: &AppConfig) -> Result<()> {
        if config.server.host.trim().is_empty() {
            return Err(AppError::config_validation(
                "Server host cannot be empty",
                Some("server.host"),
            ));
        }
        Ok(())
    }
}
