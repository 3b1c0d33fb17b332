// src/config/app.rs

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How many ports after `port` to try when it is already taken.
    #[serde(default = "default_port_fallback_range")]
    pub port_fallback_range: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            port_fallback_range: default_port_fallback_range(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// The single upstream provider all chat completions are relayed to.
#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_referer")]
    pub default_referer: String,
    #[serde(default = "default_title")]
    pub default_title: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_after")]
    pub default_retry_after_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_referer: default_referer(),
            default_title: default_title(),
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            default_retry_after_secs: default_retry_after(),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KeysConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Consecutive failures after which a key is deactivated.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
    #[serde(default = "default_persist_debounce")]
    pub persist_debounce_ms: u64,
    /// Daily token limit per model; models not listed are unlimited.
    #[serde(default)]
    pub quota_limits: HashMap<String, u64>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            max_failures: default_max_failures(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
            persist_debounce_ms: default_persist_debounce(),
            quota_limits: HashMap::new(),
        }
    }
}

impl KeysConfig {
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_duration")]
    pub open_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_ms: default_open_duration(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionPoolConfig {
    /// Concurrent in-flight requests per upstream host.
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
    /// Idle keep-alive connections kept per upstream host.
    #[serde(default = "default_max_free_sockets")]
    pub max_free_sockets: usize,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_sockets: default_max_sockets(),
            max_free_sockets: default_max_free_sockets(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_port_fallback_range() -> u16 {
    10
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_referer() -> String {
    "http://localhost:3000".to_string()
}

fn default_title() -> String {
    "OpenRouter Proxy".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_after() -> u64 {
    5
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/keys.json")
}

fn default_max_failures() -> u32 {
    5
}

fn default_rate_limit_cooldown() -> u64 {
    60
}

fn default_persist_debounce() -> u64 {
    5_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_duration() -> u64 {
    10_000
}

fn default_max_sockets() -> usize {
    50
}

fn default_max_free_sockets() -> usize {
    10
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}
