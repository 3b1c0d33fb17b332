// src/storage/key_record.rs

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Tokens remaining for a model on the current day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemainingQuota {
    Unlimited,
    Tokens(u64),
}

impl RemainingQuota {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Tokens(0))
    }

    /// Quota term of the selection score, in `0..=1000`.
    pub fn score_weight(&self) -> f64 {
        match self {
            Self::Unlimited => 1000.0,
            Self::Tokens(n) => (*n as f64 / 1000.0).min(1.0) * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub used: u64,
    /// `None` means the model has no configured daily limit.
    pub limit: Option<u64>,
}

impl QuotaUsage {
    pub fn remaining(&self) -> RemainingQuota {
        match self.limit {
            None => RemainingQuota::Unlimited,
            Some(limit) => RemainingQuota::Tokens(limit.saturating_sub(self.used)),
        }
    }
}

/// On-disk shape of one key. Only these fields survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedKey {
    pub key: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_count: u32,
}

fn default_active() -> bool {
    true
}

impl PersistedKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_active: true,
            last_used: None,
            failure_count: 0,
        }
    }
}

/// In-memory state of one credential key.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    /// Log-safe identifier, generated at load time.
    pub id: String,
    pub secret: SecretString,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub quota_usage: HashMap<String, QuotaUsage>,
    pub last_quota_check_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub fn from_persisted(persisted: PersistedKey) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("key_{}", &id[..8]),
            secret: SecretString::new(persisted.key),
            is_active: persisted.is_active,
            last_used_at: persisted.last_used,
            failure_count: persisted.failure_count,
            rate_limit_reset_at: None,
            quota_usage: HashMap::new(),
            last_quota_check_at: None,
        }
    }

    pub fn to_persisted(&self) -> PersistedKey {
        PersistedKey {
            key: self.secret.expose_secret().clone(),
            is_active: self.is_active,
            last_used: self.last_used_at,
            failure_count: self.failure_count,
        }
    }

    pub fn is_rate_limited(&self, now: DateTime<Utc>) -> bool {
        self.rate_limit_reset_at.is_some_and(|reset| reset > now)
    }

    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_rate_limited(now)
    }

    /// Remaining quota for `model`, rolling usage over on a new UTC day.
    pub fn remaining_quota(&mut self, model: &str, now: DateTime<Utc>) -> RemainingQuota {
        self.roll_over_quota(now);
        self.quota_usage
            .get(model)
            .map_or(RemainingQuota::Unlimited, QuotaUsage::remaining)
    }

    pub fn record_usage(&mut self, model: &str, tokens: u64, limit: Option<u64>, now: DateTime<Utc>) {
        self.roll_over_quota(now);
        self.quota_usage
            .entry(model.to_string())
            .or_insert(QuotaUsage { used: 0, limit })
            .used += tokens;
        self.last_quota_check_at = Some(now);
    }

    fn roll_over_quota(&mut self, now: DateTime<Utc>) {
        if let Some(checked) = self.last_quota_check_at {
            if checked.date_naive() != now.date_naive() {
                for usage in self.quota_usage.values_mut() {
                    usage.used = 0;
                }
                self.last_quota_check_at = Some(now);
            }
        }
    }

    /// Hours since last use, 24 for a key that was never used.
    pub fn hours_since_last_use(&self, now: DateTime<Utc>) -> f64 {
        match self.last_used_at {
            Some(last) => (now - last).num_milliseconds().max(0) as f64 / 3_600_000.0,
            None => 24.0,
        }
    }

    pub fn score(&mut self, model: &str, now: DateTime<Utc>) -> f64 {
        let quota = self.remaining_quota(model, now).score_weight();
        let recency = self.hours_since_last_use(now).min(5.0) * 200.0;
        quota + recency - f64::from(self.failure_count) * 100.0
    }

    pub fn start_cooldown(&mut self, cooldown: Duration, now: DateTime<Utc>) {
        let cooldown = chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero());
        self.rate_limit_reset_at = Some(now + cooldown);
    }

    /// First and last four characters of the secret.
    pub fn preview(&self) -> String {
        preview(self.secret.expose_secret())
    }
}

pub fn preview(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "***".to_string()
    }
}
