// tests/key_manager_tests.rs

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::test_keys;
use openrouter_proxy::key_manager::{KeyManager, KeyPolicy};
use openrouter_proxy::storage::{InMemoryStore, KeyRecord, PersistedKey, QuotaUsage};
use openrouter_proxy::AppError;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn record(secret: &str) -> KeyRecord {
    KeyRecord::from_persisted(PersistedKey::new(secret))
}

fn with_quota(mut key: KeyRecord, model: &str, used: u64, limit: u64) -> KeyRecord {
    key.quota_usage
        .insert(model.to_string(), QuotaUsage { used, limit: Some(limit) });
    key.last_quota_check_at = Some(Utc::now());
    key
}

fn manager_with(records: Vec<KeyRecord>) -> KeyManager {
    KeyManager::with_records(
        Arc::new(InMemoryStore::default()),
        KeyPolicy::default(),
        records,
    )
}

#[tokio::test]
async fn test_fresh_quota_outweighs_recency() {
    let now = Utc::now();
    let mut a = with_quota(record("sk-or-v1-key-a-0000000000"), "m", 500, 1000);
    a.last_used_at = Some(now - ChronoDuration::hours(1));
    let mut b = with_quota(record("sk-or-v1-key-b-0000000000"), "m", 0, 1000);
    b.last_used_at = Some(now - ChronoDuration::hours(10));

    let manager = manager_with(vec![a, b]);
    let lease = manager.select_key("m").await.unwrap();
    assert_eq!(lease.index, 1);
}

#[tokio::test]
async fn test_recency_credit_caps_at_five_hours() {
    let now = Utc::now();
    let mut five = record("sk-or-v1-key-five-000000");
    five.last_used_at = Some(now - ChronoDuration::hours(5));
    let mut twenty = record("sk-or-v1-key-twenty-0000");
    twenty.last_used_at = Some(now - ChronoDuration::hours(20));

    let (s5, s20) = (five.score("m", now), twenty.score("m", now));
    assert!((s5 - s20).abs() < 1e-6);
    assert!((s5 - 2000.0).abs() < 1e-6);

    // Equal scores go to the first key in pool order.
    let manager = manager_with(vec![five, twenty]);
    assert_eq!(manager.select_key("m").await.unwrap().index, 0);
}

#[tokio::test]
async fn test_less_recently_used_key_scores_higher() {
    let now = Utc::now();
    let mut recent = record("sk-or-v1-key-recent-000");
    recent.last_used_at = Some(now - ChronoDuration::minutes(30));
    let mut older = record("sk-or-v1-key-older-0000");
    older.last_used_at = Some(now - ChronoDuration::hours(2));

    let manager = manager_with(vec![recent, older]);
    assert_eq!(manager.select_key("m").await.unwrap().index, 1);
}

#[tokio::test]
async fn test_exhausted_best_key_falls_back_to_first_eligible() {
    let now = Utc::now();
    let mut inactive = record("sk-or-v1-key-inactive-00");
    inactive.is_active = false;
    // 1000 quota + 0 recency - 300 failures = 700
    let mut tired = with_quota(record("sk-or-v1-key-tired-00000"), "m", 0, 1000);
    tired.last_used_at = Some(now);
    tired.failure_count = 3;
    // 0 quota + 1000 recency = 1000, the best score but nothing left to spend
    let exhausted = with_quota(record("sk-or-v1-key-exhausted-0"), "m", 1000, 1000);

    let manager = manager_with(vec![inactive, tired, exhausted]);
    let lease = manager.select_key("m").await.unwrap();
    assert_eq!(lease.index, 1);
}

#[tokio::test]
async fn test_deactivated_key_never_selected_even_when_alone() {
    let mut dead = record("sk-or-v1-key-dead-000000");
    dead.failure_count = 5;
    dead.is_active = false;
    let manager = manager_with(vec![dead]);

    for model in ["m", "other"] {
        assert!(matches!(
            manager.select_key(model).await,
            Err(AppError::NoAvailableKeys { .. })
        ));
    }
}

#[tokio::test]
async fn test_rate_limited_key_excluded_regardless_of_active_flag() {
    let mut cooling = record("sk-or-v1-key-cooling-000");
    cooling.rate_limit_reset_at = Some(Utc::now() + ChronoDuration::seconds(30));
    let manager = manager_with(vec![cooling]);
    assert!(manager.select_key("m").await.is_err());
}

#[tokio::test]
async fn test_concurrent_selection_and_reporting() {
    let store = InMemoryStore::new(test_keys(4));
    let manager = Arc::new(KeyManager::new(Arc::new(store), KeyPolicy::default()));

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let lease = manager.select_key("m").await.unwrap();
                manager.report_success(&lease, std::time::Duration::from_millis(5), "m", i);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let total: u64 = manager
        .records()
        .iter()
        .filter_map(|k| k.quota_usage.get("m"))
        .map(|q| q.used)
        .sum();
    assert_eq!(total, (0..32).sum::<u64>());
}

#[tokio::test]
async fn test_quota_limits_come_from_policy() {
    let policy = KeyPolicy {
        quota_limits: HashMap::from([("m".to_string(), 100)]),
        ..KeyPolicy::default()
    };
    let manager = KeyManager::new(Arc::new(InMemoryStore::new(test_keys(1))), policy);
    let lease = manager.select_key("m").await.unwrap();
    manager.report_success(&lease, std::time::Duration::ZERO, "m", 150);

    let usage = manager.records()[0].quota_usage["m"];
    assert_eq!(usage.limit, Some(100));
    // Exhausted, but it is also the only eligible key.
    assert_eq!(manager.select_key("m").await.unwrap().index, 0);
}

proptest! {
    #[test]
    fn prop_select_never_fails_with_an_eligible_key(
        failures in prop::collection::vec(0u32..5, 1..8),
        hours in prop::collection::vec(0i64..48, 8),
        used in prop::collection::vec(0u64..1000, 8),
        eligible in 0usize..8,
    ) {
        let now = Utc::now();
        let n = failures.len();
        let eligible = eligible % n;
        let mut records: Vec<KeyRecord> = failures
            .iter()
            .enumerate()
            .map(|(i, failure_count)| {
                let mut key = with_quota(record(&format!("sk-or-v1-prop-{i:04}-abcdefgh")), "m", used[i], 1000);
                key.failure_count = *failure_count;
                key.last_used_at = Some(now - ChronoDuration::hours(hours[i]));
                if i != eligible && i % 2 == 0 {
                    key.is_active = false;
                }
                key
            })
            .collect();

        let scores: Vec<Option<f64>> = records
            .iter_mut()
            .map(|key| key.is_selectable(now).then(|| key.score("m", now)))
            .collect();
        let best = scores.iter().flatten().cloned().fold(f64::MIN, f64::max);

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let manager = manager_with(records);
        let lease = runtime.block_on(manager.select_key("m"));
        prop_assert!(lease.is_ok());

        let chosen = lease.unwrap().index;
        let chosen_score = scores[chosen];
        prop_assert!(chosen_score.is_some(), "selected an ineligible key");
        // Scores drift by a fraction of a point between the two clocks.
        prop_assert!(chosen_score.unwrap() >= best - 1.0);
    }
}
