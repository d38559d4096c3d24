//! Integration tests for the query executor.
//!
//! Tests cover:
//! - Row caps and truncation
//! - Cache keys across formatting, organizations and row caps
//! - Metrics on success and failure
//! - Concurrent use of one executor

use engine::config::EngineConfig;
use engine::models::Value;
use engine::query::{ExecuteOptions, QueryState, Stage};
use engine::storage::InMemoryStore;
use std::time::Duration;

use super::common::{executor, security_events, signin_logs, ORG};

fn store() -> InMemoryStore {
    InMemoryStore::new()
        .with_response("signin_logs", signin_logs())
        .with_default_rows(security_events())
}

#[tokio::test]
async fn test_row_cap_from_config_and_options() {
    let (executor, store) = executor(store(), EngineConfig::default().with_default_max_rows(5));

    let capped = executor.execute("SecurityEvent", ORG, ExecuteOptions::default()).await.unwrap();
    assert_eq!(capped.rows.len(), 5);
    assert!(capped.truncated);
    assert_eq!(capped.metrics.row_count, 5);

    let wide = executor
        .execute("SecurityEvent", ORG, ExecuteOptions::default().with_max_rows(100))
        .await
        .unwrap();
    assert_eq!(wide.rows.len(), 8);
    assert!(!wide.truncated);

    // different caps are different cache entries
    assert_eq!(store.executed().len(), 2);
}

#[tokio::test]
async fn test_cache_key_ignores_formatting() {
    let (executor, store) = executor(store(), EngineConfig::default());
    let options = ExecuteOptions::default();

    executor
        .execute("SecurityEvent | where EventID == 4625 | project Account", ORG, options)
        .await
        .unwrap();
    let again = executor
        .execute("SecurityEvent\n| WHERE EventID==4625\n|   PROJECT Account", ORG, options)
        .await
        .unwrap();
    assert!(again.metrics.cache_hit);
    assert_eq!(again.metrics.optimize_ms, 0.0);
    assert_eq!(store.executed().len(), 1);

    let other_cap = executor
        .execute("SecurityEvent | where EventID == 4625 | project Account", ORG, options.with_max_rows(1))
        .await
        .unwrap();
    assert!(!other_cap.metrics.cache_hit);
    assert_eq!(store.executed().len(), 2);
}

#[tokio::test]
async fn test_zero_capacity_disables_cache() {
    let (executor, store) = executor(store(), EngineConfig::default().with_cache(0, 60));
    for _ in 0..3 {
        let result = executor.execute("SigninLogs", ORG, ExecuteOptions::default()).await.unwrap();
        assert!(!result.metrics.cache_hit);
        assert_eq!(result.rows.len(), 3);
    }
    assert_eq!(store.executed().len(), 3);
    assert_eq!(executor.cached_results(), 0);
}

#[tokio::test]
async fn test_failures_carry_metrics() {
    let (executor, store) = executor(store(), EngineConfig::default());

    let lex = executor
        .execute("SecurityEvent | where Account == \"open", ORG, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(lex.error.stage(), Stage::Lex);
    assert_eq!(lex.state, QueryState::Failed);

    store.set_failure(Some("too many simultaneous queries")).unwrap();
    let failure = executor
        .execute("SecurityEvent | take 1", ORG, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(failure.error.stage(), Stage::Execute);
    assert!(failure.error.is_retryable());
    assert!(failure.metrics.parse_ms > 0.0);
    assert!(failure.to_string().contains("too many simultaneous queries"));

    // failed runs are not cached
    store.set_failure(None).unwrap();
    let ok = executor
        .execute("SecurityEvent | take 1", ORG, ExecuteOptions::default())
        .await
        .unwrap();
    assert!(!ok.metrics.cache_hit);
}

#[tokio::test]
async fn test_results_are_typed() {
    let (executor, _) = executor(store(), EngineConfig::default());
    let result = executor
        .execute("SigninLogs | project Account, ResultType", ORG, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.rows[1], vec![Value::String("bob".into()), Value::Long(50126)]);

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["state"], "completed");
    assert_eq!(json["metrics"]["row_count"], 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_share_cache() {
    let (executor, store) = executor(
        store().with_latency(Duration::from_millis(5)),
        EngineConfig::default(),
    );

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let executor = executor.clone();
            tokio::spawn(async move {
                let text = format!("SecurityEvent | take {}", i % 4 + 1);
                executor.execute(&text, ORG, ExecuteOptions::default()).await
            })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.state, QueryState::Completed);
    }

    // no single-flight: concurrent misses may each reach the store
    assert!(store.executed().len() >= 4);
    assert_eq!(executor.cached_results(), 4);

    for n in 1..=4 {
        let result = executor
            .execute(&format!("SecurityEvent | take {n}"), ORG, ExecuteOptions::default())
            .await
            .unwrap();
        assert!(result.metrics.cache_hit);
    }
}
