//! End-to-end scenarios.
//!
//! Tests cover:
//! - Filter then aggregate, down to the generated SQL
//! - Truncated input reported as a parse error at end of input
//! - Unknown tables reported by validation
//! - Repeated execution served from the cache
//! - Store timeouts ending in the `TimedOut` state

use engine::config::EngineConfig;
use engine::models::{ColumnInfo, ColumnType, RowSet, Value};
use engine::query::{
    generate, optimize, parse_query, validate, ExecuteOptions, Operation, QueryError, QueryState,
    SemanticErrorKind, Symbol, TokenKind,
};
use engine::storage::InMemoryStore;
use std::time::Duration;

use super::common::{catalog, executor, security_events, ORG};

#[test]
fn test_failed_logons_by_account() {
    let schema = catalog();
    let query = parse_query("SecurityEvent | where EventID == 4625 | summarize count() by Account").unwrap();

    assert!(matches!(query.pipeline[0], Operation::Where(_)));
    assert!(matches!(query.pipeline[1], Operation::Summarize { .. }));
    let columns = validate(&query, &schema).unwrap();
    assert_eq!(
        columns,
        vec![
            ColumnInfo::new("Account", ColumnType::String),
            ColumnInfo::new("count_", ColumnType::Long),
        ]
    );

    let sql = generate(&optimize(&query, &schema), &schema, ORG).unwrap();
    assert!(sql.sql.contains("event_id = $1"), "{}", sql.sql);
    assert!(sql.sql.contains("GROUP BY account"), "{}", sql.sql);
    assert!(sql.sql.contains("org_id = $2"), "{}", sql.sql);
    assert_eq!(sql.params[0].value, Value::Long(4625));
    assert_eq!(sql.params[1].value, Value::String(ORG.to_string()));
}

#[test]
fn test_truncated_input() {
    let err = parse_query("SecurityEvent | where EventID == 4625 and").unwrap_err();
    let QueryError::Parse(err) = err else {
        panic!("expected a parse error, got {err:?}");
    };
    assert_eq!(err.found.kind, TokenKind::Eof);
    assert!(err.expected.contains(&TokenKind::Identifier));
    assert!(err.expected.contains(&TokenKind::Symbol(Symbol::LParen)));
}

#[test]
fn test_unknown_table() {
    let query = parse_query("UnknownTable | project X").unwrap();
    let err = validate(&query, &catalog()).unwrap_err();
    assert_eq!(err.kind, SemanticErrorKind::UnknownTable);
    assert_eq!(err.name, "UnknownTable");
}

#[tokio::test]
async fn test_repeat_within_ttl_hits_cache() {
    let (executor, store) = executor(
        InMemoryStore::new().with_default_rows(security_events()),
        EngineConfig::default(),
    );
    let text = "SecurityEvent | top 10 by TimeGenerated desc";

    let first = executor.execute(text, ORG, ExecuteOptions::default()).await.unwrap();
    let second = executor.execute(text, ORG, ExecuteOptions::default()).await.unwrap();

    assert!(!first.metrics.cache_hit);
    assert!(second.metrics.cache_hit);
    assert_eq!(first.rows, second.rows);
    assert_eq!(first.columns, second.columns);
    assert_eq!(store.executed().len(), 1);
}

#[tokio::test]
async fn test_slow_store_times_out() {
    let rows = RowSet::new(
        vec![ColumnInfo::new("Account", ColumnType::String)],
        vec![vec![Value::String("alice".into())]],
    );
    let (executor, _) = executor(
        InMemoryStore::new()
            .with_default_rows(rows)
            .with_latency(Duration::from_millis(300)),
        EngineConfig::default(),
    );

    let failure = executor
        .execute(
            "SecurityEvent | project Account",
            ORG,
            ExecuteOptions::default().with_timeout_ms(25),
        )
        .await
        .unwrap_err();

    assert_eq!(failure.state, QueryState::TimedOut);
    assert_eq!(failure.error, QueryError::TimedOut { timeout_ms: 25 });
    assert_eq!(failure.metrics.row_count, 0);
    assert!(failure.metrics.execute_ms >= 20.0);
}
