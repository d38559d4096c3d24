//! Shared fixtures: a small security catalog, matching in-memory data and
//! executor setup.

use engine::config::EngineConfig;
use engine::models::{parse_datetime, ColumnInfo, ColumnType, RowSet, Value};
use engine::query::{Dataset, QueryExecutor};
use engine::schema::{ColumnSchema, InMemorySchemaProvider, SchemaProvider, TableSchema};
use engine::storage::InMemoryStore;
use std::sync::Arc;

/// Organization used by most tests.
pub const ORG: &str = "org-acme";

/// `SecurityEvent` and `SigninLogs`, with one non-default physical name.
pub fn catalog() -> InMemorySchemaProvider {
    InMemorySchemaProvider::new()
        .with_table(
            TableSchema::new(
                "SecurityEvent",
                vec![
                    ColumnSchema::new("TimeGenerated", ColumnType::Datetime),
                    ColumnSchema::new("EventID", ColumnType::Long),
                    ColumnSchema::new("Account", ColumnType::String),
                    ColumnSchema::new("Computer", ColumnType::String),
                    ColumnSchema::new("LogonType", ColumnType::Long),
                    ColumnSchema::new("Activity", ColumnType::String),
                ],
            )
            .with_row_estimate(1_000_000),
        )
        .with_table(
            TableSchema::new(
                "SigninLogs",
                vec![
                    ColumnSchema::new("TimeGenerated", ColumnType::Datetime),
                    ColumnSchema::new("Account", ColumnType::String),
                    ColumnSchema::new("IPAddress", ColumnType::String).with_sql_name("ip_address"),
                    ColumnSchema::new("ResultType", ColumnType::Long),
                ],
            )
            .with_row_estimate(50_000),
        )
}

fn text(s: &str) -> Value {
    Value::String(s.to_string())
}

fn at(s: &str) -> Value {
    parse_datetime(s).map_or(Value::Null, Value::Datetime)
}

/// Rows laid out as the catalog's `SecurityEvent` table.
pub fn security_events() -> RowSet {
    let rows = [
        ("2024-03-01T08:00:00Z", 4625, "alice", "WS1", Some(3), "An account failed to log on"),
        ("2024-03-01T08:01:00Z", 4625, "alice", "WS1", Some(3), "An account failed to log on"),
        ("2024-03-01T08:02:00Z", 4624, "alice", "WS1", Some(10), "An account was successfully logged on"),
        ("2024-03-01T08:30:00Z", 4625, "bob", "WS2", None, "An account failed to log on"),
        ("2024-03-01T09:00:00Z", 4688, "carol", "SRV1", Some(2), "A new process has been created"),
        ("2024-03-01T09:15:00Z", 4625, "dave", "SRV1", Some(3), "An account failed to log on"),
        ("2024-03-01T10:00:00Z", 4624, "bob", "WS2", Some(2), "An account was successfully logged on"),
        ("2024-03-01T11:45:00Z", 4634, "carol", "SRV1", Some(3), "An account was logged off"),
    ];
    RowSet::new(
        columns_of("SecurityEvent"),
        rows.iter()
            .map(|(t, id, account, computer, logon, activity)| {
                vec![
                    at(t),
                    Value::Long(*id),
                    text(account),
                    text(computer),
                    logon.map_or(Value::Null, Value::Long),
                    text(activity),
                ]
            })
            .collect(),
    )
}

/// Rows laid out as the catalog's `SigninLogs` table.
pub fn signin_logs() -> RowSet {
    let rows = [
        ("2024-03-01T07:55:00Z", "alice", "10.0.0.1", 0),
        ("2024-03-01T08:25:00Z", "bob", "192.168.1.5", 50126),
        ("2024-03-01T09:10:00Z", "erin", "172.16.0.9", 0),
    ];
    RowSet::new(
        columns_of("SigninLogs"),
        rows.iter()
            .map(|(t, account, ip, result)| {
                vec![at(t), text(account), text(ip), Value::Long(*result)]
            })
            .collect(),
    )
}

fn columns_of(table: &str) -> Vec<ColumnInfo> {
    catalog()
        .list_columns(table)
        .unwrap_or_default()
        .into_iter()
        .map(|c| ColumnInfo::new(c.name, c.kind))
        .collect()
}

/// Both tables, for the reference evaluator.
pub fn dataset() -> Dataset {
    Dataset::new()
        .with_table("SecurityEvent", security_events())
        .with_table("SigninLogs", signin_logs())
}

/// An executor over the catalog and the given store.
pub fn executor(store: InMemoryStore, config: EngineConfig) -> (QueryExecutor, Arc<InMemoryStore>) {
    let store = Arc::new(store);
    let executor = QueryExecutor::new(Arc::new(catalog()), store.clone(), config);
    (executor, store)
}

/// Rows in a canonical order, for comparing results whose order is not
/// defined.
pub fn sorted_rows(rows: &RowSet) -> Vec<Vec<Value>> {
    let mut rows = rows.rows.clone();
    rows.sort_by(|a, b| {
        a.iter()
            .zip(b)
            .map(|(x, y)| x.sort_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows
}

/// Column names of a row set.
pub fn names(rows: &RowSet) -> Vec<String> {
    rows.columns.iter().map(|c| c.name.clone()).collect()
}
