//! `ClickHouse` backing store.

use super::{BackingStore, RunOptions, StoreError};
use crate::models::{RowSet, Value};
use crate::query::SqlQuery;
use async_trait::async_trait;
use chrono::TimeDelta;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

/// `ClickHouse`-backed store.
///
/// Statements are sent over the HTTP interface with their parameters bound
/// client-side by the `clickhouse` crate, and rows are streamed back as
/// `JSONEachRow`. The wall-clock budget is forwarded as
/// `max_execution_time` so the server gives up when the executor does.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Arc<clickhouse::Client>,
}

impl ClickHouseStore {
    /// Creates a new `ClickHouse` store with the given client.
    #[must_use]
    pub fn new(client: Arc<clickhouse::Client>) -> Self {
        Self { client }
    }

    /// Creates a new `ClickHouse` store wrapped in an Arc.
    #[must_use]
    pub fn new_shared(client: Arc<clickhouse::Client>) -> Arc<Self> {
        Arc::new(Self::new(client))
    }

    /// Checks connectivity with a trivial statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.client.query("SELECT 1").fetch_one::<u8>().await?;
        Ok(())
    }
}

impl std::fmt::Debug for ClickHouseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl BackingStore for ClickHouseStore {
    async fn run_parameterized(
        &self,
        query: &SqlQuery,
        options: RunOptions,
    ) -> Result<RowSet, StoreError> {
        let (sql, order) = rewrite_placeholders(&query.sql);
        let timeout_secs = options.timeout.as_secs().max(1);

        let client = (*self.client)
            .clone()
            .with_option("max_execution_time", timeout_secs.to_string())
            .with_option("output_format_json_quote_64bit_integers", "0");

        let mut statement = client.query(&sql);
        for index in order {
            let value = index
                .checked_sub(1)
                .and_then(|i| query.params.get(i))
                .map(|p| &p.value)
                .ok_or_else(|| StoreError::Database(format!("unbound placeholder ${index}")))?;
            statement = bind(statement, value);
        }

        let cap = usize::try_from(options.max_rows).unwrap_or(usize::MAX);
        let mut objects = Vec::new();
        let mut lines = statement.fetch_bytes("JSONEachRow")?.lines();
        while objects.len() < cap {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let object: serde_json::Value =
                serde_json::from_str(&line).map_err(|e| StoreError::Decode(e.to_string()))?;
            objects.push(object);
        }

        Ok(RowSet::from_json_objects(query.columns.clone(), &objects))
    }
}

fn bind(statement: clickhouse::query::Query, value: &Value) -> clickhouse::query::Query {
    match value {
        Value::Null => statement.bind(None::<String>),
        Value::Bool(b) => statement.bind(*b),
        Value::Long(i) => statement.bind(*i),
        Value::Real(r) => statement.bind(*r),
        Value::String(s) | Value::Guid(s) => statement.bind(s.as_str()),
        Value::Datetime(dt) => statement.bind(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        Value::Timespan(ts) => statement.bind(timespan_micros(*ts)),
    }
}

/// Microseconds for `toIntervalMicrosecond`, saturating past about
/// 292,000 years.
fn timespan_micros(ts: TimeDelta) -> i64 {
    ts.num_microseconds()
        .unwrap_or(if ts < TimeDelta::zero() { i64::MIN } else { i64::MAX })
}

/// Rewrites `$n` placeholders into the `?` form the client binds in order.
///
/// Returns the rewritten SQL and the parameter number of each `?`. Text
/// inside quoted identifiers or strings is copied as-is, with any literal `?`
/// doubled so the client leaves it alone.
fn rewrite_placeholders(sql: &str) -> (String, Vec<usize>) {
    let mut out = String::with_capacity(sql.len());
    let mut order = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                out.push(c);
                quote = None;
            }
            (None, '"' | '\'') => {
                out.push(c);
                quote = Some(c);
            }
            (_, '?') => out.push_str("??"),
            (None, '$') if chars.peek().is_some_and(char::is_ascii_digit) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                order.push(digits.parse().unwrap_or(0));
                out.push('?');
            }
            (_, c) => out.push(c),
        }
    }

    (out, order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timespans_bind_as_microseconds() {
        assert_eq!(timespan_micros(TimeDelta::microseconds(500)), 500);
        assert_eq!(timespan_micros(TimeDelta::milliseconds(1500)), 1_500_000);
        assert_eq!(timespan_micros(TimeDelta::minutes(-5)), -300_000_000);
        assert_eq!(timespan_micros(TimeDelta::MAX), i64::MAX);
    }

    #[test]
    fn test_rewrite_placeholders_in_order() {
        let (sql, order) =
            rewrite_placeholders("SELECT a FROM t WHERE org_id = $3 AND (b = $1 OR c = $12)");
        assert_eq!(sql, "SELECT a FROM t WHERE org_id = ? AND (b = ? OR c = ?)");
        assert_eq!(order, vec![3, 1, 12]);
    }

    #[test]
    fn test_rewrite_skips_quoted_identifiers() {
        let (sql, order) = rewrite_placeholders(r#"SELECT "$1 odd?" FROM t WHERE x = $1"#);
        assert_eq!(sql, r#"SELECT "$1 odd??" FROM t WHERE x = ?"#);
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn test_bare_dollar_is_kept() {
        let (sql, order) = rewrite_placeholders("SELECT $x");
        assert_eq!(sql, "SELECT $x");
        assert!(order.is_empty());
    }

    #[test]
    fn test_store_creation() {
        let client = clickhouse::Client::default().with_url("http://localhost:8123");
        let store = ClickHouseStore::new_shared(Arc::new(client));
        assert!(format!("{store:?}").starts_with("ClickHouseStore"));
    }
}
