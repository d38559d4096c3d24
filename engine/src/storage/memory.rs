//! In-memory backing store.

use super::{BackingStore, RunOptions, StoreError};
use crate::models::{RowSet, Value};
use crate::query::SqlQuery;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Backing store that serves canned rows.
///
/// Responses are matched by a substring of the generated SQL (typically the
/// physical table name); the first match wins and the default response is
/// used otherwise. Canned rows are projected onto the statement's output
/// columns by name, with missing columns read as null.
///
/// Latency and failures can be injected, and every executed statement is
/// recorded, which makes the store suitable for exercising the executor.
///
/// **Note:** the SQL is not interpreted; filters and aggregations in the
/// statement have no effect on the returned rows.
///
/// # Example
///
/// ```
/// use engine::models::{ColumnInfo, ColumnType, RowSet, Value};
/// use engine::storage::InMemoryStore;
///
/// let store = InMemoryStore::new().with_default_rows(RowSet::new(
///     vec![ColumnInfo::new("Account", ColumnType::String)],
///     vec![vec![Value::String("alice".into())]],
/// ));
/// assert_eq!(store.executed().len(), 0);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    default_rows: RowSet,
    responses: Vec<(String, RowSet)>,
    latency: Option<Duration>,
    failure: Arc<RwLock<Option<String>>>,
    executed: Arc<RwLock<Vec<SqlQuery>>>,
}

impl InMemoryStore {
    /// Creates a store that returns no rows.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new store wrapped in an Arc.
    #[must_use]
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Sets the rows returned when no pattern matches.
    #[must_use]
    pub fn with_default_rows(mut self, rows: RowSet) -> Self {
        self.default_rows = rows;
        self
    }

    /// Returns `rows` for statements whose SQL contains `pattern`.
    #[must_use]
    pub fn with_response(mut self, pattern: impl Into<String>, rows: RowSet) -> Self {
        self.responses.push((pattern.into(), rows));
        self
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every subsequent call fail with `message` (or succeed again
    /// with `None`).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_failure(&self, message: Option<&str>) -> Result<(), StoreError> {
        let mut failure = self.failure.write().map_err(|_| StoreError::LockError)?;
        *failure = message.map(str::to_string);
        Ok(())
    }

    /// Statements executed so far, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<SqlQuery> {
        self.executed
            .read()
            .map(|executed| executed.clone())
            .unwrap_or_default()
    }

    fn response_for(&self, sql: &str) -> &RowSet {
        self.responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map_or(&self.default_rows, |(_, rows)| rows)
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn run_parameterized(
        &self,
        query: &SqlQuery,
        options: RunOptions,
    ) -> Result<RowSet, StoreError> {
        self.executed
            .write()
            .map_err(|_| StoreError::LockError)?
            .push(query.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(message) = self
            .failure
            .read()
            .map_err(|_| StoreError::LockError)?
            .clone()
        {
            return Err(StoreError::Database(message));
        }

        let canned = self.response_for(&query.sql);
        let positions: Vec<Option<usize>> = query
            .columns
            .iter()
            .map(|c| canned.column_index(&c.name))
            .collect();
        let cap = usize::try_from(options.max_rows).unwrap_or(usize::MAX);

        let rows = canned
            .rows
            .iter()
            .take(cap)
            .map(|row| {
                positions
                    .iter()
                    .zip(&query.columns)
                    .map(|(pos, column)| {
                        pos.and_then(|p| row.get(p).cloned())
                            .unwrap_or(Value::Null)
                            .coerce(column.kind)
                    })
                    .collect()
            })
            .collect();

        Ok(RowSet::new(query.columns.clone(), rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnInfo, ColumnType};

    fn statement(sql: &str, columns: &[&str]) -> SqlQuery {
        SqlQuery {
            sql: sql.to_string(),
            params: Vec::new(),
            columns: columns
                .iter()
                .map(|c| ColumnInfo::new(*c, ColumnType::Long))
                .collect(),
        }
    }

    fn numbers(n: i64) -> RowSet {
        RowSet::new(
            vec![ColumnInfo::new("n", ColumnType::Long)],
            (0..n).map(|i| vec![Value::Long(i)]).collect(),
        )
    }

    fn options(max_rows: u64) -> RunOptions {
        RunOptions {
            timeout: Duration::from_secs(1),
            max_rows,
        }
    }

    #[tokio::test]
    async fn test_returns_at_most_max_rows() {
        let store = InMemoryStore::new().with_default_rows(numbers(10));
        let rows = store
            .run_parameterized(&statement("SELECT n FROM t", &["n"]), options(3))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.rows[2][0], Value::Long(2));
    }

    #[tokio::test]
    async fn test_projects_onto_statement_columns() {
        let store = InMemoryStore::new().with_default_rows(numbers(1));
        let rows = store
            .run_parameterized(&statement("SELECT", &["missing", "n"]), options(10))
            .await
            .unwrap();
        assert_eq!(rows.rows[0], vec![Value::Null, Value::Long(0)]);
        assert_eq!(rows.columns[0].name, "missing");
    }

    #[tokio::test]
    async fn test_response_matched_by_pattern() {
        let store = InMemoryStore::new()
            .with_default_rows(numbers(1))
            .with_response("signin_logs", numbers(5));
        let rows = store
            .run_parameterized(&statement("SELECT n FROM signin_logs", &["n"]), options(100))
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn test_failure_injection_and_recording() {
        let store = InMemoryStore::new();
        store.set_failure(Some("connection reset")).unwrap();

        let err = store
            .run_parameterized(&statement("SELECT 1", &[]), options(1))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Database("connection reset".into()));
        assert_eq!(store.executed().len(), 1);

        store.set_failure(None).unwrap();
        assert!(store
            .run_parameterized(&statement("SELECT 1", &[]), options(1))
            .await
            .is_ok());
    }
}
