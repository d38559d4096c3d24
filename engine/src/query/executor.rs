//! Query execution.
//!
//! `QueryExecutor` runs the whole pipeline for one query string:
//! parse, validate, cache lookup, optimize, generate SQL, run against the
//! backing store under a timeout and row cap, cache the result. Compilation
//! is synchronous; the store call is the only await point.

use super::cache::{fingerprint, ResultCache};
use super::completion::{complete, CompletionItem};
use super::error::{QueryError, Stage};
use super::optimizer::{Cost, CostModel, Optimizer, PassReport};
use super::parser::parse_query;
use super::sql::{generate, SqlQuery};
use super::validate::{validate, validate_all};
use super::ast::Query;
use crate::config::EngineConfig;
use crate::models::{ColumnInfo, RowSet, Value};
use crate::schema::SchemaProvider;
use crate::storage::{BackingStore, RunOptions};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lifecycle of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    /// Accepted, not started.
    Pending,
    /// Lexing, parsing and validating.
    Parsing,
    /// Rewriting the AST.
    Optimizing,
    /// Lowering to SQL.
    Generating,
    /// Waiting on the backing store.
    Executing,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// The store did not answer within the timeout.
    TimedOut,
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Parsing => "parsing",
            Self::Optimizing => "optimizing",
            Self::Generating => "generating",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{name}")
    }
}

/// Per-call overrides of the configured limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Store timeout; the configured default when `None`.
    pub timeout_ms: Option<u64>,
    /// Row cap; the configured default when `None`.
    pub max_rows: Option<u64>,
}

impl ExecuteOptions {
    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the row cap.
    #[must_use]
    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

/// Timings and counters for one call. Stages that did not run stay at zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    /// Lex, parse and validate time.
    pub parse_ms: f64,
    /// Optimizer time.
    pub optimize_ms: f64,
    /// SQL generation time.
    pub generate_ms: f64,
    /// Backing-store time.
    pub execute_ms: f64,
    /// Rows returned to the caller.
    pub row_count: usize,
    /// True when the result came from the cache.
    pub cache_hit: bool,
}

/// A successful execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Result columns.
    pub columns: Vec<ColumnInfo>,
    /// Result rows, at most the row cap.
    pub rows: Vec<Vec<Value>>,
    /// Timings and counters.
    pub metrics: ExecutionMetrics,
    /// True when the store had more rows than the cap.
    pub truncated: bool,
    /// Always [`QueryState::Completed`].
    pub state: QueryState,
}

impl ExecutionResult {
    /// The rows as a [`RowSet`].
    #[must_use]
    pub fn to_row_set(&self) -> RowSet {
        RowSet::new(self.columns.clone(), self.rows.clone())
    }
}

/// A failed execution, with the metrics gathered up to the failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub struct QueryFailure {
    /// What went wrong.
    pub error: QueryError,
    /// [`QueryState::Failed`] or [`QueryState::TimedOut`].
    pub state: QueryState,
    /// Timings up to the failure.
    pub metrics: ExecutionMetrics,
}

/// One problem found by [`QueryExecutor::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Stage that reported it.
    pub stage: Stage,
    /// Human-readable message.
    pub message: String,
    /// 1-based line, for lexical and syntax errors.
    pub line: Option<usize>,
    /// 1-based column, for lexical and syntax errors.
    pub column: Option<usize>,
}

impl Diagnostic {
    fn from_error(error: &QueryError) -> Self {
        let (line, column) = match error {
            QueryError::Lex(e) => (Some(e.line), Some(e.column)),
            QueryError::Parse(e) => (Some(e.found.line), Some(e.found.column)),
            _ => (None, None),
        };
        Self {
            stage: error.stage(),
            message: error.to_string(),
            line,
            column,
        }
    }
}

/// Result of [`QueryExecutor::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// True when there are no diagnostics.
    pub valid: bool,
    /// Every problem found.
    pub diagnostics: Vec<Diagnostic>,
}

/// Result of [`QueryExecutor::explain`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainResult {
    /// Canonical text of the parsed query.
    pub original_plan: String,
    /// Canonical text after optimization.
    pub optimized_plan: String,
    /// Estimate for the parsed query.
    pub original_cost: Cost,
    /// Estimate for the optimized query.
    pub estimated_cost: Cost,
    /// Rewrites applied, per enabled pass.
    pub passes: Vec<PassReport>,
}

#[derive(Debug)]
struct CachedRows {
    rows: RowSet,
    truncated: bool,
}

/// Compiles and runs KQL queries.
///
/// Cloning is cheap; clones share the catalog, store and result cache.
///
/// # Example
///
/// ```
/// use engine::config::EngineConfig;
/// use engine::query::{ExecuteOptions, QueryExecutor};
/// use engine::schema::{ColumnSchema, InMemorySchemaProvider, TableSchema};
/// use engine::storage::InMemoryStore;
/// use engine::models::ColumnType;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let schema = InMemorySchemaProvider::new().with_table(TableSchema::new(
///     "SecurityEvent",
///     vec![ColumnSchema::new("EventID", ColumnType::Long)],
/// ));
/// let executor = QueryExecutor::new(
///     Arc::new(schema),
///     InMemoryStore::new_shared(),
///     EngineConfig::default(),
/// );
/// let result = executor
///     .execute("SecurityEvent | take 5", "acme", ExecuteOptions::default())
///     .await
///     .unwrap();
/// assert!(result.rows.is_empty());
/// # });
/// ```
#[derive(Clone)]
pub struct QueryExecutor {
    schema: Arc<dyn SchemaProvider>,
    store: Arc<dyn BackingStore>,
    config: EngineConfig,
    cost: CostModel,
    cache: Arc<ResultCache<Arc<CachedRows>>>,
}

impl QueryExecutor {
    /// Creates an executor over a catalog and a store.
    #[must_use]
    pub fn new(
        schema: Arc<dyn SchemaProvider>,
        store: Arc<dyn BackingStore>,
        config: EngineConfig,
    ) -> Self {
        let cache = Arc::new(ResultCache::new(config.cache_capacity, config.cache_ttl()));
        Self {
            schema,
            store,
            config,
            cost: CostModel::default(),
            cache,
        }
    }

    /// Replaces the cost model used by the optimizer and `explain`.
    #[must_use]
    pub fn with_cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The catalog queries are checked against.
    #[must_use]
    pub fn schema(&self) -> &dyn SchemaProvider {
        self.schema.as_ref()
    }

    /// Number of cached results.
    #[must_use]
    pub fn cached_results(&self) -> usize {
        self.cache.len()
    }

    /// Drops every cached result.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn optimizer(&self) -> Optimizer<'_> {
        Optimizer::new(self.schema.as_ref())
            .with_config(self.config.optimizer.clone())
            .with_cost_model(self.cost.clone())
    }

    fn parse_and_validate(&self, text: &str) -> Result<Query, QueryError> {
        let query = parse_query(text)?;
        validate(&query, self.schema.as_ref())?;
        Ok(query)
    }

    /// Runs a query for an organization.
    ///
    /// # Errors
    ///
    /// Returns a [`QueryFailure`] carrying the error, the terminal state and
    /// the metrics collected so far when the query does not lex, parse,
    /// validate or translate, when the store fails, or when the store does
    /// not answer within the timeout.
    pub async fn execute(
        &self,
        text: &str,
        org_id: &str,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, QueryFailure> {
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let max_rows = options.max_rows.unwrap_or(self.config.default_max_rows);
        let mut metrics = ExecutionMetrics::default();
        let mut state = QueryState::Pending;
        tracing::debug!(org_id, timeout_ms, max_rows, %state, "Query accepted");

        state = QueryState::Parsing;
        tracing::debug!(%state, "Parsing");
        let started = Instant::now();
        let parsed = self.parse_and_validate(text);
        metrics.parse_ms = elapsed_ms(started);
        let query = match parsed {
            Ok(query) => query,
            Err(error) => {
                tracing::debug!(org_id, stage = %error.stage(), error = %error, "Query rejected");
                return Err(failure(error, QueryState::Failed, metrics));
            }
        };

        let key = fingerprint(&query, org_id, max_rows);
        if let Some(cached) = self.cache.get(&key) {
            metrics.cache_hit = true;
            metrics.row_count = cached.rows.len();
            state = QueryState::Completed;
            tracing::info!(org_id, rows = metrics.row_count, cache_hit = true, %state, "Query served from cache");
            return Ok(ExecutionResult {
                columns: cached.rows.columns.clone(),
                rows: cached.rows.rows.clone(),
                metrics,
                truncated: cached.truncated,
                state,
            });
        }

        state = QueryState::Optimizing;
        tracing::debug!(%state, "Optimizing");
        let started = Instant::now();
        let optimized = self.optimizer().optimize(&query);
        metrics.optimize_ms = elapsed_ms(started);

        state = QueryState::Generating;
        tracing::debug!(%state, plan = %optimized, "Generating SQL");
        let started = Instant::now();
        let generated = generate(&optimized, self.schema.as_ref(), org_id);
        metrics.generate_ms = elapsed_ms(started);
        let sql = match generated {
            Ok(sql) => sql,
            Err(error) => {
                tracing::error!(org_id, plan = %optimized, error = %error, "No SQL lowering for query");
                return Err(failure(error.into(), QueryState::Failed, metrics));
            }
        };

        state = QueryState::Executing;
        tracing::debug!(%state, sql = %sql.sql, params = sql.params.len(), "Running statement");
        let timeout = Duration::from_millis(timeout_ms);
        let run = RunOptions {
            timeout,
            max_rows: max_rows.saturating_add(1),
        };
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.store.run_parameterized(&sql, run)).await;
        metrics.execute_ms = elapsed_ms(started);

        let mut rows = match outcome {
            Ok(Ok(rows)) => rows,
            Ok(Err(error)) => {
                tracing::warn!(org_id, error = %error, "Backing store failed");
                return Err(failure(error.into(), QueryState::Failed, metrics));
            }
            Err(_) => {
                tracing::warn!(org_id, timeout_ms, "Query timed out");
                return Err(failure(
                    QueryError::TimedOut { timeout_ms },
                    QueryState::TimedOut,
                    metrics,
                ));
            }
        };

        let cap = usize::try_from(max_rows).unwrap_or(usize::MAX);
        let truncated = rows.rows.len() > cap;
        rows.rows.truncate(cap);
        metrics.row_count = rows.len();

        self.cache.insert(
            key,
            Arc::new(CachedRows {
                rows: rows.clone(),
                truncated,
            }),
        );

        state = QueryState::Completed;
        tracing::info!(
            org_id,
            rows = metrics.row_count,
            truncated,
            parse_ms = metrics.parse_ms,
            optimize_ms = metrics.optimize_ms,
            generate_ms = metrics.generate_ms,
            execute_ms = metrics.execute_ms,
            cache_hit = false,
            %state,
            "Query completed"
        );
        Ok(ExecutionResult {
            columns: rows.columns,
            rows: rows.rows,
            metrics,
            truncated,
            state,
        })
    }

    /// Checks a query without running it, collecting every semantic problem
    /// rather than stopping at the first.
    #[must_use]
    pub fn validate(&self, text: &str) -> ValidationReport {
        let diagnostics = match parse_query(text) {
            Err(error) => vec![Diagnostic::from_error(&error)],
            Ok(query) => {
                let semantic: Vec<Diagnostic> = validate_all(&query, self.schema.as_ref())
                    .into_iter()
                    .map(|e| Diagnostic::from_error(&e.into()))
                    .collect();
                if semantic.is_empty() {
                    // a query that checks out must also be translatable
                    let optimized = self.optimizer().optimize(&query);
                    generate(&optimized, self.schema.as_ref(), "")
                        .err()
                        .map(|e| Diagnostic::from_error(&e.into()))
                        .into_iter()
                        .collect()
                } else {
                    semantic
                }
            }
        };
        tracing::debug!(valid = diagnostics.is_empty(), diagnostics = diagnostics.len(), "Validated query");
        ValidationReport {
            valid: diagnostics.is_empty(),
            diagnostics,
        }
    }

    /// Shows what the optimizer does to a query and what it is expected to
    /// cost.
    ///
    /// # Errors
    ///
    /// Returns an error if the query does not lex, parse or validate.
    pub fn explain(&self, text: &str) -> Result<ExplainResult, QueryError> {
        let query = self.parse_and_validate(text)?;
        let optimizer = self.optimizer();
        let (optimized, passes) = optimizer.optimize_with_report(&query);
        Ok(ExplainResult {
            original_plan: query.to_string(),
            optimized_plan: optimized.to_string(),
            original_cost: optimizer.estimate(&query),
            estimated_cost: optimizer.estimate(&optimized),
            passes,
        })
    }

    /// Compiles a query to the SQL `execute` would run, without running it.
    ///
    /// # Errors
    ///
    /// Returns an error if the query does not lex, parse, validate or
    /// translate.
    pub fn compile(&self, text: &str, org_id: &str) -> Result<SqlQuery, QueryError> {
        let query = self.parse_and_validate(text)?;
        let optimized = self.optimizer().optimize(&query);
        Ok(generate(&optimized, self.schema.as_ref(), org_id)?)
    }

    /// Completions at byte offset `cursor`.
    #[must_use]
    pub fn complete(&self, text: &str, cursor: usize) -> Vec<CompletionItem> {
        complete(text, cursor, self.schema.as_ref())
    }
}

fn failure(error: QueryError, state: QueryState, metrics: ExecutionMetrics) -> QueryFailure {
    QueryFailure {
        error,
        state,
        metrics,
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnType;
    use crate::storage::InMemoryStore;
    use crate::testing::security_catalog;
    use tokio_test::{assert_err, assert_ok};

    fn events(n: i64) -> RowSet {
        RowSet::new(
            vec![
                ColumnInfo::new("EventID", ColumnType::Long),
                ColumnInfo::new("Account", ColumnType::String),
            ],
            (0..n)
                .map(|i| vec![Value::Long(4625), Value::String(format!("user{i}"))])
                .collect(),
        )
    }

    fn executor(store: InMemoryStore) -> (QueryExecutor, Arc<InMemoryStore>) {
        let store = Arc::new(store);
        let executor = QueryExecutor::new(
            Arc::new(security_catalog()),
            store.clone(),
            EngineConfig::default(),
        );
        (executor, store)
    }

    #[tokio::test]
    async fn test_execute_returns_rows() {
        let (executor, store) = executor(InMemoryStore::new().with_default_rows(events(3)));
        let result = assert_ok!(
            executor
                .execute("SecurityEvent | where EventID == 4625 | project Account", "acme", ExecuteOptions::default())
                .await
        );
        assert_eq!(result.state, QueryState::Completed);
        assert_eq!(result.columns, vec![ColumnInfo::new("Account", ColumnType::String)]);
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.metrics.row_count, 3);
        assert!(!result.metrics.cache_hit);
        assert!(!result.truncated);

        let executed = store.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].params.last().map(|p| &p.value), Some(&Value::String("acme".into())));
    }

    #[tokio::test]
    async fn test_row_cap_truncates() {
        let (executor, _) = executor(InMemoryStore::new().with_default_rows(events(10)));
        let result = assert_ok!(
            executor
                .execute("SecurityEvent", "acme", ExecuteOptions::default().with_max_rows(4))
                .await
        );
        assert_eq!(result.rows.len(), 4);
        assert!(result.truncated);

        let exact = assert_ok!(
            executor
                .execute("SecurityEvent", "acme", ExecuteOptions::default().with_max_rows(10))
                .await
        );
        assert_eq!(exact.rows.len(), 10);
        assert!(!exact.truncated);
    }

    #[tokio::test]
    async fn test_second_call_hits_cache() {
        let (executor, store) = executor(InMemoryStore::new().with_default_rows(events(2)));
        let options = ExecuteOptions::default();
        assert_ok!(executor.execute("SecurityEvent | take 5", "acme", options).await);
        let second = assert_ok!(executor.execute("SecurityEvent|TAKE 5", "acme", options).await);

        assert!(second.metrics.cache_hit);
        assert_eq!(second.rows.len(), 2);
        assert_eq!(store.executed().len(), 1);

        // other organizations never see the cached rows
        assert_ok!(executor.execute("SecurityEvent | take 5", "globex", options).await);
        assert_eq!(store.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_semantic_error_fails_before_store() {
        let (executor, store) = executor(InMemoryStore::new());
        let failure = assert_err!(
            executor
                .execute("SecurityEvent | where Acount == 'x'", "acme", ExecuteOptions::default())
                .await
        );
        assert_eq!(failure.state, QueryState::Failed);
        assert_eq!(failure.error.stage(), Stage::Validate);
        assert!(failure.metrics.parse_ms >= 0.0);
        assert!(store.executed().is_empty());
    }

    #[tokio::test]
    async fn test_generation_error() {
        let (executor, _) = executor(InMemoryStore::new());
        let failure = assert_err!(
            executor
                .execute("SecurityEvent | extend J = parse_json(Activity)", "acme", ExecuteOptions::default())
                .await
        );
        assert!(matches!(failure.error, QueryError::Generation(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (executor, _) =
            executor(InMemoryStore::new().with_latency(Duration::from_millis(500)));
        let failure = assert_err!(
            executor
                .execute("SecurityEvent", "acme", ExecuteOptions::default().with_timeout_ms(20))
                .await
        );
        assert_eq!(failure.state, QueryState::TimedOut);
        assert_eq!(failure.error, QueryError::TimedOut { timeout_ms: 20 });
        assert_eq!(executor.cached_results(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable() {
        let (executor, store) = executor(InMemoryStore::new());
        store.set_failure(Some("connection refused")).unwrap();
        let failure = assert_err!(executor.execute("SecurityEvent", "acme", ExecuteOptions::default()).await);
        assert!(failure.error.is_retryable());
        assert_eq!(failure.state, QueryState::Failed);
    }

    #[test]
    fn test_validate_collects_diagnostics() {
        let (executor, _) = executor(InMemoryStore::new());
        assert!(executor.validate("SecurityEvent | take 1").valid);

        let report = executor.validate("SecurityEvent | where Nope == 1 | project Missing");
        assert!(!report.valid);
        assert_eq!(report.diagnostics.len(), 2);

        let report = executor.validate("SecurityEvent | where (");
        assert_eq!(report.diagnostics[0].stage, Stage::Parse);
        assert_eq!(report.diagnostics[0].line, Some(1));

        let report = executor.validate("SecurityEvent | extend J = parse_json(Activity)");
        assert_eq!(report.diagnostics[0].stage, Stage::Generate);
    }

    #[test]
    fn test_explain_reports_passes() {
        let (executor, _) = executor(InMemoryStore::new());
        let explain = executor
            .explain("SecurityEvent | project Account, EventID | where EventID == 4625")
            .unwrap();
        assert_eq!(explain.original_plan, "SecurityEvent | project Account, EventID | where EventID == 4625");
        assert_eq!(explain.optimized_plan, "SecurityEvent | where EventID == 4625 | project Account, EventID");
        assert!(explain.passes.iter().any(|p| p.applied > 0));
    }

    #[test]
    fn test_compile_scopes_to_org() {
        let (executor, _) = executor(InMemoryStore::new());
        let sql = executor.compile("SecurityEvent | take 1", "acme").unwrap();
        assert!(sql.sql.contains("org_id = $1"));
        assert_eq!(sql.params.len(), 1);
    }
}
