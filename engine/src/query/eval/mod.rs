//! Reference evaluator.
//!
//! Runs a query directly over in-memory tables with KQL semantics. The
//! optimizer folds constants with the same scalar rules, the `eval` command
//! of the CLI runs queries over local JSON files with it, and the property
//! tests use it to check that optimized pipelines return the same rows.

mod scalar;

pub use scalar::eval_constant;

use super::ast::{
    JoinKind, Operation, ProjectItem, Query, SortKey, SortOrder, TableExpression, UnionKind,
};
use super::validate::{distinct_names, join_columns, union_columns};
use crate::models::{ColumnInfo, ColumnType, RowSet, Value};
use crate::schema::SchemaProvider;
use scalar::{eval, eval_aggregate, Env, Frame};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Errors raised while evaluating a query in memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// No data was loaded for the table.
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// The column is not present in the row.
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    /// The function has no in-memory implementation.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// An operator or function rejected its arguments.
    #[error("invalid arguments to '{0}'")]
    InvalidArguments(String),

    /// Integer division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// The pattern of `matches regex` does not compile.
    #[error("invalid regex: {0}")]
    Regex(String),

    /// An aggregate was evaluated outside `summarize`.
    #[error("aggregate '{0}' used outside summarize")]
    MisplacedAggregate(String),
}

/// A set of named in-memory tables.
///
/// # Example
///
/// ```
/// use engine::models::{ColumnInfo, ColumnType, RowSet, Value};
/// use engine::query::{parse_query, Dataset};
///
/// let data = Dataset::new().with_table(
///     "Events",
///     RowSet::new(
///         vec![ColumnInfo::new("n", ColumnType::Long)],
///         (1..=5).map(|n| vec![Value::Long(n)]).collect(),
///     ),
/// );
/// let result = data.evaluate(&parse_query("Events | where n > 3").unwrap()).unwrap();
/// assert_eq!(result.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    tables: BTreeMap<String, RowSet>,
}

impl Dataset {
    /// Creates an empty dataset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a table.
    #[must_use]
    pub fn with_table(mut self, name: impl Into<String>, rows: RowSet) -> Self {
        self.tables.insert(name.into(), rows);
        self
    }

    /// Loads tables from a JSON document of the form
    /// `{"Table": [{"Column": value, ...}, ...], ...}`.
    ///
    /// Column layouts and types come from the catalog when it knows the
    /// table; otherwise columns are taken from the keys of the objects, in
    /// order of first appearance, and typed from their values.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a JSON object of arrays.
    pub fn from_json(json: &str, schema: &dyn SchemaProvider) -> Result<Self, serde_json::Error> {
        let tables: BTreeMap<String, Vec<serde_json::Value>> = serde_json::from_str(json)?;
        let mut dataset = Self::new();
        for (name, objects) in tables {
            let columns = match schema.table(&name) {
                Some(table) => table
                    .columns
                    .iter()
                    .map(|c| ColumnInfo::new(c.name.clone(), c.kind))
                    .collect(),
                None => columns_from_objects(&objects),
            };
            dataset = dataset.with_table(name, RowSet::from_json_objects(columns, &objects));
        }
        Ok(dataset)
    }

    /// Names of the loaded tables.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Evaluates a query.
    ///
    /// # Errors
    ///
    /// Returns an error if a table is missing or an expression cannot be
    /// evaluated for some row.
    pub fn evaluate(&self, query: &Query) -> Result<RowSet, EvalError> {
        let mut rows = self.table_expression(&query.source)?;
        for operation in &query.pipeline {
            rows = self.operation(operation, rows)?;
        }
        Ok(rows)
    }

    fn table_expression(&self, table: &TableExpression) -> Result<RowSet, EvalError> {
        match table {
            TableExpression::Table { name, .. } => self
                .tables
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UnknownTable(name.clone())),
            TableExpression::Subquery { query, .. } => self.evaluate(query),
        }
    }

    fn operation(&self, operation: &Operation, input: RowSet) -> Result<RowSet, EvalError> {
        match operation {
            Operation::Where(predicate) => {
                let mut kept = Vec::with_capacity(input.rows.len());
                for row in input.rows {
                    if eval(predicate, &Env::row(&input.columns, &row))?.is_true() {
                        kept.push(row);
                    }
                }
                Ok(RowSet::new(input.columns, kept))
            }
            Operation::Project(items) => project(items, &input),
            Operation::Extend(items) => extend(items, input),
            Operation::Summarize {
                aggregations,
                group_by,
            } => summarize(aggregations, group_by, &input),
            Operation::OrderBy(keys) => sort(keys, input),
            Operation::Top { count, by } => {
                let sorted = match by {
                    Some(key) => sort(std::slice::from_ref(key), input)?,
                    None => input,
                };
                Ok(take(sorted, *count))
            }
            Operation::Limit(count) => Ok(take(input, *count)),
            Operation::Distinct(None) => Ok(dedupe(input)),
            Operation::Distinct(Some(exprs)) => {
                let items: Vec<ProjectItem> = exprs
                    .iter()
                    .zip(distinct_names(exprs))
                    .map(|(e, name)| ProjectItem::named(name, e.clone()))
                    .collect();
                Ok(dedupe(project(&items, &input)?))
            }
            Operation::Join { kind, right, on } => {
                let right = self.table_expression(right)?;
                join(*kind, &input, &right, on)
            }
            Operation::Union { kind, others } => {
                let mut branches = vec![input];
                for other in others {
                    branches.push(self.table_expression(other)?);
                }
                let unioned = union(branches);
                Ok(match kind {
                    UnionKind::All => unioned,
                    UnionKind::Distinct => dedupe(unioned),
                })
            }
        }
    }
}

fn columns_from_objects(objects: &[serde_json::Value]) -> Vec<ColumnInfo> {
    let mut columns: Vec<ColumnInfo> = Vec::new();
    for object in objects {
        let Some(map) = object.as_object() else {
            continue;
        };
        for (key, value) in map {
            if columns.iter().any(|c| &c.name == key) {
                continue;
            }
            let kind = Value::from_json(value)
                .kind()
                .unwrap_or(ColumnType::Dynamic);
            columns.push(ColumnInfo::new(key.clone(), kind));
        }
    }
    columns
}

/// Column type of computed values: the type of the first non-null value.
fn kind_of<'v>(values: impl Iterator<Item = &'v Value>) -> ColumnType {
    values
        .filter_map(Value::kind)
        .next()
        .unwrap_or(ColumnType::Dynamic)
}

fn project(items: &[ProjectItem], input: &RowSet) -> Result<RowSet, EvalError> {
    let names = ProjectItem::output_names(items);
    let mut rows = Vec::with_capacity(input.rows.len());
    for row in &input.rows {
        let env = Env::row(&input.columns, row);
        rows.push(
            items
                .iter()
                .map(|item| eval(&item.expr, &env))
                .collect::<Result<Vec<_>, _>>()?,
        );
    }
    let columns = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let passthrough = items[i]
                .expr
                .as_column()
                .and_then(|c| input.columns.iter().find(|col| col.name == c));
            let kind = passthrough.map_or_else(|| kind_of(rows.iter().map(|r| &r[i])), |c| c.kind);
            ColumnInfo::new(name, kind)
        })
        .collect();
    Ok(RowSet::new(columns, rows))
}

fn extend(items: &[ProjectItem], input: RowSet) -> Result<RowSet, EvalError> {
    let RowSet {
        mut columns,
        mut rows,
    } = input;
    for (item, name) in items.iter().zip(ProjectItem::output_names(items)) {
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            values.push(eval(&item.expr, &Env::row(&columns, row))?);
        }
        let kind = kind_of(values.iter());
        match columns.iter().position(|c| c.name == name) {
            Some(index) => {
                columns[index].kind = kind;
                for (row, value) in rows.iter_mut().zip(values) {
                    row[index] = value;
                }
            }
            None => {
                columns.push(ColumnInfo::new(name, kind));
                for (row, value) in rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
    }
    Ok(RowSet::new(columns, rows))
}

fn summarize(
    aggregations: &[ProjectItem],
    group_by: &[ProjectItem],
    input: &RowSet,
) -> Result<RowSet, EvalError> {
    // groups in order of first appearance
    let mut order: Vec<Vec<Value>> = Vec::new();
    let mut members: HashMap<String, Vec<&[Value]>> = HashMap::new();
    for row in &input.rows {
        let env = Env::row(&input.columns, row);
        let key = group_by
            .iter()
            .map(|item| eval(&item.expr, &env))
            .collect::<Result<Vec<_>, _>>()?;
        let fingerprint = group_fingerprint(&key);
        members
            .entry(fingerprint)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(row);
    }
    if group_by.is_empty() && order.is_empty() {
        order.push(Vec::new());
    }

    let mut rows = Vec::with_capacity(order.len());
    for key in order {
        let group = members
            .get(&group_fingerprint(&key))
            .map_or(&[][..], Vec::as_slice);
        let mut row = key;
        for item in aggregations {
            row.push(eval_aggregate(&item.expr, &input.columns, group)?);
        }
        rows.push(row);
    }

    let names = ProjectItem::output_names(group_by)
        .into_iter()
        .chain(ProjectItem::output_names(aggregations));
    let exprs = group_by.iter().chain(aggregations);
    let columns = names
        .zip(exprs)
        .enumerate()
        .map(|(i, (name, item))| {
            let passthrough = item
                .expr
                .as_column()
                .and_then(|c| input.columns.iter().find(|col| col.name == c));
            let kind = passthrough.map_or_else(|| kind_of(rows.iter().map(|r| &r[i])), |c| c.kind);
            ColumnInfo::new(name, kind)
        })
        .collect();
    Ok(RowSet::new(columns, rows))
}

fn group_fingerprint(key: &[Value]) -> String {
    key.iter().map(Value::group_key).collect::<Vec<_>>().join("\u{1f}")
}

/// Stable multi-key sort. Ascending puts nulls first, descending last.
fn sort(keys: &[SortKey], input: RowSet) -> Result<RowSet, EvalError> {
    let RowSet { columns, rows } = input;
    let mut keyed = Vec::with_capacity(rows.len());
    for row in rows {
        let env = Env::row(&columns, &row);
        let values = keys
            .iter()
            .map(|k| eval(&k.expr, &env))
            .collect::<Result<Vec<_>, _>>()?;
        keyed.push((values, row));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        keys.iter()
            .zip(a.iter().zip(b))
            .map(|(key, (x, y))| match key.order {
                SortOrder::Asc => x.sort_cmp(y),
                SortOrder::Desc => y.sort_cmp(x),
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    Ok(RowSet::new(columns, keyed.into_iter().map(|(_, row)| row).collect()))
}

fn take(mut input: RowSet, count: u64) -> RowSet {
    input
        .rows
        .truncate(usize::try_from(count).unwrap_or(usize::MAX));
    input
}

fn dedupe(input: RowSet) -> RowSet {
    let mut seen = HashSet::new();
    let RowSet { columns, rows } = input;
    let rows = rows
        .into_iter()
        .filter(|row| seen.insert(group_fingerprint(row)))
        .collect();
    RowSet::new(columns, rows)
}

fn join(
    kind: JoinKind,
    left: &RowSet,
    right: &RowSet,
    on: &super::ast::Expr,
) -> Result<RowSet, EvalError> {
    let columns = join_columns(&left.columns, &right.columns);
    let left_nulls = vec![Value::Null; left.columns.len()];
    let right_nulls = vec![Value::Null; right.columns.len()];
    let mut right_matched = vec![false; right.rows.len()];
    let mut rows = Vec::new();

    for l in &left.rows {
        let mut matched = false;
        for (j, r) in right.rows.iter().enumerate() {
            let env = Env {
                current: Frame {
                    columns: &[],
                    values: &[],
                },
                left: Frame {
                    columns: &left.columns,
                    values: l,
                },
                right: Frame {
                    columns: &right.columns,
                    values: r,
                },
            };
            if eval(on, &env)?.is_true() {
                matched = true;
                right_matched[j] = true;
                rows.push(l.iter().chain(r).cloned().collect());
            }
        }
        if !matched && matches!(kind, JoinKind::Left | JoinKind::Full) {
            rows.push(l.iter().chain(&right_nulls).cloned().collect());
        }
    }
    if matches!(kind, JoinKind::Right | JoinKind::Full) {
        for (r, matched) in right.rows.iter().zip(right_matched) {
            if !matched {
                rows.push(left_nulls.iter().chain(r).cloned().collect());
            }
        }
    }
    Ok(RowSet::new(columns, rows))
}

fn union(branches: Vec<RowSet>) -> RowSet {
    let layouts: Vec<Vec<ColumnInfo>> = branches.iter().map(|b| b.columns.clone()).collect();
    let columns = union_columns(&layouts);
    let mut rows = Vec::new();
    for branch in branches {
        let positions: Vec<Option<usize>> = columns
            .iter()
            .map(|c| branch.column_index(&c.name))
            .collect();
        for row in branch.rows {
            rows.push(
                positions
                    .iter()
                    .map(|p| p.and_then(|i| row.get(i).cloned()).unwrap_or(Value::Null))
                    .collect(),
            );
        }
    }
    RowSet::new(columns, rows)
}
