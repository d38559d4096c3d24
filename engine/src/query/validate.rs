//! Semantic validation.
//!
//! Walks the pipeline with the cumulative schema in hand: every column
//! reference must resolve against the source table or a column introduced by
//! an earlier stage, every function must be in the catalog with a matching
//! arity, and aggregates may only appear in `summarize`.

use super::ast::{BinaryOp, Expr, Operation, ProjectItem, Query, TableExpression, UnaryOp};
use super::error::{SemanticError, SemanticErrorKind};
use crate::models::{ColumnInfo, ColumnType};
use crate::schema::{ReturnKind, SchemaProvider};

/// Checks a query and returns its output columns.
///
/// # Errors
///
/// Returns the first [`SemanticError`] in pipeline order.
///
/// # Example
///
/// ```
/// use engine::models::ColumnType;
/// use engine::query::{parse_query, validate};
/// use engine::schema::{ColumnSchema, InMemorySchemaProvider, TableSchema};
///
/// let schema = InMemorySchemaProvider::new().with_table(TableSchema::new(
///     "SecurityEvent",
///     vec![ColumnSchema::new("Account", ColumnType::String)],
/// ));
/// let query = parse_query("SecurityEvent | summarize count() by Account").unwrap();
/// let columns = validate(&query, &schema).unwrap();
/// assert_eq!(columns[1].name, "count_");
/// ```
pub fn validate(query: &Query, schema: &dyn SchemaProvider) -> Result<Vec<ColumnInfo>, SemanticError> {
    let mut walker = Walker::new(schema);
    let columns = walker.query(query);
    match walker.errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(columns),
    }
}

/// Checks a query and returns every error found, for editor diagnostics.
///
/// After an error the walk continues with the offending column typed as
/// `dynamic`; an unknown source table ends the walk of that query.
#[must_use]
pub fn validate_all(query: &Query, schema: &dyn SchemaProvider) -> Vec<SemanticError> {
    let mut walker = Walker::new(schema);
    walker.query(query);
    walker.errors
}

/// Result type of an expression over the given columns. Unknown names and
/// functions are typed as `dynamic`.
#[must_use]
pub fn infer_type(expr: &Expr, columns: &[ColumnInfo], schema: &dyn SchemaProvider) -> ColumnType {
    let mut walker = Walker::new(schema);
    walker.expr(expr, &Scope::single(columns), true)
}

/// Output names of a `distinct` column list.
#[must_use]
pub fn distinct_names(exprs: &[Expr]) -> Vec<String> {
    let items: Vec<ProjectItem> = exprs.iter().cloned().map(ProjectItem::new).collect();
    ProjectItem::output_names(&items)
}

/// Columns produced by a join: the left columns, then the right columns with
/// any name already taken suffixed with `1`.
#[must_use]
pub fn join_columns(left: &[ColumnInfo], right: &[ColumnInfo]) -> Vec<ColumnInfo> {
    let mut out = left.to_vec();
    for column in right {
        let mut name = column.name.clone();
        while out.iter().any(|c| c.name == name) {
            name.push('1');
        }
        out.push(ColumnInfo::new(name, column.kind));
    }
    out
}

/// Columns produced by a union: every column of every branch, in order of
/// first appearance. A name whose type differs between branches becomes
/// `dynamic`.
#[must_use]
pub fn union_columns(branches: &[Vec<ColumnInfo>]) -> Vec<ColumnInfo> {
    let mut out: Vec<ColumnInfo> = Vec::new();
    for column in branches.iter().flatten() {
        match out.iter_mut().find(|c| c.name == column.name) {
            Some(existing) if existing.kind != column.kind => existing.kind = ColumnType::Dynamic,
            Some(_) => {}
            None => out.push(column.clone()),
        }
    }
    out
}

/// Name resolution context: the current columns, plus the two join inputs
/// while checking a join condition.
struct Scope<'s> {
    columns: &'s [ColumnInfo],
    left: &'s [ColumnInfo],
    right: &'s [ColumnInfo],
}

impl<'s> Scope<'s> {
    fn single(columns: &'s [ColumnInfo]) -> Self {
        Self {
            columns,
            left: &[],
            right: &[],
        }
    }

    fn join(left: &'s [ColumnInfo], right: &'s [ColumnInfo]) -> Self {
        Self {
            columns: &[],
            left,
            right,
        }
    }

    fn resolve(&self, name: &str) -> Option<ColumnType> {
        let find = |columns: &[ColumnInfo], name: &str| {
            columns.iter().find(|c| c.name == name).map(|c| c.kind)
        };
        if let Some(rest) = name.strip_prefix("$left.") {
            return find(self.left, rest);
        }
        if let Some(rest) = name.strip_prefix("$right.") {
            return find(self.right, rest);
        }
        find(self.columns, name)
            .or_else(|| find(self.left, name))
            .or_else(|| find(self.right, name))
    }
}

struct Walker<'a> {
    schema: &'a dyn SchemaProvider,
    errors: Vec<SemanticError>,
}

impl<'a> Walker<'a> {
    fn new(schema: &'a dyn SchemaProvider) -> Self {
        Self {
            schema,
            errors: Vec::new(),
        }
    }

    fn error(&mut self, kind: SemanticErrorKind, name: &str) {
        self.errors.push(SemanticError::new(kind, name));
    }

    fn query(&mut self, query: &Query) -> Vec<ColumnInfo> {
        let Some(mut columns) = self.table_expression(&query.source) else {
            return Vec::new();
        };
        for operation in &query.pipeline {
            columns = self.operation(operation, columns);
        }
        columns
    }

    fn table_expression(&mut self, table: &TableExpression) -> Option<Vec<ColumnInfo>> {
        match table {
            TableExpression::Table { name, .. } => match self.schema.table(name) {
                Some(schema) => Some(
                    schema
                        .columns
                        .iter()
                        .map(|c| ColumnInfo::new(c.name.clone(), c.kind))
                        .collect(),
                ),
                None => {
                    self.error(SemanticErrorKind::UnknownTable, name);
                    None
                }
            },
            TableExpression::Subquery { query, .. } => {
                let before = self.errors.len();
                let columns = self.query(query);
                // a subquery whose source is unknown has no usable columns
                if columns.is_empty() && self.errors.len() > before {
                    None
                } else {
                    Some(columns)
                }
            }
        }
    }

    fn operation(&mut self, operation: &Operation, columns: Vec<ColumnInfo>) -> Vec<ColumnInfo> {
        match operation {
            Operation::Where(predicate) => {
                self.expr(predicate, &Scope::single(&columns), false);
                columns
            }
            Operation::Project(items) => {
                let names = ProjectItem::output_names(items);
                items
                    .iter()
                    .zip(names)
                    .map(|(item, name)| {
                        let kind = self.expr(&item.expr, &Scope::single(&columns), false);
                        ColumnInfo::new(name, kind)
                    })
                    .collect()
            }
            Operation::Extend(items) => {
                let names = ProjectItem::output_names(items);
                let mut columns = columns;
                for (item, name) in items.iter().zip(names) {
                    let kind = self.expr(&item.expr, &Scope::single(&columns), false);
                    set_column(&mut columns, name, kind);
                }
                columns
            }
            Operation::Summarize {
                aggregations,
                group_by,
            } => {
                let scope = Scope::single(&columns);
                let mut out = Vec::new();
                for (item, name) in group_by.iter().zip(ProjectItem::output_names(group_by)) {
                    let kind = self.expr(&item.expr, &scope, false);
                    out.push(ColumnInfo::new(name, kind));
                }
                for (item, name) in aggregations
                    .iter()
                    .zip(ProjectItem::output_names(aggregations))
                {
                    if !item.expr.contains_aggregate(&|f| self.is_aggregate(f)) {
                        self.error(SemanticErrorKind::NotAnAggregate, &name);
                    }
                    let kind = self.expr(&item.expr, &scope, true);
                    out.push(ColumnInfo::new(name, kind));
                }
                out
            }
            Operation::OrderBy(keys) => {
                for key in keys {
                    self.expr(&key.expr, &Scope::single(&columns), false);
                }
                columns
            }
            Operation::Top { by, .. } => {
                if let Some(key) = by {
                    self.expr(&key.expr, &Scope::single(&columns), false);
                }
                columns
            }
            Operation::Limit(_) | Operation::Distinct(None) => columns,
            Operation::Distinct(Some(exprs)) => exprs
                .iter()
                .zip(distinct_names(exprs))
                .map(|(expr, name)| {
                    let kind = self.expr(expr, &Scope::single(&columns), false);
                    ColumnInfo::new(name, kind)
                })
                .collect(),
            Operation::Join { right, on, .. } => {
                let Some(right_columns) = self.table_expression(right) else {
                    return columns;
                };
                self.expr(on, &Scope::join(&columns, &right_columns), false);
                join_columns(&columns, &right_columns)
            }
            Operation::Union { others, .. } => {
                let mut branches = vec![columns];
                for other in others {
                    if let Some(columns) = self.table_expression(other) {
                        branches.push(columns);
                    }
                }
                union_columns(&branches)
            }
        }
    }

    fn is_aggregate(&self, name: &str) -> bool {
        self.schema.function(name).is_some_and(|f| f.aggregate)
    }

    /// Checks an expression and returns its type.
    fn expr(&mut self, expr: &Expr, scope: &Scope<'_>, allow_aggregates: bool) -> ColumnType {
        match expr {
            Expr::Literal(value) => value.kind().unwrap_or(ColumnType::Dynamic),
            Expr::ColumnRef(name) => scope.resolve(name).unwrap_or_else(|| {
                self.error(SemanticErrorKind::UnknownColumn, name);
                ColumnType::Dynamic
            }),
            Expr::BinaryOp { op, left, right } => {
                let l = self.expr(left, scope, allow_aggregates);
                let r = self.expr(right, scope, allow_aggregates);
                binary_type(*op, l, r)
            }
            Expr::UnaryOp { op, operand } => {
                let kind = self.expr(operand, scope, allow_aggregates);
                match op {
                    UnaryOp::Not => ColumnType::Bool,
                    UnaryOp::Neg => kind,
                }
            }
            Expr::FunctionCall { name, args } => {
                let Some(signature) = self.schema.function(name) else {
                    self.error(SemanticErrorKind::UnknownFunction, name);
                    for arg in args {
                        self.expr(arg, scope, allow_aggregates);
                    }
                    return ColumnType::Dynamic;
                };
                if !signature.accepts(args.len()) {
                    self.error(SemanticErrorKind::ArityMismatch, name);
                }
                if signature.aggregate && !allow_aggregates {
                    self.error(SemanticErrorKind::AggregateOutsideSummarize, name);
                }
                // aggregate arguments are row-level expressions
                let nested = allow_aggregates && !signature.aggregate;
                let kinds: Vec<ColumnType> =
                    args.iter().map(|a| self.expr(a, scope, nested)).collect();
                match signature.returns {
                    ReturnKind::Fixed(kind) => kind,
                    ReturnKind::SameAsArg(i) => kinds.get(i).copied().unwrap_or(ColumnType::Dynamic),
                }
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                let mut result = None;
                for branch in branches {
                    self.expr(&branch.when, scope, allow_aggregates);
                    let kind = self.expr(&branch.then, scope, allow_aggregates);
                    result.get_or_insert(kind);
                }
                let other = self.expr(otherwise, scope, allow_aggregates);
                result.unwrap_or(other)
            }
            Expr::InList { expr, list, .. } => {
                self.expr(expr, scope, allow_aggregates);
                for item in list {
                    self.expr(item, scope, allow_aggregates);
                }
                ColumnType::Bool
            }
        }
    }
}

fn set_column(columns: &mut Vec<ColumnInfo>, name: String, kind: ColumnType) {
    match columns.iter_mut().find(|c| c.name == name) {
        Some(existing) => existing.kind = kind,
        None => columns.push(ColumnInfo::new(name, kind)),
    }
}

/// Result type of a binary operator.
#[must_use]
pub fn binary_type(op: BinaryOp, left: ColumnType, right: ColumnType) -> ColumnType {
    use ColumnType::{Bool, Datetime, Dynamic, Long, Real, Timespan};

    if op.precedence() <= 3 {
        return Bool;
    }
    match (op, left, right) {
        (BinaryOp::Sub, Datetime, Datetime) => Timespan,
        (BinaryOp::Add | BinaryOp::Sub, Datetime, Timespan) | (BinaryOp::Add, Timespan, Datetime) => {
            Datetime
        }
        (BinaryOp::Add | BinaryOp::Sub, Timespan, Timespan) => Timespan,
        (BinaryOp::Mul | BinaryOp::Div, Timespan, Long | Real) | (BinaryOp::Mul, Long | Real, Timespan) => {
            Timespan
        }
        (_, Long, Long) => Long,
        (_, l, r) if l.is_numeric() && r.is_numeric() => Real,
        _ => Dynamic,
    }
}
