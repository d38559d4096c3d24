//! SQL generation.
//!
//! Lowers an optimized query into one ClickHouse `SELECT` with positional
//! `$n` placeholders. Stages are merged into the current select block while
//! that is legal; otherwise the block becomes a derived table `(...) AS sN`
//! and a new block starts on top of it.
//!
//! Every scan of a catalog table is scoped with `org_id = $K`, where `$K` is
//! numbered after all user parameters. User literals never appear in the SQL
//! text.

use super::ast::{BinaryOp, Expr, JoinKind, Operation, ProjectItem, Query, SortOrder, TableExpression, UnaryOp, UnionKind};
use super::error::GenerationError;
use super::validate::{distinct_names, infer_type, join_columns, union_columns};
use crate::models::{ColumnInfo, ColumnType, Value};
use crate::schema::SchemaProvider;
use serde::Serialize;

/// Physical column every table carries for tenant isolation.
pub const ORG_COLUMN: &str = "org_id";

/// A bound parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    /// Placeholder as it appears in the SQL text, e.g. `$1`.
    pub placeholder: String,
    /// Bound value.
    pub value: Value,
}

/// A parameterized statement ready for a [`BackingStore`](crate::storage::BackingStore).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlQuery {
    /// Statement text.
    pub sql: String,
    /// Parameters, in placeholder order (`params[0]` binds `$1`).
    pub params: Vec<Param>,
    /// Result columns, by KQL name, in select order.
    pub columns: Vec<ColumnInfo>,
}

/// Lowers `query` to SQL scoped to `org_id`.
///
/// # Errors
///
/// Returns an error for constructs without a SQL lowering (for example
/// `parse_json`, or `bin` with a computed bucket size) and for tables or
/// columns missing from the catalog.
///
/// # Example
///
/// ```
/// use engine::query::{generate, parse_query};
/// use engine::schema::{ColumnSchema, InMemorySchemaProvider, TableSchema};
/// use engine::models::ColumnType;
///
/// let schema = InMemorySchemaProvider::new().with_table(TableSchema::new(
///     "SecurityEvent",
///     vec![ColumnSchema::new("EventID", ColumnType::Long)],
/// ));
/// let query = parse_query("SecurityEvent | where EventID == 4625").unwrap();
/// let sql = generate(&query, &schema, "acme").unwrap();
/// assert!(sql.sql.contains("org_id = $2"));
/// assert_eq!(sql.params.len(), 2);
/// ```
pub fn generate(
    query: &Query,
    schema: &dyn SchemaProvider,
    org_id: &str,
) -> Result<SqlQuery, GenerationError> {
    // Generation is deterministic: a first pass counts the user parameters
    // so the organization parameter can be numbered after them.
    let mut counting = Emitter::new(schema, String::new());
    counting.statement(query)?;
    let org_placeholder = format!("${}", counting.params.len() + 1);

    let mut emitter = Emitter::new(schema, org_placeholder);
    let (sql, columns) = emitter.statement(query)?;
    emitter.params.push(Value::String(org_id.to_string()));

    let params = emitter
        .params
        .into_iter()
        .enumerate()
        .map(|(i, value)| Param {
            placeholder: format!("${}", i + 1),
            value,
        })
        .collect();
    Ok(SqlQuery {
        sql,
        params,
        columns,
    })
}

/// Quotes an identifier unless it is plain lowercase snake_case.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    const RESERVED: [&str; 24] = [
        "all", "and", "as", "asc", "by", "case", "desc", "distinct", "else", "end", "from",
        "group", "in", "is", "join", "limit", "not", "null", "on", "or", "order", "select",
        "union", "where",
    ];
    let mut chars = name.chars();
    let plain = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED.contains(&name);
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// A column visible in a select block: its KQL name and the SQL expression
/// defining it over the block's `FROM`.
#[derive(Debug, Clone)]
struct Column {
    name: String,
    sql: String,
    kind: ColumnType,
}

/// One `SELECT` under construction.
#[derive(Debug, Clone, Default)]
struct SelectBlock {
    from: String,
    columns: Vec<Column>,
    /// True when `from` is a catalog table and needs the org predicate.
    scan: bool,
    filters: Vec<String>,
    /// `Some` once the block aggregates; empty for a global aggregate.
    group_by: Option<Vec<String>>,
    order_by: Vec<String>,
    limit: Option<u64>,
    distinct: bool,
}

impl SelectBlock {
    fn infos(&self) -> Vec<ColumnInfo> {
        self.columns
            .iter()
            .map(|c| ColumnInfo::new(c.name.clone(), c.kind))
            .collect()
    }

    fn render(&self, org_placeholder: &str) -> String {
        let select: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} AS {}", c.sql, quote_identifier(&c.name)))
            .collect();
        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if self.distinct { "DISTINCT " } else { "" },
            select.join(", "),
            self.from
        );

        let mut conditions = Vec::new();
        if self.scan {
            conditions.push(format!("{ORG_COLUMN} = {org_placeholder}"));
        }
        conditions.extend(self.filters.iter().map(|f| format!("({f})")));
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        if let Some(keys) = self.group_by.as_ref().filter(|k| !k.is_empty()) {
            sql.push_str(" GROUP BY ");
            sql.push_str(&keys.join(", "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let Some(n) = self.limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }
        sql
    }
}

/// Name resolution for expressions: the current block, plus both join inputs
/// while lowering a join condition.
struct Scope<'b> {
    columns: &'b [Column],
    left: &'b [Column],
    right: &'b [Column],
}

impl<'b> Scope<'b> {
    fn block(block: &'b SelectBlock) -> Self {
        Self {
            columns: &block.columns,
            left: &[],
            right: &[],
        }
    }

    fn resolve(&self, name: &str) -> Option<&'b Column> {
        let find = |cols: &'b [Column], n: &str| cols.iter().find(|c| c.name == n);
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

    fn infos(&self) -> Vec<ColumnInfo> {
        self.columns
            .iter()
            .map(|c| ColumnInfo::new(c.name.clone(), c.kind))
            .collect()
    }
}

struct Emitter<'a> {
    schema: &'a dyn SchemaProvider,
    params: Vec<Value>,
    org_placeholder: String,
    next_alias: usize,
    outer_join: bool,
}

impl<'a> Emitter<'a> {
    fn new(schema: &'a dyn SchemaProvider, org_placeholder: String) -> Self {
        Self {
            schema,
            params: Vec::new(),
            org_placeholder,
            next_alias: 0,
            outer_join: false,
        }
    }

    fn statement(&mut self, query: &Query) -> Result<(String, Vec<ColumnInfo>), GenerationError> {
        let block = self.query_block(query)?;
        let mut sql = block.render(&self.org_placeholder);

        // aliases must not shadow physical columns in WHERE / GROUP BY
        let mut settings = vec!["prefer_column_name_to_alias = 1"];
        if self.outer_join {
            settings.push("join_use_nulls = 1");
        }
        sql.push_str(" SETTINGS ");
        sql.push_str(&settings.join(", "));
        Ok((sql, block.infos()))
    }

    fn query_block(&mut self, query: &Query) -> Result<SelectBlock, GenerationError> {
        let mut block = self.source(&query.source)?;
        for operation in &query.pipeline {
            block = self.apply(block, operation)?;
        }
        Ok(block)
    }

    fn source(&mut self, table: &TableExpression) -> Result<SelectBlock, GenerationError> {
        match table {
            TableExpression::Table { name, .. } => {
                let table = self
                    .schema
                    .table(name)
                    .ok_or_else(|| GenerationError::new(format!("table '{name}'")))?;
                Ok(SelectBlock {
                    from: quote_identifier(&table.sql_name),
                    columns: table
                        .columns
                        .iter()
                        .map(|c| Column {
                            name: c.name.clone(),
                            sql: quote_identifier(&c.sql_name),
                            kind: c.kind,
                        })
                        .collect(),
                    scan: true,
                    ..SelectBlock::default()
                })
            }
            // a nested pipeline continues in the same block
            TableExpression::Subquery { query, .. } => self.query_block(query),
        }
    }

    /// Turns `block` into a derived table and starts a new block over it.
    fn wrap(&mut self, block: &SelectBlock) -> SelectBlock {
        self.next_alias += 1;
        let alias = format!("s{}", self.next_alias);
        SelectBlock {
            from: format!("({}) AS {alias}", block.render(&self.org_placeholder)),
            columns: block
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    sql: format!("{alias}.{}", quote_identifier(&c.name)),
                    kind: c.kind,
                })
                .collect(),
            ..SelectBlock::default()
        }
    }

    fn wrap_if(&mut self, block: SelectBlock, needed: bool) -> SelectBlock {
        if needed {
            self.wrap(&block)
        } else {
            block
        }
    }

    fn items(&mut self, items: &[ProjectItem], block: &SelectBlock) -> Result<Vec<Column>, GenerationError> {
        let scope = Scope::block(block);
        let infos = scope.infos();
        items
            .iter()
            .zip(ProjectItem::output_names(items))
            .map(|(item, name)| {
                Ok(Column {
                    name,
                    sql: self.expr(&item.expr, &scope)?,
                    kind: infer_type(&item.expr, &infos, self.schema),
                })
            })
            .collect()
    }

    fn apply(&mut self, block: SelectBlock, operation: &Operation) -> Result<SelectBlock, GenerationError> {
        match operation {
            Operation::Where(predicate) => {
                let wrap = block.group_by.is_some() || block.limit.is_some() || block.distinct;
                let mut block = self.wrap_if(block, wrap);
                let sql = self.expr(predicate, &Scope::block(&block))?;
                block.filters.push(sql);
                Ok(block)
            }
            Operation::Project(items) => {
                let wrap = block.distinct;
                let mut block = self.wrap_if(block, wrap);
                block.columns = self.items(items, &block)?;
                Ok(block)
            }
            Operation::Extend(items) => {
                let wrap = block.distinct;
                let mut block = self.wrap_if(block, wrap);
                // each item sees the ones before it
                for (item, name) in items.iter().zip(ProjectItem::output_names(items)) {
                    let scope = Scope::block(&block);
                    let column = Column {
                        sql: self.expr(&item.expr, &scope)?,
                        kind: infer_type(&item.expr, &scope.infos(), self.schema),
                        name,
                    };
                    match block.columns.iter_mut().find(|c| c.name == column.name) {
                        Some(existing) => *existing = column,
                        None => block.columns.push(column),
                    }
                }
                Ok(block)
            }
            Operation::Summarize {
                aggregations,
                group_by,
            } => {
                let wrap = block.group_by.is_some() || block.limit.is_some() || block.distinct;
                let mut block = self.wrap_if(block, wrap);
                let mut columns = self.items(group_by, &block)?;
                columns.extend(self.items(aggregations, &block)?);
                block.group_by = Some(columns[..group_by.len()].iter().map(|c| c.sql.clone()).collect());
                block.columns = columns;
                // input order does not survive aggregation
                block.order_by.clear();
                Ok(block)
            }
            Operation::OrderBy(keys) => {
                let wrap = block.limit.is_some() || block.distinct;
                let mut block = self.wrap_if(block, wrap);
                let scope = Scope::block(&block);
                let mut order_by = Vec::with_capacity(keys.len());
                for key in keys {
                    order_by.push(self.sort_key(&key.expr, key.order, &scope)?);
                }
                block.order_by = order_by;
                Ok(block)
            }
            Operation::Top { count, by } => {
                let wrap = block.limit.is_some() || (block.distinct && by.is_some());
                let mut block = self.wrap_if(block, wrap);
                if let Some(key) = by {
                    let key = self.sort_key(&key.expr, key.order, &Scope::block(&block))?;
                    block.order_by = vec![key];
                }
                block.limit = Some(*count);
                Ok(block)
            }
            Operation::Limit(n) => {
                let mut block = block;
                block.limit = Some(block.limit.map_or(*n, |m| m.min(*n)));
                Ok(block)
            }
            Operation::Distinct(None) => {
                let wrap = block.limit.is_some() || !block.order_by.is_empty();
                let mut block = self.wrap_if(block, wrap);
                block.distinct = true;
                Ok(block)
            }
            Operation::Distinct(Some(exprs)) => {
                let items: Vec<ProjectItem> = exprs
                    .iter()
                    .zip(distinct_names(exprs))
                    .map(|(e, name)| ProjectItem::named(name, e.clone()))
                    .collect();
                let block = self.apply(block, &Operation::Project(items))?;
                self.apply(block, &Operation::Distinct(None))
            }
            Operation::Join { kind, right, on } => self.join(&block, *kind, right, on),
            Operation::Union { kind, others } => self.union(&block, *kind, others),
        }
    }

    fn sort_key(&mut self, expr: &Expr, order: SortOrder, scope: &Scope<'_>) -> Result<String, GenerationError> {
        let sql = self.expr(expr, scope)?;
        Ok(match order {
            SortOrder::Asc => format!("{sql} ASC NULLS FIRST"),
            SortOrder::Desc => format!("{sql} DESC NULLS LAST"),
        })
    }

    fn join(
        &mut self,
        block: &SelectBlock,
        kind: JoinKind,
        right: &TableExpression,
        on: &Expr,
    ) -> Result<SelectBlock, GenerationError> {
        let left = self.wrap(block);
        let right_block = self.source(right)?;
        let right = self.wrap(&right_block);

        let scope = Scope {
            columns: &[],
            left: &left.columns,
            right: &right.columns,
        };
        let condition = self.expr(on, &scope)?;
        let keyword = match kind {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT OUTER JOIN",
            JoinKind::Right => "RIGHT OUTER JOIN",
            JoinKind::Full => "FULL OUTER JOIN",
        };
        if kind != JoinKind::Inner {
            self.outer_join = true;
        }

        let names = join_columns(&left.infos(), &right.infos());
        let columns = left
            .columns
            .iter()
            .chain(&right.columns)
            .zip(names)
            .map(|(column, info)| Column {
                name: info.name,
                sql: column.sql.clone(),
                kind: info.kind,
            })
            .collect();
        Ok(SelectBlock {
            from: format!("{} {keyword} {} ON {condition}", left.from, right.from),
            columns,
            ..SelectBlock::default()
        })
    }

    fn union(
        &mut self,
        block: &SelectBlock,
        kind: UnionKind,
        others: &[TableExpression],
    ) -> Result<SelectBlock, GenerationError> {
        let mut branches = vec![self.wrap(block)];
        for other in others {
            let source = self.source(other)?;
            branches.push(self.wrap(&source));
        }
        let merged = union_columns(&branches.iter().map(SelectBlock::infos).collect::<Vec<_>>());

        let rendered: Vec<String> = branches
            .iter_mut()
            .map(|branch| {
                branch.columns = merged
                    .iter()
                    .map(|info| Column {
                        name: info.name.clone(),
                        sql: branch
                            .columns
                            .iter()
                            .find(|c| c.name == info.name)
                            .map_or_else(|| "NULL".to_string(), |c| c.sql.clone()),
                        kind: info.kind,
                    })
                    .collect();
                branch.render(&self.org_placeholder)
            })
            .collect();
        let separator = match kind {
            UnionKind::All => " UNION ALL ",
            UnionKind::Distinct => " UNION DISTINCT ",
        };

        self.next_alias += 1;
        let alias = format!("s{}", self.next_alias);
        Ok(SelectBlock {
            from: format!("({}) AS {alias}", rendered.join(separator)),
            columns: merged
                .into_iter()
                .map(|info| Column {
                    sql: format!("{alias}.{}", quote_identifier(&info.name)),
                    name: info.name,
                    kind: info.kind,
                })
                .collect(),
            ..SelectBlock::default()
        })
    }

    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    fn literal(&mut self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Datetime(_) => {
                let p = self.bind(value.clone());
                format!("toDateTime64({p}, 6)")
            }
            Value::Timespan(_) => {
                let p = self.bind(value.clone());
                format!("toIntervalMicrosecond({p})")
            }
            other => self.bind(other.clone()),
        }
    }

    fn expr(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<String, GenerationError> {
        match expr {
            Expr::Literal(value) => Ok(self.literal(value)),
            Expr::ColumnRef(name) => scope
                .resolve(name)
                .map(|c| c.sql.clone())
                .ok_or_else(|| GenerationError::new(format!("column '{name}'"))),
            Expr::BinaryOp { op, left, right } => self.binary(*op, left, right, scope),
            Expr::UnaryOp { op, operand } => {
                let inner = self.expr(operand, scope)?;
                Ok(match op {
                    UnaryOp::Not => format!("NOT ({inner})"),
                    UnaryOp::Neg => format!("-({inner})"),
                })
            }
            Expr::FunctionCall { name, args } => self.function(name, args, scope),
            Expr::Case {
                branches,
                otherwise,
            } => {
                let mut parts = Vec::with_capacity(branches.len() * 2 + 1);
                for branch in branches {
                    parts.push(self.expr(&branch.when, scope)?);
                    parts.push(self.expr(&branch.then, scope)?);
                }
                parts.push(self.expr(otherwise, scope)?);
                Ok(format!("multiIf({})", parts.join(", ")))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let tested = self.expr(expr, scope)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    items.push(self.expr(item, scope)?);
                }
                let op = if *negated { "NOT IN" } else { "IN" };
                Ok(format!("{tested} {op} ({})", items.join(", ")))
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, scope: &Scope<'_>) -> Result<String, GenerationError> {
        let l = self.expr(left, scope)?;
        let r = self.expr(right, scope)?;
        let sql = match op {
            BinaryOp::And => format!("({l} AND {r})"),
            BinaryOp::Or => format!("({l} OR {r})"),
            BinaryOp::Eq => format!("{l} = {r}"),
            BinaryOp::NotEq => format!("{l} != {r}"),
            BinaryOp::Lt => format!("{l} < {r}"),
            BinaryOp::LtEq => format!("{l} <= {r}"),
            BinaryOp::Gt => format!("{l} > {r}"),
            BinaryOp::GtEq => format!("{l} >= {r}"),
            BinaryOp::EqTilde => format!("lower({l}) = lower({r})"),
            BinaryOp::NotEqTilde => format!("lower({l}) != lower({r})"),
            BinaryOp::Contains => format!("positionCaseInsensitiveUTF8({l}, {r}) > 0"),
            BinaryOp::NotContains => format!("positionCaseInsensitiveUTF8({l}, {r}) = 0"),
            BinaryOp::Has => format!("hasTokenCaseInsensitive({l}, {r})"),
            BinaryOp::NotHas => format!("NOT hasTokenCaseInsensitive({l}, {r})"),
            BinaryOp::StartsWith => format!("startsWith(lower({l}), lower({r}))"),
            BinaryOp::NotStartsWith => format!("NOT startsWith(lower({l}), lower({r}))"),
            BinaryOp::EndsWith => format!("endsWith(lower({l}), lower({r}))"),
            BinaryOp::NotEndsWith => format!("NOT endsWith(lower({l}), lower({r}))"),
            BinaryOp::MatchesRegex => format!("match({l}, {r})"),
            BinaryOp::Add => format!("({l} + {r})"),
            BinaryOp::Sub => format!("({l} - {r})"),
            BinaryOp::Mul => format!("({l} * {r})"),
            BinaryOp::Mod => format!("({l} % {r})"),
            BinaryOp::Div => {
                let infos = scope.infos();
                let integral = infer_type(left, &infos, self.schema) == ColumnType::Long
                    && infer_type(right, &infos, self.schema) == ColumnType::Long;
                if integral {
                    format!("intDiv({l}, {r})")
                } else {
                    format!("({l} / {r})")
                }
            }
        };
        Ok(sql)
    }

    fn function(&mut self, name: &str, args: &[Expr], scope: &Scope<'_>) -> Result<String, GenerationError> {
        if name == "bin" || name == "floor" {
            return self.bin(name, args, scope);
        }
        if name == "parse_json" {
            return Err(GenerationError::new("parse_json"));
        }

        let mut lowered = Vec::with_capacity(args.len());
        for arg in args {
            lowered.push(self.expr(arg, scope)?);
        }
        let a = |i: usize| lowered.get(i).cloned().unwrap_or_default();
        let all = lowered.join(", ");

        let sql = match name {
            "count" => "count()".to_string(),
            "countif" => format!("countIf({all})"),
            "sum" | "avg" | "min" | "max" | "abs" | "coalesce" => format!("{name}({all})"),
            "dcount" => format!("uniqExact({all})"),
            "tolower" => format!("lower({all})"),
            "toupper" => format!("upper({all})"),
            "strlen" => format!("lengthUTF8({all})"),
            "substring" if lowered.len() == 3 => {
                format!("substringUTF8({}, {} + 1, {})", a(0), a(1), a(2))
            }
            "substring" => format!("substringUTF8({}, {} + 1)", a(0), a(1)),
            "strcat" => {
                let parts: Vec<String> = lowered.iter().map(|p| format!("toString({p})")).collect();
                format!("concat({})", parts.join(", "))
            }
            "isempty" => format!("(isNull({0}) OR empty({0}))", a(0)),
            "isnotempty" => format!("(isNotNull({0}) AND notEmpty({0}))", a(0)),
            "now" => "now64(6)".to_string(),
            "ago" => format!("(now64(6) - {})", a(0)),
            "startofday" => format!("toStartOfDay({all})"),
            "round" if lowered.len() == 1 => format!("round({}, 0)", a(0)),
            "round" => format!("round({all})"),
            "isnull" => format!("isNull({all})"),
            "isnotnull" => format!("isNotNull({all})"),
            "iff" | "iif" => format!("if({all})"),
            "tostring" => format!("toString({all})"),
            "tolong" | "toint" => format!("toInt64OrNull(toString({all}))"),
            "todouble" | "toreal" => format!("toFloat64OrNull(toString({all}))"),
            other => return Err(GenerationError::new(format!("function '{other}'"))),
        };
        Ok(sql)
    }

    /// `bin(x, size)`: time buckets use `toStartOfInterval`, numeric buckets
    /// round down to a multiple of the size.
    fn bin(&mut self, name: &str, args: &[Expr], scope: &Scope<'_>) -> Result<String, GenerationError> {
        let (Some(value), Some(Expr::Literal(size))) = (args.first(), args.get(1)) else {
            return Err(GenerationError::new(format!("{name} with a non-constant bucket size")));
        };
        let value = self.expr(value, scope)?;
        match size {
            Value::Timespan(_) => {
                let interval = self.literal(size);
                Ok(format!("toStartOfInterval({value}, {interval})"))
            }
            Value::Long(_) | Value::Real(_) => {
                let p = self.bind(size.clone());
                Ok(format!("(floor({value} / {p}) * {p})"))
            }
            _ => Err(GenerationError::new(format!("{name} with a {} bucket size", size.kind().map_or("null".to_string(), |k| k.to_string())))),
        }
    }
}
