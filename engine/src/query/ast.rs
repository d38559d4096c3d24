//! Abstract Syntax Tree definitions for KQL.
//!
//! A query is a source table expression followed by an ordered pipeline of
//! tabular operations. `Display` renders canonical KQL: printing a tree and
//! parsing the text back yields the same tree.

use super::lexer::Keyword;
use crate::models::Value;
use crate::schema::is_builtin_aggregate;
use serde::Serialize;
use std::collections::BTreeSet;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    /// `or`
    Or,
    /// `and`
    And,
    /// `==`
    Eq,
    /// `!=` / `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `=~` (case-insensitive equality)
    EqTilde,
    /// `!~`
    NotEqTilde,
    /// `contains` (case-insensitive substring)
    Contains,
    /// `!contains`
    NotContains,
    /// `has` (case-insensitive whole term)
    Has,
    /// `!has`
    NotHas,
    /// `startswith`
    StartsWith,
    /// `!startswith`
    NotStartsWith,
    /// `endswith`
    EndsWith,
    /// `!endswith`
    NotEndsWith,
    /// `matches regex`
    MatchesRegex,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
}

impl BinaryOp {
    /// Binding strength; higher binds tighter.
    #[must_use]
    pub const fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Add | Self::Sub => 4,
            Self::Mul | Self::Div | Self::Mod => 5,
            _ => 3,
        }
    }

    /// Returns true for comparison and string-match operators.
    #[must_use]
    pub const fn is_comparison(self) -> bool {
        self.precedence() == 3
    }

    /// Returns true for the case-insensitive string predicates.
    #[must_use]
    pub const fn is_string_match(self) -> bool {
        matches!(
            self,
            Self::Contains
                | Self::NotContains
                | Self::Has
                | Self::NotHas
                | Self::StartsWith
                | Self::NotStartsWith
                | Self::EndsWith
                | Self::NotEndsWith
                | Self::EqTilde
                | Self::NotEqTilde
        )
    }

    /// Canonical KQL spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Or => "or",
            Self::And => "and",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::EqTilde => "=~",
            Self::NotEqTilde => "!~",
            Self::Contains => "contains",
            Self::NotContains => "!contains",
            Self::Has => "has",
            Self::NotHas => "!has",
            Self::StartsWith => "startswith",
            Self::NotStartsWith => "!startswith",
            Self::EndsWith => "endswith",
            Self::NotEndsWith => "!endswith",
            Self::MatchesRegex => "matches regex",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
        }
    }
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    /// Logical negation
    Not,
    /// Arithmetic negation
    Neg,
}

/// One `when ... then ...` arm of a `case`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseBranch {
    /// Condition.
    pub when: Expr,
    /// Result when the condition holds.
    pub then: Expr,
}

/// Scalar expressions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Column reference. Join conditions use `$left.Name` / `$right.Name`.
    ColumnRef(String),
    /// Binary operation.
    BinaryOp {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Unary operation.
    UnaryOp {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Function call.
    FunctionCall {
        /// Function name.
        name: String,
        /// Arguments.
        args: Vec<Expr>,
    },
    /// Multi-way conditional.
    Case {
        /// Arms, tested in order.
        branches: Vec<CaseBranch>,
        /// Result when no arm matches.
        otherwise: Box<Expr>,
    },
    /// `expr in (...)` / `expr !in (...)`.
    InList {
        /// Tested value.
        expr: Box<Expr>,
        /// Candidates.
        list: Vec<Expr>,
        /// True for `!in`.
        negated: bool,
    },
}

const ATOM: u8 = 7;
const UNARY: u8 = 6;

impl Expr {
    /// Column reference.
    #[must_use]
    pub fn column(name: impl Into<String>) -> Self {
        Self::ColumnRef(name.into())
    }

    /// Literal.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Binary operation.
    #[must_use]
    pub fn binary(op: BinaryOp, left: Self, right: Self) -> Self {
        Self::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Unary operation.
    #[must_use]
    pub fn unary(op: UnaryOp, operand: Self) -> Self {
        Self::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    /// Function call.
    #[must_use]
    pub fn call(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::FunctionCall {
            name: name.into(),
            args,
        }
    }

    /// `left and right`.
    #[must_use]
    pub fn and(left: Self, right: Self) -> Self {
        Self::binary(BinaryOp::And, left, right)
    }

    /// Returns the literal value, if this is a literal.
    #[must_use]
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the column name, if this is a plain column reference.
    #[must_use]
    pub fn as_column(&self) -> Option<&str> {
        match self {
            Self::ColumnRef(name) => Some(name),
            _ => None,
        }
    }

    /// Binding strength used when printing.
    #[must_use]
    pub fn precedence(&self) -> u8 {
        match self {
            Self::BinaryOp { op, .. } => op.precedence(),
            Self::InList { .. } => 3,
            Self::UnaryOp { .. } => UNARY,
            _ => ATOM,
        }
    }

    /// Direct sub-expressions, left to right.
    #[must_use]
    pub fn children(&self) -> Vec<&Self> {
        match self {
            Self::Literal(_) | Self::ColumnRef(_) => Vec::new(),
            Self::BinaryOp { left, right, .. } => vec![left, right],
            Self::UnaryOp { operand, .. } => vec![operand],
            Self::FunctionCall { args, .. } => args.iter().collect(),
            Self::Case {
                branches,
                otherwise,
            } => branches
                .iter()
                .flat_map(|b| [&b.when, &b.then])
                .chain(std::iter::once(otherwise.as_ref()))
                .collect(),
            Self::InList { expr, list, .. } => {
                std::iter::once(expr.as_ref()).chain(list.iter()).collect()
            }
        }
    }

    /// Every column name referenced anywhere in the expression.
    #[must_use]
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        if let Self::ColumnRef(name) = self {
            out.insert(name.clone());
        }
        for child in self.children() {
            child.collect_columns(out);
        }
    }

    /// Returns true if `pred` holds for this node or any descendant.
    pub fn any(&self, pred: &dyn Fn(&Self) -> bool) -> bool {
        pred(self) || self.children().into_iter().any(|c| c.any(pred))
    }

    /// Returns true if the expression calls a function satisfying `is_aggregate`.
    pub fn contains_aggregate(&self, is_aggregate: &dyn Fn(&str) -> bool) -> bool {
        self.any(&|e| matches!(e, Self::FunctionCall { name, .. } if is_aggregate(name)))
    }

    /// Returns true if the expression only contains literals and operators.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        !self.any(&|e| matches!(e, Self::ColumnRef(_) | Self::FunctionCall { .. }))
    }

    /// Splits a conjunction into its terms.
    #[must_use]
    pub fn conjuncts(&self) -> Vec<&Self> {
        match self {
            Self::BinaryOp {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let mut terms = left.conjuncts();
                terms.extend(right.conjuncts());
                terms
            }
            other => vec![other],
        }
    }

    /// Rebuilds the expression bottom-up, applying `f` to every node after its
    /// children have been rewritten.
    #[must_use]
    pub fn transform(self, f: &dyn Fn(Self) -> Self) -> Self {
        let rebuilt = match self {
            Self::BinaryOp { op, left, right } => Self::BinaryOp {
                op,
                left: Box::new(left.transform(f)),
                right: Box::new(right.transform(f)),
            },
            Self::UnaryOp { op, operand } => Self::UnaryOp {
                op,
                operand: Box::new(operand.transform(f)),
            },
            Self::FunctionCall { name, args } => Self::FunctionCall {
                name,
                args: args.into_iter().map(|a| a.transform(f)).collect(),
            },
            Self::Case {
                branches,
                otherwise,
            } => Self::Case {
                branches: branches
                    .into_iter()
                    .map(|b| CaseBranch {
                        when: b.when.transform(f),
                        then: b.then.transform(f),
                    })
                    .collect(),
                otherwise: Box::new(otherwise.transform(f)),
            },
            Self::InList {
                expr,
                list,
                negated,
            } => Self::InList {
                expr: Box::new(expr.transform(f)),
                list: list.into_iter().map(|e| e.transform(f)).collect(),
                negated,
            },
            leaf => leaf,
        };
        f(rebuilt)
    }

    fn fmt_operand(&self, f: &mut std::fmt::Formatter<'_>, min: u8) -> std::fmt::Result {
        if self.precedence() < min {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::ColumnRef(name) => write!(f, "{}", column_display(name)),
            Self::BinaryOp { op, left, right } => {
                let prec = op.precedence();
                left.fmt_operand(f, prec)?;
                write!(f, " {op} ")?;
                right.fmt_operand(f, prec + 1)
            }
            Self::UnaryOp { op, operand } => {
                match op {
                    UnaryOp::Not => write!(f, "not ")?,
                    UnaryOp::Neg => write!(f, "-")?,
                }
                let wrap = operand.precedence() < UNARY
                    || (*op == UnaryOp::Neg
                        && matches!(
                            operand.as_ref(),
                            Self::Literal(
                                Value::Long(_) | Value::Real(_) | Value::Timespan(_)
                            ) | Self::UnaryOp { .. }
                        ));
                if wrap {
                    write!(f, "({operand})")
                } else {
                    write!(f, "{operand}")
                }
            }
            Self::FunctionCall { name, args } => {
                write!(f, "{name}(")?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Self::Case {
                branches,
                otherwise,
            } => {
                write!(f, "case(")?;
                for branch in branches {
                    write!(f, "{}, {}, ", branch.when, branch.then)?;
                }
                write!(f, "{otherwise})")
            }
            Self::InList {
                expr,
                list,
                negated,
            } => {
                expr.fmt_operand(f, 3)?;
                write!(f, " {} (", if *negated { "!in" } else { "in" })?;
                write_list(f, list)?;
                write!(f, ")")
            }
        }
    }
}

fn write_list<T: std::fmt::Display>(f: &mut std::fmt::Formatter<'_>, items: &[T]) -> std::fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Renders a name as a KQL identifier, bracket-quoting it when it is not a
/// plain identifier or collides with a keyword.
#[must_use]
pub fn identifier_display(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_alphanumeric() || c == '_')
        && Keyword::from_word(name).is_none();
    if plain {
        name.to_string()
    } else {
        let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
        format!("['{escaped}']")
    }
}

fn column_display(name: &str) -> String {
    for side in ["$left.", "$right."] {
        if let Some(rest) = name.strip_prefix(side) {
            return format!("{side}{}", identifier_display(rest));
        }
    }
    identifier_display(name)
}

/// An output column of `project`, `extend` or `summarize`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectItem {
    /// Explicit name (`Name = expr`).
    pub alias: Option<String>,
    /// Defining expression.
    pub expr: Expr,
}

impl ProjectItem {
    /// An unnamed item.
    #[must_use]
    pub fn new(expr: Expr) -> Self {
        Self { alias: None, expr }
    }

    /// A named item.
    #[must_use]
    pub fn named(alias: impl Into<String>, expr: Expr) -> Self {
        Self {
            alias: Some(alias.into()),
            expr,
        }
    }

    /// A pass-through column.
    #[must_use]
    pub fn column(name: impl Into<String>) -> Self {
        Self::new(Expr::ColumnRef(name.into()))
    }

    /// Output names for a list of items, following KQL conventions: the
    /// alias, else the column name, else `<fn>_` / `<fn>_<Column>` for
    /// aggregates, else the bucketed column for `bin`, else `Column<N>`.
    #[must_use]
    pub fn output_names(items: &[Self]) -> Vec<String> {
        let mut unnamed = 0;
        items
            .iter()
            .map(|item| {
                item.alias
                    .clone()
                    .or_else(|| derived_name(&item.expr))
                    .unwrap_or_else(|| {
                        unnamed += 1;
                        format!("Column{unnamed}")
                    })
            })
            .collect()
    }
}

fn derived_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::ColumnRef(name) => Some(name.clone()),
        Expr::FunctionCall { name, args } if is_builtin_aggregate(name) => {
            match args.first().and_then(Expr::as_column) {
                Some(column) => Some(format!("{name}_{column}")),
                None => Some(format!("{name}_")),
            }
        }
        Expr::FunctionCall { name, args } if name == "bin" || name == "floor" => {
            args.first().and_then(Expr::as_column).map(str::to_string)
        }
        _ => None,
    }
}

impl std::fmt::Display for ProjectItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} = {}", identifier_display(alias), self.expr),
            None => write!(f, "{}", self.expr),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending (KQL default).
    #[default]
    Desc,
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}

/// A sort key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortKey {
    /// Sort expression.
    pub expr: Expr,
    /// Direction.
    pub order: SortOrder,
}

impl SortKey {
    /// Creates a sort key.
    #[must_use]
    pub fn new(expr: Expr, order: SortOrder) -> Self {
        Self { expr, order }
    }
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.expr, self.order)
    }
}

/// Join flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    /// Matching rows only.
    Inner,
    /// All left rows.
    Left,
    /// All right rows.
    Right,
    /// All rows from both sides.
    Full,
}

impl std::fmt::Display for JoinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inner => write!(f, "inner"),
            Self::Left => write!(f, "leftouter"),
            Self::Right => write!(f, "rightouter"),
            Self::Full => write!(f, "fullouter"),
        }
    }
}

/// Union flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnionKind {
    /// Keep duplicates.
    #[default]
    All,
    /// Remove duplicate rows.
    Distinct,
}

impl std::fmt::Display for UnionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Distinct => write!(f, "distinct"),
        }
    }
}

/// A tabular input: a named table or a parenthesized subquery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableExpression {
    /// Catalog table.
    Table {
        /// Table name.
        name: String,
        /// Optional alias.
        alias: Option<String>,
    },
    /// Nested query.
    Subquery {
        /// Inner query.
        query: Box<Query>,
        /// Optional alias.
        alias: Option<String>,
    },
}

impl TableExpression {
    /// A table reference without alias.
    #[must_use]
    pub fn table(name: impl Into<String>) -> Self {
        Self::Table {
            name: name.into(),
            alias: None,
        }
    }

    /// The alias, if any.
    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        match self {
            Self::Table { alias, .. } | Self::Subquery { alias, .. } => alias.as_deref(),
        }
    }
}

impl std::fmt::Display for TableExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table { name, .. } => write!(f, "{}", identifier_display(name))?,
            Self::Subquery { query, .. } => write!(f, "({query})")?,
        }
        if let Some(alias) = self.alias() {
            write!(f, " as {}", identifier_display(alias))?;
        }
        Ok(())
    }
}

/// A pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Row filter.
    Where(Expr),
    /// Column selection and computation; output is exactly these items.
    Project(Vec<ProjectItem>),
    /// Adds (or replaces) computed columns.
    Extend(Vec<ProjectItem>),
    /// Grouped aggregation.
    Summarize {
        /// Aggregate outputs.
        aggregations: Vec<ProjectItem>,
        /// Grouping keys.
        group_by: Vec<ProjectItem>,
    },
    /// Sort.
    OrderBy(Vec<SortKey>),
    /// First `count` rows, optionally after sorting.
    Top {
        /// Row count.
        count: u64,
        /// Sort key.
        by: Option<SortKey>,
    },
    /// First N rows.
    Limit(u64),
    /// Distinct rows (`None`) or distinct combinations of the given columns.
    Distinct(Option<Vec<Expr>>),
    /// Join with another table expression.
    Join {
        /// Join flavour.
        kind: JoinKind,
        /// Right input.
        right: TableExpression,
        /// Join condition over `$left.X` / `$right.Y` references.
        on: Expr,
    },
    /// Concatenation with other inputs.
    Union {
        /// Union flavour.
        kind: UnionKind,
        /// Additional inputs.
        others: Vec<TableExpression>,
    },
}

impl Operation {
    /// Operator name as written in queries.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Where(_) => "where",
            Self::Project(_) => "project",
            Self::Extend(_) => "extend",
            Self::Summarize { .. } => "summarize",
            Self::OrderBy(_) => "order by",
            Self::Top { .. } => "top",
            Self::Limit(_) => "limit",
            Self::Distinct(_) => "distinct",
            Self::Join { .. } => "join",
            Self::Union { .. } => "union",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Where(expr) => write!(f, "where {expr}"),
            Self::Project(items) => {
                write!(f, "project ")?;
                write_list(f, items)
            }
            Self::Extend(items) => {
                write!(f, "extend ")?;
                write_list(f, items)
            }
            Self::Summarize {
                aggregations,
                group_by,
            } => {
                write!(f, "summarize")?;
                if !aggregations.is_empty() {
                    write!(f, " ")?;
                    write_list(f, aggregations)?;
                }
                if !group_by.is_empty() {
                    write!(f, " by ")?;
                    write_list(f, group_by)?;
                }
                Ok(())
            }
            Self::OrderBy(keys) => {
                write!(f, "order by ")?;
                write_list(f, keys)
            }
            Self::Top { count, by } => {
                write!(f, "top {count}")?;
                if let Some(key) = by {
                    write!(f, " by {key}")?;
                }
                Ok(())
            }
            Self::Limit(n) => write!(f, "limit {n}"),
            Self::Distinct(None) => write!(f, "distinct *"),
            Self::Distinct(Some(exprs)) => {
                write!(f, "distinct ")?;
                write_list(f, exprs)
            }
            Self::Join { kind, right, on } => {
                write!(f, "join kind={kind} {right} on {on}")
            }
            Self::Union { kind, others } => {
                write!(f, "union kind={kind} ")?;
                write_list(f, others)
            }
        }
    }
}

/// A parsed KQL query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    /// Input table expression.
    pub source: TableExpression,
    /// Pipeline stages, in order.
    pub pipeline: Vec<Operation>,
}

impl Query {
    /// Creates a query over a table with an empty pipeline.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            source: TableExpression::table(table),
            pipeline: Vec::new(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with(mut self, operation: Operation) -> Self {
        self.pipeline.push(operation);
        self
    }

    /// Appends a `where` stage.
    #[must_use]
    pub fn with_where(self, predicate: Expr) -> Self {
        self.with(Operation::Where(predicate))
    }

    /// Appends a `limit` stage.
    #[must_use]
    pub fn with_limit(self, limit: u64) -> Self {
        self.with(Operation::Limit(limit))
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)?;
        for op in &self.pipeline {
            write!(f, " | {op}")?;
        }
        Ok(())
    }
}
