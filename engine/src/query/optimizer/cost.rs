//! Heuristic cost model.
//!
//! Estimates how many rows each stage produces and how much work it takes.
//! The constants are tunable; they only steer filter reordering and the cost
//! reported by `explain`, never correctness.

use crate::query::ast::{BinaryOp, Expr, Operation, Query, TableExpression, UnaryOp};
use crate::models::Value;
use crate::schema::SchemaProvider;
use serde::Serialize;

/// Estimated output size and cumulative work of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Cost {
    /// Estimated output rows.
    pub rows: f64,
    /// Estimated work, in row-operations.
    pub cost: f64,
}

/// Selectivity and CPU constants.
#[derive(Debug, Clone, PartialEq)]
pub struct CostModel {
    /// Fraction of rows passing an equality test.
    pub equality_selectivity: f64,
    /// Fraction of rows passing a range comparison.
    pub range_selectivity: f64,
    /// Fraction of rows passing a substring or term match.
    pub string_match_selectivity: f64,
    /// Fraction of rows passing a regex match.
    pub regex_selectivity: f64,
    /// Fraction of rows passing any other predicate.
    pub default_selectivity: f64,
    /// Per-row cost of a comparison.
    pub comparison_cpu: f64,
    /// Per-row cost of a case-insensitive string predicate.
    pub string_match_cpu: f64,
    /// Per-row cost of a regex match.
    pub regex_cpu: f64,
    /// Per-row cost of a scalar function call.
    pub function_cpu: f64,
    /// Rows assumed for a table the catalog does not know.
    pub default_table_rows: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            equality_selectivity: 0.1,
            range_selectivity: 0.33,
            string_match_selectivity: 0.25,
            regex_selectivity: 0.25,
            default_selectivity: 0.5,
            comparison_cpu: 1.0,
            string_match_cpu: 5.0,
            regex_cpu: 20.0,
            function_cpu: 2.0,
            default_table_rows: 1_000_000.0,
        }
    }
}

impl CostModel {
    /// Estimated fraction of rows for which `predicate` holds.
    #[must_use]
    pub fn selectivity(&self, predicate: &Expr) -> f64 {
        let s = match predicate {
            Expr::Literal(Value::Bool(true)) => 1.0,
            Expr::Literal(_) => 0.0,
            Expr::BinaryOp { op, left, right } => match op {
                BinaryOp::And => self.selectivity(left) * self.selectivity(right),
                BinaryOp::Or => {
                    let (a, b) = (self.selectivity(left), self.selectivity(right));
                    a + b - a * b
                }
                BinaryOp::Eq | BinaryOp::EqTilde => self.equality_selectivity,
                BinaryOp::NotEq | BinaryOp::NotEqTilde => 1.0 - self.equality_selectivity,
                BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                    self.range_selectivity
                }
                BinaryOp::Contains | BinaryOp::Has | BinaryOp::StartsWith | BinaryOp::EndsWith => {
                    self.string_match_selectivity
                }
                BinaryOp::NotContains
                | BinaryOp::NotHas
                | BinaryOp::NotStartsWith
                | BinaryOp::NotEndsWith => 1.0 - self.string_match_selectivity,
                BinaryOp::MatchesRegex => self.regex_selectivity,
                _ => self.default_selectivity,
            },
            Expr::UnaryOp {
                op: UnaryOp::Not,
                operand,
            } => 1.0 - self.selectivity(operand),
            Expr::InList { list, negated, .. } => {
                #[allow(clippy::cast_precision_loss)]
                let hit = (list.len() as f64 * self.equality_selectivity).min(1.0);
                if *negated {
                    1.0 - hit
                } else {
                    hit
                }
            }
            _ => self.default_selectivity,
        };
        s.clamp(0.0, 1.0)
    }

    /// Estimated per-row cost of evaluating `expr`.
    #[must_use]
    pub fn cpu(&self, expr: &Expr) -> f64 {
        self.node_cpu(expr).max(self.comparison_cpu)
    }

    fn node_cpu(&self, expr: &Expr) -> f64 {
        let own = match expr {
            Expr::BinaryOp { op, .. } if op.is_string_match() => self.string_match_cpu,
            Expr::BinaryOp {
                op: BinaryOp::MatchesRegex,
                ..
            } => self.regex_cpu,
            Expr::BinaryOp { op, .. } if op.is_comparison() => self.comparison_cpu,
            Expr::InList { list, .. } => {
                #[allow(clippy::cast_precision_loss)]
                let n = list.len() as f64;
                self.comparison_cpu * n
            }
            Expr::FunctionCall { .. } => self.function_cpu,
            _ => 0.0,
        };
        own + expr
            .children()
            .into_iter()
            .map(|c| self.node_cpu(c))
            .sum::<f64>()
    }

    /// Total cost of applying filters in the given order to `rows` rows.
    #[must_use]
    pub fn filter_chain_cost(&self, predicates: &[&Expr], rows: f64) -> f64 {
        let mut remaining = rows;
        let mut cost = 0.0;
        for predicate in predicates {
            cost += remaining * self.cpu(predicate);
            remaining *= self.selectivity(predicate);
        }
        cost
    }

    /// Estimates a whole query, starting from catalog cardinalities.
    #[must_use]
    pub fn estimate(&self, query: &Query, schema: &dyn SchemaProvider) -> Cost {
        let mut acc = self.table(&query.source, schema);
        for operation in &query.pipeline {
            acc = self.operation(operation, acc, schema);
        }
        acc
    }

    fn table(&self, table: &TableExpression, schema: &dyn SchemaProvider) -> Cost {
        match table {
            TableExpression::Table { name, .. } => {
                #[allow(clippy::cast_precision_loss)]
                let rows = schema
                    .table(name)
                    .map_or(self.default_table_rows, |t| t.row_estimate as f64);
                Cost { rows, cost: rows }
            }
            TableExpression::Subquery { query, .. } => self.estimate(query, schema),
        }
    }

    fn operation(&self, operation: &Operation, input: Cost, schema: &dyn SchemaProvider) -> Cost {
        let Cost { rows, cost } = input;
        let log = |n: f64| (n.max(2.0)).log2();
        match operation {
            Operation::Where(predicate) => Cost {
                rows: rows * self.selectivity(predicate),
                cost: cost + rows * self.cpu(predicate),
            },
            Operation::Project(items) | Operation::Extend(items) => {
                let work: f64 = items.iter().map(|i| self.cpu(&i.expr)).sum();
                Cost {
                    rows,
                    cost: cost + rows * work * 0.1,
                }
            }
            Operation::Summarize {
                aggregations,
                group_by,
            } => {
                #[allow(clippy::cast_precision_loss)]
                let width = (aggregations.len() + group_by.len()) as f64;
                let groups = if group_by.is_empty() {
                    1.0
                } else {
                    (rows * 0.1).max(1.0)
                };
                Cost {
                    rows: groups,
                    cost: cost + rows * width.max(1.0),
                }
            }
            Operation::OrderBy(_) => Cost {
                rows,
                cost: cost + rows * log(rows),
            },
            Operation::Top { count, .. } => {
                #[allow(clippy::cast_precision_loss)]
                let n = *count as f64;
                Cost {
                    rows: rows.min(n),
                    cost: cost + rows * log(n + 1.0),
                }
            }
            Operation::Limit(count) => {
                #[allow(clippy::cast_precision_loss)]
                let n = *count as f64;
                Cost {
                    rows: rows.min(n),
                    cost,
                }
            }
            Operation::Distinct(_) => Cost {
                rows: (rows * 0.5).max(1.0_f64.min(rows)),
                cost: cost + rows,
            },
            Operation::Join { right, .. } => {
                let right = self.table(right, schema);
                Cost {
                    rows: rows.max(right.rows),
                    cost: cost + right.cost + rows + right.rows,
                }
            }
            Operation::Union { others, .. } => others.iter().fold(input, |acc, other| {
                let branch = self.table(other, schema);
                Cost {
                    rows: acc.rows + branch.rows,
                    cost: acc.cost + branch.cost,
                }
            }),
        }
    }
}
