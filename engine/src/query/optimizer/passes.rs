//! Rewrite passes.
//!
//! Every pass takes a query by reference and returns a new one together with
//! the number of rewrites it made. Nested queries (subquery sources, join and
//! union inputs) are rewritten too.

use super::cost::CostModel;
use crate::models::{ColumnInfo, Value};
use crate::query::ast::{
    BinaryOp, Expr, JoinKind, Operation, ProjectItem, Query, SortKey, TableExpression, UnaryOp,
};
use crate::query::eval::eval_constant;
use crate::query::validate::{distinct_names, validate};
use crate::schema::{is_builtin_aggregate, SchemaProvider};
use std::collections::BTreeSet;

/// Result of one pass.
pub(crate) struct Rewrite {
    pub query: Query,
    pub applied: usize,
}

/// Applies `pass` to every nested query of `query`.
fn rewrite_nested(query: &mut Query, pass: &dyn Fn(&Query) -> Rewrite) -> usize {
    let mut applied = 0;
    let mut visit = |table: &mut TableExpression| {
        if let TableExpression::Subquery { query, .. } = table {
            let rewrite = pass(query);
            **query = rewrite.query;
            applied += rewrite.applied;
        }
    };
    visit(&mut query.source);
    for operation in &mut query.pipeline {
        match operation {
            Operation::Join { right, .. } => visit(right),
            Operation::Union { others, .. } => others.iter_mut().for_each(&mut visit),
            _ => {}
        }
    }
    applied
}

/// Output columns of `source | pipeline`, if it validates.
fn columns_of(
    source: &TableExpression,
    pipeline: &[Operation],
    schema: &dyn SchemaProvider,
) -> Option<Vec<ColumnInfo>> {
    let query = Query {
        source: source.clone(),
        pipeline: pipeline.to_vec(),
    };
    validate(&query, schema).ok()
}

fn column_names(columns: &[ColumnInfo]) -> BTreeSet<String> {
    columns.iter().map(|c| c.name.clone()).collect()
}

/// True for a `project`/`extend` item that passes a column through unchanged.
fn is_passthrough(item: &ProjectItem) -> bool {
    match (&item.alias, &item.expr) {
        (None, Expr::ColumnRef(_)) => true,
        (Some(alias), Expr::ColumnRef(name)) => alias == name,
        _ => false,
    }
}

/// Gives `item` an explicit alias when its derived name would differ from
/// `name`. Positional names like `Column2` shift when neighbours go away.
fn pin_name(item: ProjectItem, name: &str) -> ProjectItem {
    if item.alias.is_some() {
        return item;
    }
    let derived = ProjectItem::output_names(std::slice::from_ref(&item));
    if derived.first().map(String::as_str) == Some(name) {
        item
    } else {
        ProjectItem::named(name, item.expr)
    }
}

/// Keeps the items flagged in `keep`, preserving their output names.
fn retain_items(items: &[ProjectItem], keep: &[bool]) -> Vec<ProjectItem> {
    let names = ProjectItem::output_names(items);
    items
        .iter()
        .zip(&names)
        .zip(keep)
        .filter(|(_, keep)| **keep)
        .map(|((item, name), _)| pin_name(item.clone(), name))
        .collect()
}

// ==================== Constant folding ====================

/// Folds literal-only sub-expressions and simplifies boolean identities.
pub(crate) fn constant_folding(query: &Query) -> Rewrite {
    let mut out = query.clone();
    let mut applied = 0;
    for operation in &mut out.pipeline {
        let folded = fold_operation(operation.clone());
        if folded != *operation {
            *operation = folded;
            applied += 1;
        }
    }
    applied += rewrite_nested(&mut out, &constant_folding);
    Rewrite {
        query: out,
        applied,
    }
}

fn fold_items(items: Vec<ProjectItem>) -> Vec<ProjectItem> {
    let names = ProjectItem::output_names(&items);
    items
        .into_iter()
        .zip(names)
        .map(|(item, name)| {
            let folded = ProjectItem {
                alias: item.alias,
                expr: fold(item.expr),
            };
            pin_name(folded, &name)
        })
        .collect()
}

fn fold_key(key: SortKey) -> SortKey {
    SortKey::new(fold(key.expr), key.order)
}

fn fold_operation(operation: Operation) -> Operation {
    match operation {
        Operation::Where(e) => Operation::Where(fold(e)),
        Operation::Project(items) => Operation::Project(fold_items(items)),
        Operation::Extend(items) => Operation::Extend(fold_items(items)),
        Operation::Summarize {
            aggregations,
            group_by,
        } => Operation::Summarize {
            aggregations: fold_items(aggregations),
            group_by: fold_items(group_by),
        },
        Operation::OrderBy(keys) => Operation::OrderBy(keys.into_iter().map(fold_key).collect()),
        Operation::Top { count, by } => Operation::Top {
            count,
            by: by.map(fold_key),
        },
        Operation::Join { kind, right, on } => Operation::Join {
            kind,
            right,
            on: fold(on),
        },
        other => other,
    }
}

/// Folds one expression bottom-up.
pub(crate) fn fold(expr: Expr) -> Expr {
    expr.transform(&fold_node)
}

fn fold_node(expr: Expr) -> Expr {
    if let Some(simplified) = simplify(&expr) {
        return simplified;
    }
    if !is_foldable(&expr) {
        return expr;
    }
    match eval_constant(&expr) {
        Ok(Value::Real(r)) if !r.is_finite() => expr,
        Ok(value) => Expr::Literal(value),
        Err(_) => expr,
    }
}

/// A node whose operands are all literals and whose value does not depend on
/// when it is evaluated.
fn is_foldable(expr: &Expr) -> bool {
    let volatile = matches!(
        expr,
        Expr::FunctionCall { name, .. }
            if name == "now" || name == "ago" || is_builtin_aggregate(name)
    );
    !volatile
        && !matches!(expr, Expr::Literal(_) | Expr::ColumnRef(_))
        && expr
            .children()
            .iter()
            .all(|c| matches!(c, Expr::Literal(_)))
}

/// Expressions that always produce a boolean or null.
fn is_predicate(expr: &Expr) -> bool {
    match expr {
        Expr::BinaryOp { op, .. } => op.precedence() <= 3,
        Expr::UnaryOp {
            op: UnaryOp::Not, ..
        }
        | Expr::InList { .. } => true,
        Expr::Literal(v) => matches!(v, Value::Bool(_) | Value::Null),
        _ => false,
    }
}

fn simplify(expr: &Expr) -> Option<Expr> {
    let lit_bool = |e: &Expr| match e {
        Expr::Literal(Value::Bool(b)) => Some(*b),
        _ => None,
    };
    match expr {
        Expr::BinaryOp { op, left, right } if matches!(op, BinaryOp::And | BinaryOp::Or) => {
            let is_and = *op == BinaryOp::And;
            match (lit_bool(left), lit_bool(right)) {
                // false and x, true or x; x must still run when it can fail
                (Some(b), _) if b != is_and => (!may_fail(right)).then(|| Expr::literal(b)),
                (_, Some(b)) if b != is_and => (!may_fail(left)).then(|| Expr::literal(b)),
                // true and x, false or x
                (Some(_), _) if is_predicate(right) => Some((**right).clone()),
                (_, Some(_)) if is_predicate(left) => Some((**left).clone()),
                _ => None,
            }
        }
        Expr::UnaryOp {
            op: UnaryOp::Not,
            operand,
        } => match operand.as_ref() {
            Expr::UnaryOp {
                op: UnaryOp::Not,
                operand: inner,
            } if is_predicate(inner) => Some((**inner).clone()),
            _ => None,
        },
        Expr::Case {
            branches,
            otherwise,
        } => {
            let live: Vec<_> = branches
                .iter()
                .filter(|b| !matches!(&b.when, Expr::Literal(v) if !v.is_true()))
                .collect();
            match live.first() {
                None => Some((**otherwise).clone()),
                Some(first) if lit_bool(&first.when) == Some(true) => Some(first.then.clone()),
                _ if live.len() < branches.len() => Some(Expr::Case {
                    branches: live.into_iter().cloned().collect(),
                    otherwise: otherwise.clone(),
                }),
                _ => None,
            }
        }
        Expr::FunctionCall { name, args }
            if (name == "iff" || name == "iif") && args.len() == 3 =>
        {
            match &args[0] {
                Expr::Literal(v) if v.is_true() => Some(args[1].clone()),
                Expr::Literal(_) => Some(args[2].clone()),
                _ => None,
            }
        }
        _ => None,
    }
}

// ==================== Predicate pushdown ====================

/// Moves `where` stages toward the source.
pub(crate) fn predicate_pushdown(query: &Query, schema: &dyn SchemaProvider) -> Rewrite {
    let mut out = query.clone();
    let mut applied = 0;
    for i in 1..out.pipeline.len() {
        let mut at = i;
        while at > 0 && push_past(&mut out, at, schema) {
            applied += 1;
            at -= 1;
        }
    }
    applied += rewrite_nested(&mut out, &|q| predicate_pushdown(q, schema));
    Rewrite {
        query: out,
        applied,
    }
}

/// Whether a filter reading `used` commutes with the stage at `at - 1`.
fn can_push_past(
    query: &Query,
    at: usize,
    used: &BTreeSet<String>,
    schema: &dyn SchemaProvider,
) -> bool {
    let provides = |table: &TableExpression, pipeline: &[Operation]| {
        columns_of(table, pipeline, schema).is_some_and(|cols| used.is_subset(&column_names(&cols)))
    };
    match &query.pipeline[at - 1] {
        Operation::Project(items) => {
            let names = ProjectItem::output_names(items);
            used.iter().all(|c| {
                items
                    .iter()
                    .zip(&names)
                    .any(|(item, name)| name == c && is_passthrough(item))
            })
        }
        Operation::Extend(items) => {
            let defined = ProjectItem::output_names(items);
            !used.iter().any(|c| defined.contains(c))
        }
        Operation::OrderBy(_) | Operation::Distinct(None) => true,
        Operation::Distinct(Some(exprs)) => {
            let names = distinct_names(exprs);
            used.iter().all(|c| {
                exprs
                    .iter()
                    .zip(&names)
                    .any(|(e, name)| name == c && e.as_column() == Some(c.as_str()))
            })
        }
        Operation::Join { kind, .. } => {
            matches!(kind, JoinKind::Inner | JoinKind::Left)
                && provides(&query.source, &query.pipeline[..at - 1])
        }
        Operation::Union { others, .. } => {
            provides(&query.source, &query.pipeline[..at - 1])
                && others.iter().all(|other| provides(other, &[]))
        }
        Operation::Where(_)
        | Operation::Summarize { .. }
        | Operation::Top { .. }
        | Operation::Limit(_) => false,
    }
}

/// Tries to move the `where` at `at` before the stage at `at - 1`.
fn push_past(query: &mut Query, at: usize, schema: &dyn SchemaProvider) -> bool {
    let Operation::Where(predicate) = &query.pipeline[at] else {
        return false;
    };
    let predicate = predicate.clone();
    if !can_push_past(query, at, &predicate.columns(), schema) {
        return false;
    }

    let filter = query.pipeline.remove(at);
    if let Operation::Union { others, .. } = &mut query.pipeline[at - 1] {
        for other in others.iter_mut() {
            *other = with_filter(other.clone(), predicate.clone());
        }
    }
    query.pipeline.insert(at - 1, filter);
    true
}

/// Appends a filter to a union input.
fn with_filter(table: TableExpression, predicate: Expr) -> TableExpression {
    match table {
        TableExpression::Table { name, alias } => TableExpression::Subquery {
            query: Box::new(Query::new(name).with_where(predicate)),
            alias,
        },
        TableExpression::Subquery { query, alias } => TableExpression::Subquery {
            query: Box::new(query.with_where(predicate)),
            alias,
        },
    }
}

// ==================== Projection pushdown ====================

/// Columns read by the rest of the pipeline.
#[derive(Debug, Clone)]
enum Needed {
    All,
    Some(BTreeSet<String>),
}

impl Needed {
    fn add(&mut self, columns: BTreeSet<String>) {
        if let Self::Some(set) = self {
            set.extend(columns);
        }
    }

    fn remove(&mut self, name: &str) {
        if let Self::Some(set) = self {
            set.remove(name);
        }
    }

    fn contains(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Some(set) => set.contains(name),
        }
    }
}

fn item_columns(items: &[ProjectItem]) -> BTreeSet<String> {
    items.iter().flat_map(|i| i.expr.columns()).collect()
}

/// Drops computed columns nobody reads and narrows the source scan.
pub(crate) fn projection_pushdown(query: &Query, schema: &dyn SchemaProvider) -> Rewrite {
    let mut out = query.clone();
    let mut applied = 0;
    let mut needed = Needed::All;

    for operation in out.pipeline.iter_mut().rev() {
        needed = match operation {
            Operation::Project(items) => {
                let names = ProjectItem::output_names(items);
                let mut keep: Vec<bool> = names.iter().map(|n| needed.contains(n)).collect();
                if !keep.contains(&true) {
                    if let Some(first) = keep.first_mut() {
                        *first = true;
                    }
                }
                if keep.contains(&false) {
                    *items = retain_items(items, &keep);
                    applied += 1;
                }
                Needed::Some(item_columns(items))
            }
            Operation::Extend(items) => {
                // later items may read earlier ones, so walk backwards
                let names = ProjectItem::output_names(items);
                let mut keep = vec![true; items.len()];
                let mut need = needed.clone();
                for i in (0..items.len()).rev() {
                    if need.contains(&names[i]) {
                        need.remove(&names[i]);
                        need.add(items[i].expr.columns());
                    } else {
                        keep[i] = false;
                    }
                }
                if keep.contains(&false) {
                    *items = retain_items(items, &keep);
                    applied += 1;
                }
                need
            }
            Operation::Where(predicate) => {
                needed.add(predicate.columns());
                needed
            }
            Operation::OrderBy(keys) => {
                for key in keys.iter() {
                    needed.add(key.expr.columns());
                }
                needed
            }
            Operation::Top { by, .. } => {
                if let Some(key) = by {
                    needed.add(key.expr.columns());
                }
                needed
            }
            Operation::Limit(_) => needed,
            Operation::Distinct(Some(exprs)) => {
                Needed::Some(exprs.iter().flat_map(Expr::columns).collect())
            }
            Operation::Summarize {
                aggregations,
                group_by,
            } => {
                let names = ProjectItem::output_names(aggregations);
                let keep: Vec<bool> = names.iter().map(|n| needed.contains(n)).collect();
                let kept = keep.iter().filter(|k| **k).count();
                if kept < aggregations.len() && (kept > 0 || !group_by.is_empty()) {
                    *aggregations = retain_items(aggregations, &keep);
                    applied += 1;
                }
                let mut columns = item_columns(aggregations);
                columns.extend(item_columns(group_by));
                Needed::Some(columns)
            }
            Operation::Distinct(None) | Operation::Join { .. } | Operation::Union { .. } => {
                Needed::All
            }
        };
    }

    if let Needed::Some(set) = needed {
        if narrow_source(&mut out, &set, schema) {
            applied += 1;
        }
    }
    applied += rewrite_nested(&mut out, &|q| projection_pushdown(q, schema));
    Rewrite {
        query: out,
        applied,
    }
}

/// Inserts a narrowing `project` after the leading filters when the rest of
/// the pipeline reads fewer columns than the source table has.
fn narrow_source(query: &mut Query, needed: &BTreeSet<String>, schema: &dyn SchemaProvider) -> bool {
    let TableExpression::Table { name, .. } = &query.source else {
        return false;
    };
    let Some(table) = schema.table(name) else {
        return false;
    };
    let position = query
        .pipeline
        .iter()
        .position(|op| !matches!(op, Operation::Where(_)))
        .unwrap_or(query.pipeline.len());
    if matches!(query.pipeline.get(position), Some(Operation::Project(_)) | None) {
        return false;
    }

    let keep: Vec<ProjectItem> = table
        .columns
        .iter()
        .filter(|c| needed.contains(&c.name))
        .map(|c| ProjectItem::column(c.name.clone()))
        .collect();
    if keep.is_empty() || keep.len() >= table.columns.len() {
        return false;
    }
    query.pipeline.insert(position, Operation::Project(keep));
    true
}

// ==================== Dead-operation elimination ====================

enum Action {
    Remove,
    /// Replace the previous stage and drop this one.
    MergeIntoPrevious(Operation),
}

/// Removes stages that cannot change the result and merges row limits.
pub(crate) fn dead_operation_elimination(query: &Query, schema: &dyn SchemaProvider) -> Rewrite {
    let mut out = query.clone();
    let mut applied = 0;
    let mut i = 0;
    while i < out.pipeline.len() {
        let Some(action) = eliminate(&out, i, schema) else {
            i += 1;
            continue;
        };
        match action {
            Action::Remove => {
                out.pipeline.remove(i);
            }
            Action::MergeIntoPrevious(merged) => {
                out.pipeline[i - 1] = merged;
                out.pipeline.remove(i);
            }
        }
        applied += 1;
        // the neighbour may now be removable too
        i = i.saturating_sub(1);
    }
    applied += rewrite_nested(&mut out, &|q| dead_operation_elimination(q, schema));
    Rewrite {
        query: out,
        applied,
    }
}

fn eliminate(query: &Query, i: usize, schema: &dyn SchemaProvider) -> Option<Action> {
    let pipeline = &query.pipeline;
    let next = pipeline.get(i + 1);
    let previous = i.checked_sub(1).map(|p| &pipeline[p]);

    match &pipeline[i] {
        Operation::Where(Expr::Literal(Value::Bool(true))) => Some(Action::Remove),
        Operation::Extend(items) if items.is_empty() => Some(Action::Remove),
        Operation::Distinct(None) if already_distinct(&pipeline[..i]) => Some(Action::Remove),
        Operation::Project(items) if items.iter().all(is_passthrough) => {
            let input = columns_of(&query.source, &pipeline[..i], schema)?;
            let names = ProjectItem::output_names(items);
            let identity = input.len() == names.len()
                && input.iter().zip(&names).all(|(c, n)| c.name == *n);
            identity.then_some(Action::Remove)
        }
        Operation::OrderBy(keys) => match next {
            Some(Operation::Summarize { .. } | Operation::Distinct(_)) => Some(Action::Remove),
            Some(Operation::OrderBy(later)) if later.starts_with(keys) => Some(Action::Remove),
            Some(Operation::Top { by: Some(key), .. })
                if keys.as_slice() == std::slice::from_ref(key) =>
            {
                Some(Action::Remove)
            }
            _ => None,
        },
        Operation::Limit(n) => match previous {
            Some(Operation::Limit(m)) => Some(Action::MergeIntoPrevious(Operation::Limit((*m).min(*n)))),
            Some(Operation::Top { count, by }) => Some(Action::MergeIntoPrevious(Operation::Top {
                count: (*count).min(*n),
                by: by.clone(),
            })),
            _ => None,
        },
        Operation::Top { count, by: None } => match previous {
            Some(Operation::Limit(m)) => {
                Some(Action::MergeIntoPrevious(Operation::Limit((*m).min(*count))))
            }
            _ => None,
        },
        _ => None,
    }
}

/// True when the stages before this point already produce unique rows.
fn already_distinct(before: &[Operation]) -> bool {
    for op in before.iter().rev() {
        match op {
            Operation::Where(_)
            | Operation::OrderBy(_)
            | Operation::Top { .. }
            | Operation::Limit(_) => {}
            Operation::Distinct(_) | Operation::Summarize { .. } => return true,
            _ => return false,
        }
    }
    false
}

// ==================== Stage reordering ====================

/// Reorders runs of adjacent `where` stages cheapest-first.
pub(crate) fn stage_reordering(query: &Query, model: &CostModel) -> Rewrite {
    let mut out = query.clone();
    let mut applied = 0;
    let mut start = 0;
    while start < out.pipeline.len() {
        let end = out.pipeline[start..]
            .iter()
            .position(|op| !matches!(op, Operation::Where(_)))
            .map_or(out.pipeline.len(), |offset| start + offset);
        if end - start >= 2 && reorder_run(&mut out.pipeline[start..end], model) {
            applied += 1;
        }
        start = end + 1;
    }
    applied += rewrite_nested(&mut out, &|q| stage_reordering(q, model));
    Rewrite {
        query: out,
        applied,
    }
}

/// Division can fail on rows an earlier filter would have dropped.
fn may_fail(expr: &Expr) -> bool {
    expr.any(&|e| {
        matches!(
            e,
            Expr::BinaryOp {
                op: BinaryOp::Div | BinaryOp::Mod,
                ..
            }
        )
    })
}

fn reorder_run(run: &mut [Operation], model: &CostModel) -> bool {
    let predicates: Vec<Expr> = run
        .iter()
        .filter_map(|op| match op {
            Operation::Where(p) => Some(p.clone()),
            _ => None,
        })
        .collect();
    if predicates.iter().any(may_fail) {
        return false;
    }

    // rank = cpu / (1 - selectivity); lower runs first
    let rank = |p: &Expr| {
        let reject = (1.0 - model.selectivity(p)).max(f64::EPSILON);
        model.cpu(p) / reject
    };
    let mut ordered = predicates.clone();
    ordered.sort_by(|a, b| rank(a).total_cmp(&rank(b)));

    let before = model.filter_chain_cost(&predicates.iter().collect::<Vec<_>>(), 1.0);
    let after = model.filter_chain_cost(&ordered.iter().collect::<Vec<_>>(), 1.0);
    if after + 1e-12 >= before {
        return false;
    }
    for (slot, predicate) in run.iter_mut().zip(ordered) {
        *slot = Operation::Where(predicate);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse_query;
    use crate::testing::security_catalog;

    fn parse(text: &str) -> Query {
        parse_query(text).unwrap()
    }

    fn stages(query: &Query) -> Vec<String> {
        query.pipeline.iter().map(ToString::to_string).collect()
    }

    // ========================================================================
    // Constant folding
    // ========================================================================

    #[test]
    fn test_fold_arithmetic() {
        let rewrite = constant_folding(&parse("SecurityEvent | where EventID == 4000 + 625"));
        assert_eq!(stages(&rewrite.query), vec!["where EventID == 4625"]);
        assert_eq!(rewrite.applied, 1);
    }

    #[test]
    fn test_fold_leaves_time_relative_calls() {
        let query = parse("SecurityEvent | where TimeGenerated > ago(1h)");
        let rewrite = constant_folding(&query);
        assert_eq!(rewrite.query, query);
        assert_eq!(rewrite.applied, 0);
    }

    #[test]
    fn test_boolean_identities() {
        let rewrite = constant_folding(&parse(
            "SecurityEvent | where true and EventID == 1 | where EventID == 2 and false",
        ));
        assert_eq!(stages(&rewrite.query), vec!["where EventID == 1", "where false"]);
    }

    #[test]
    fn test_absorbing_literal_keeps_failing_operand() {
        let query = parse("SecurityEvent | where EventID / 0 == 1 and false | where true or EventID % 0 == 1");
        assert_eq!(constant_folding(&query).query, query);

        let rewrite = constant_folding(&parse("SecurityEvent | where EventID * 2 == 1 and false"));
        assert_eq!(stages(&rewrite.query), vec!["where false"]);
    }

    #[test]
    fn test_identity_needs_boolean_operand() {
        // `true and Account` is not the same as `Account`
        let query = parse("SecurityEvent | where true and Account");
        assert_eq!(constant_folding(&query).query, query);
    }

    #[test]
    fn test_fold_pins_positional_name() {
        let rewrite = constant_folding(&parse("SecurityEvent | project iff(true, Account, \"x\")"));
        assert_eq!(stages(&rewrite.query), vec!["project Column1 = Account"]);
    }

    #[test]
    fn test_fold_skips_errors() {
        let query = parse("SecurityEvent | where EventID == 1 / 0");
        assert_eq!(constant_folding(&query).query, query);
    }

    #[test]
    fn test_nested_queries_rewritten() {
        let rewrite = constant_folding(&parse("(SecurityEvent | where EventID == 2 * 2) | take 1"));
        assert_eq!(
            rewrite.query.to_string(),
            "(SecurityEvent | where EventID == 4) | limit 1"
        );
        assert_eq!(rewrite.applied, 1);
    }

    // ========================================================================
    // Predicate pushdown
    // ========================================================================

    #[test]
    fn test_where_moves_before_project() {
        let schema = security_catalog();
        let rewrite = predicate_pushdown(
            &parse("SecurityEvent | project Account, EventID | where EventID == 4625"),
            &schema,
        );
        assert_eq!(
            stages(&rewrite.query),
            vec!["where EventID == 4625", "project Account, EventID"]
        );
        assert_eq!(rewrite.applied, 1);
    }

    #[test]
    fn test_where_stays_after_computed_column() {
        let schema = security_catalog();
        let query = parse("SecurityEvent | extend Next = EventID + 1 | where Next > 5");
        assert_eq!(predicate_pushdown(&query, &schema).query, query);

        let query = parse("SecurityEvent | project Id = EventID | where Id > 5");
        assert_eq!(predicate_pushdown(&query, &schema).query, query);
    }

    #[test]
    fn test_where_never_crosses_summarize() {
        let schema = security_catalog();
        let query =
            parse("SecurityEvent | summarize n = count() by Account | where Account == \"alice\"");
        let rewrite = predicate_pushdown(&query, &schema);
        assert_eq!(rewrite.query, query);
        assert_eq!(rewrite.applied, 0);
    }

    #[test]
    fn test_where_moves_past_extend_and_sort() {
        let schema = security_catalog();
        let rewrite = predicate_pushdown(
            &parse(
                "SecurityEvent | extend L = tolower(Account) | order by EventID asc | where Computer == \"WS1\"",
            ),
            &schema,
        );
        assert_eq!(
            rewrite.query.pipeline[0].to_string(),
            "where Computer == \"WS1\""
        );
        assert_eq!(rewrite.applied, 2);
    }

    #[test]
    fn test_where_pushdown_across_join_sides() {
        let schema = security_catalog();
        let rewrite = predicate_pushdown(
            &parse("SecurityEvent | join kind=leftouter SigninLogs on Account | where EventID == 4625"),
            &schema,
        );
        assert!(matches!(rewrite.query.pipeline[0], Operation::Where(_)));

        // ResultType only exists on the right
        let query = parse("SecurityEvent | join SigninLogs on Account | where ResultType == 0");
        assert_eq!(predicate_pushdown(&query, &schema).query, query);

        let query =
            parse("SecurityEvent | join kind=rightouter SigninLogs on Account | where EventID == 1");
        assert_eq!(predicate_pushdown(&query, &schema).query, query);
    }

    #[test]
    fn test_where_pushed_into_union_inputs() {
        let schema = security_catalog();
        let rewrite = predicate_pushdown(
            &parse("SecurityEvent | union SigninLogs | where Account == \"alice\""),
            &schema,
        );
        assert_eq!(
            rewrite.query.to_string(),
            "SecurityEvent | where Account == \"alice\" | union kind=all (SigninLogs | where Account == \"alice\")"
        );
    }

    #[test]
    fn test_where_not_pushed_past_take() {
        let schema = security_catalog();
        let query = parse("SecurityEvent | take 3 | where EventID == 4625");
        assert_eq!(predicate_pushdown(&query, &schema).query, query);
    }

    // ========================================================================
    // Projection pushdown
    // ========================================================================

    #[test]
    fn test_unused_extend_dropped_and_source_narrowed() {
        let schema = security_catalog();
        let rewrite = projection_pushdown(
            &parse("SecurityEvent | extend A = EventID + 1, B = LogonType * 2 | project Account, A"),
            &schema,
        );
        assert_eq!(
            stages(&rewrite.query),
            vec![
                "project EventID, Account",
                "extend A = EventID + 1",
                "project Account, A",
            ]
        );
        assert_eq!(rewrite.applied, 2);
    }

    #[test]
    fn test_narrowing_goes_after_leading_filters() {
        let schema = security_catalog();
        let rewrite = projection_pushdown(
            &parse("SecurityEvent | where Computer == \"WS1\" | summarize count() by Account"),
            &schema,
        );
        assert_eq!(
            stages(&rewrite.query),
            vec![
                "where Computer == \"WS1\"",
                "project Account, Computer",
                "summarize count() by Account",
            ]
        );
    }

    #[test]
    fn test_unused_aggregation_dropped() {
        let schema = security_catalog();
        let rewrite = projection_pushdown(
            &parse(
                "SecurityEvent | summarize n = count(), m = max(EventID) by Account | project Account, n",
            ),
            &schema,
        );
        assert_eq!(
            rewrite.query.pipeline[1].to_string(),
            "summarize n = count() by Account"
        );
    }

    #[test]
    fn test_join_blocks_narrowing() {
        let schema = security_catalog();
        let query = parse("SecurityEvent | join SigninLogs on Account | project Account");
        assert_eq!(projection_pushdown(&query, &schema).query, query);
    }

    // ========================================================================
    // Dead-operation elimination
    // ========================================================================

    #[test]
    fn test_distinct_after_summarize_removed() {
        let schema = security_catalog();
        let rewrite = dead_operation_elimination(
            &parse("SecurityEvent | summarize count() by Account | distinct *"),
            &schema,
        );
        assert_eq!(stages(&rewrite.query), vec!["summarize count() by Account"]);
    }

    #[test]
    fn test_identity_project_removed() {
        let schema = security_catalog();
        let rewrite = dead_operation_elimination(
            &parse("SecurityEvent | project TimeGenerated, EventID, Account, Computer, IpAddress, LogonType, Activity | take 5"),
            &schema,
        );
        assert_eq!(stages(&rewrite.query), vec!["limit 5"]);

        // column order is observable
        let query = parse(
            "SecurityEvent | project EventID, TimeGenerated, Account, Computer, IpAddress, LogonType, Activity",
        );
        assert_eq!(dead_operation_elimination(&query, &schema).query, query);
    }

    #[test]
    fn test_limits_merge() {
        let schema = security_catalog();
        let rewrite = dead_operation_elimination(
            &parse("SecurityEvent | take 10 | take 5 | take 7 | where true"),
            &schema,
        );
        assert_eq!(stages(&rewrite.query), vec!["limit 5"]);
        assert_eq!(rewrite.applied, 3);

        let rewrite = dead_operation_elimination(
            &parse("SecurityEvent | top 10 by EventID desc | take 3"),
            &schema,
        );
        assert_eq!(stages(&rewrite.query), vec!["top 3 by EventID desc"]);
    }

    #[test]
    fn test_sort_before_aggregation_removed() {
        let schema = security_catalog();
        let rewrite = dead_operation_elimination(
            &parse("SecurityEvent | order by EventID asc | summarize count() by Account"),
            &schema,
        );
        assert_eq!(stages(&rewrite.query), vec!["summarize count() by Account"]);

        // the second sort relies on the first one for ties
        let query = parse("SecurityEvent | order by EventID asc | order by Account asc | take 2");
        assert_eq!(dead_operation_elimination(&query, &schema).query, query);
    }

    // ========================================================================
    // Stage reordering
    // ========================================================================

    #[test]
    fn test_cheap_filter_moves_first() {
        let model = CostModel::default();
        let rewrite = stage_reordering(
            &parse("SecurityEvent | where Activity matches regex \"fail.*\" | where EventID == 4625"),
            &model,
        );
        assert_eq!(
            stages(&rewrite.query),
            vec!["where EventID == 4625", "where Activity matches regex \"fail.*\""]
        );
        assert_eq!(rewrite.applied, 1);
    }

    #[test]
    fn test_already_ordered_run_untouched() {
        let model = CostModel::default();
        let query = parse("SecurityEvent | where EventID == 4625 | where Account contains \"al\"");
        let rewrite = stage_reordering(&query, &model);
        assert_eq!(rewrite.query, query);
        assert_eq!(rewrite.applied, 0);
    }

    #[test]
    fn test_division_blocks_reordering() {
        let model = CostModel::default();
        let query = parse(
            "SecurityEvent | where LogonType != 0 | where Activity matches regex \"x\" | where 10 / LogonType > 1",
        );
        assert_eq!(stage_reordering(&query, &model).query, query);
    }
}
