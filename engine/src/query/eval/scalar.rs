//! Scalar expression semantics: operators, built-in functions and aggregates.

use super::EvalError;
use crate::models::{ColumnInfo, Value};
use crate::query::ast::{BinaryOp, Expr, UnaryOp};
use crate::schema::is_builtin_aggregate;
use chrono::{DateTime, TimeDelta, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;

/// A row of named values.
#[derive(Clone, Copy)]
pub(crate) struct Frame<'r> {
    pub columns: &'r [ColumnInfo],
    pub values: &'r [Value],
}

const EMPTY_FRAME: Frame<'static> = Frame {
    columns: &[],
    values: &[],
};

impl Frame<'_> {
    fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.values.get(i))
    }
}

/// Name resolution for one row; join conditions also see both inputs.
#[derive(Clone, Copy)]
pub(crate) struct Env<'r> {
    pub current: Frame<'r>,
    pub left: Frame<'r>,
    pub right: Frame<'r>,
}

impl<'r> Env<'r> {
    pub fn row(columns: &'r [ColumnInfo], values: &'r [Value]) -> Self {
        Self {
            current: Frame { columns, values },
            left: EMPTY_FRAME,
            right: EMPTY_FRAME,
        }
    }

    pub fn empty() -> Self {
        Self::row(&[], &[])
    }

    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        let found = if let Some(rest) = name.strip_prefix("$left.") {
            self.left.get(rest)
        } else if let Some(rest) = name.strip_prefix("$right.") {
            self.right.get(rest)
        } else {
            self.current
                .get(name)
                .or_else(|| self.left.get(name))
                .or_else(|| self.right.get(name))
        };
        found
            .cloned()
            .ok_or_else(|| EvalError::UnknownColumn(name.to_string()))
    }
}

/// Evaluates an expression over one row.
pub(crate) fn eval(expr: &Expr, env: &Env<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::ColumnRef(name) => env.lookup(name),
        Expr::BinaryOp { op, left, right } => match op {
            BinaryOp::And | BinaryOp::Or => {
                let l = truth(&eval(left, env)?);
                // short-circuit where the result is already decided
                match (op, l) {
                    (BinaryOp::And, Some(false)) => return Ok(Value::Bool(false)),
                    (BinaryOp::Or, Some(true)) => return Ok(Value::Bool(true)),
                    _ => {}
                }
                let r = truth(&eval(right, env)?);
                Ok(logical(*op, l, r))
            }
            _ => binary(*op, &eval(left, env)?, &eval(right, env)?),
        },
        Expr::UnaryOp { op, operand } => unary(*op, eval(operand, env)?),
        Expr::FunctionCall { name, args } => {
            if is_builtin_aggregate(name) {
                return Err(EvalError::MisplacedAggregate(name.clone()));
            }
            let values = args
                .iter()
                .map(|a| eval(a, env))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values)
        }
        Expr::Case {
            branches,
            otherwise,
        } => {
            for branch in branches {
                if eval(&branch.when, env)?.is_true() {
                    return eval(&branch.then, env);
                }
            }
            eval(otherwise, env)
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = eval(expr, env)?;
            if needle.is_null() {
                return Ok(Value::Null);
            }
            let mut found = false;
            for item in list {
                if equals(&needle, &eval(item, env)?) == Some(true) {
                    found = true;
                    break;
                }
            }
            Ok(Value::Bool(found != *negated))
        }
    }
}

/// Evaluates an expression that references no columns.
///
/// # Errors
///
/// Returns an error if the expression references a column, calls an
/// aggregate, or an operator or function rejects its arguments.
pub fn eval_constant(expr: &Expr) -> Result<Value, EvalError> {
    eval(expr, &Env::empty())
}

/// Evaluates a `summarize` output over the rows of one group. Aggregate calls
/// are computed over the group; anything outside them sees the first row.
pub(crate) fn eval_aggregate(
    expr: &Expr,
    columns: &[ColumnInfo],
    rows: &[&[Value]],
) -> Result<Value, EvalError> {
    let mut calls = Vec::new();
    collect_aggregates(expr, &mut calls);

    let mut computed = Vec::with_capacity(calls.len());
    for call in calls {
        if let Expr::FunctionCall { name, args } = call {
            let value = aggregate(name, args, columns, rows)?;
            computed.push((call.clone(), value));
        }
    }

    let substituted = expr.clone().transform(&|node| {
        computed
            .iter()
            .find(|(call, _)| *call == node)
            .map_or(node, |(_, value)| Expr::Literal(value.clone()))
    });
    let first = rows.first().copied().unwrap_or(&[]);
    let env = if first.is_empty() {
        Env::empty()
    } else {
        Env::row(columns, first)
    };
    eval(&substituted, &env)
}

fn collect_aggregates<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::FunctionCall { name, .. } if is_builtin_aggregate(name) => out.push(expr),
        other => {
            for child in other.children() {
                collect_aggregates(child, out);
            }
        }
    }
}

fn aggregate(
    name: &str,
    args: &[Expr],
    columns: &[ColumnInfo],
    rows: &[&[Value]],
) -> Result<Value, EvalError> {
    let per_row = |arg: &Expr| -> Result<Vec<Value>, EvalError> {
        rows.iter()
            .map(|row| eval(arg, &Env::row(columns, row)))
            .collect()
    };
    let argument = || {
        args.first()
            .ok_or_else(|| EvalError::InvalidArguments(name.to_string()))
    };

    match name {
        "count" => Ok(Value::Long(len_i64(rows.len()))),
        "countif" => {
            let hits = per_row(argument()?)?.iter().filter(|v| v.is_true()).count();
            Ok(Value::Long(len_i64(hits)))
        }
        "sum" => sum(name, per_row(argument()?)?),
        "avg" => {
            let values = per_row(argument()?)?;
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                return Ok(Value::Null);
            }
            #[allow(clippy::cast_precision_loss)]
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            Ok(Value::Real(mean))
        }
        "min" | "max" => {
            let values = per_row(argument()?)?;
            let best = values.into_iter().filter(|v| !v.is_null()).reduce(|a, b| {
                let ord = a.sort_cmp(&b);
                let keep_a = if name == "min" {
                    ord != Ordering::Greater
                } else {
                    ord != Ordering::Less
                };
                if keep_a {
                    a
                } else {
                    b
                }
            });
            Ok(best.unwrap_or(Value::Null))
        }
        "dcount" => {
            let values = per_row(argument()?)?;
            let distinct: HashSet<String> = values
                .iter()
                .filter(|v| !v.is_null())
                .map(Value::group_key)
                .collect();
            Ok(Value::Long(len_i64(distinct.len())))
        }
        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

fn sum(name: &str, values: Vec<Value>) -> Result<Value, EvalError> {
    let mut total: Option<Value> = None;
    for value in values.into_iter().filter(|v| !v.is_null()) {
        total = Some(match total {
            None => value,
            Some(acc) => binary(BinaryOp::Add, &acc, &value)
                .map_err(|_| EvalError::InvalidArguments(name.to_string()))?,
        });
    }
    Ok(total.unwrap_or(Value::Null))
}

fn len_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

fn logical(op: BinaryOp, l: Option<bool>, r: Option<bool>) -> Value {
    let result = match (op, l, r) {
        (BinaryOp::And, Some(false), _) | (BinaryOp::And, _, Some(false)) => Some(false),
        (BinaryOp::And, Some(true), Some(true)) => Some(true),
        (BinaryOp::Or, Some(true), _) | (BinaryOp::Or, _, Some(true)) => Some(true),
        (BinaryOp::Or, Some(false), Some(false)) => Some(false),
        _ => None,
    };
    result.map_or(Value::Null, Value::Bool)
}

fn equals(a: &Value, b: &Value) -> Option<bool> {
    if a.is_null() || b.is_null() {
        return None;
    }
    Some(a.compare(b) == Some(Ordering::Equal))
}

/// Applies a binary operator other than `and` / `or`.
pub(crate) fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        return Ok(logical(op, truth(left), truth(right)));
    }
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    let text = |v: &Value| v.to_text().to_lowercase();
    let result = match op {
        BinaryOp::Eq => Value::Bool(left.compare(right) == Some(Ordering::Equal)),
        BinaryOp::NotEq => Value::Bool(left.compare(right) != Some(Ordering::Equal)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            match left.compare(right) {
                Some(ord) => Value::Bool(match op {
                    BinaryOp::Lt => ord == Ordering::Less,
                    BinaryOp::LtEq => ord != Ordering::Greater,
                    BinaryOp::Gt => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                }),
                None => Value::Null,
            }
        }
        BinaryOp::EqTilde => Value::Bool(text(left) == text(right)),
        BinaryOp::NotEqTilde => Value::Bool(text(left) != text(right)),
        BinaryOp::Contains => Value::Bool(text(left).contains(&text(right))),
        BinaryOp::NotContains => Value::Bool(!text(left).contains(&text(right))),
        BinaryOp::Has => Value::Bool(has_term(&text(left), &text(right))),
        BinaryOp::NotHas => Value::Bool(!has_term(&text(left), &text(right))),
        BinaryOp::StartsWith => Value::Bool(text(left).starts_with(&text(right))),
        BinaryOp::NotStartsWith => Value::Bool(!text(left).starts_with(&text(right))),
        BinaryOp::EndsWith => Value::Bool(text(left).ends_with(&text(right))),
        BinaryOp::NotEndsWith => Value::Bool(!text(left).ends_with(&text(right))),
        BinaryOp::MatchesRegex => {
            let pattern = regex::Regex::new(&right.to_text())
                .map_err(|e| EvalError::Regex(e.to_string()))?;
            Value::Bool(pattern.is_match(&left.to_text()))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, left, right)?
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    };
    Ok(result)
}

fn has_term(haystack: &str, term: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|t| t == term)
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let invalid = || EvalError::InvalidArguments(op.as_str().to_string());

    let result = match (left, right) {
        (Value::Long(a), Value::Long(b)) => match op {
            BinaryOp::Add => Value::Long(a.wrapping_add(*b)),
            BinaryOp::Sub => Value::Long(a.wrapping_sub(*b)),
            BinaryOp::Mul => Value::Long(a.wrapping_mul(*b)),
            BinaryOp::Div => Value::Long(a.checked_div(*b).ok_or(EvalError::DivisionByZero)?),
            _ => Value::Long(a.checked_rem(*b).ok_or(EvalError::DivisionByZero)?),
        },
        (Value::Long(_) | Value::Real(_), Value::Long(_) | Value::Real(_)) => {
            let (a, b) = (left.as_f64().ok_or_else(invalid)?, right.as_f64().ok_or_else(invalid)?);
            Value::Real(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            })
        }
        (Value::Datetime(a), Value::Datetime(b)) if op == BinaryOp::Sub => {
            Value::Timespan(a.signed_duration_since(*b))
        }
        (Value::Datetime(a), Value::Timespan(b)) => match op {
            BinaryOp::Add => Value::Datetime(a.checked_add_signed(*b).ok_or_else(invalid)?),
            BinaryOp::Sub => Value::Datetime(a.checked_sub_signed(*b).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        },
        (Value::Timespan(a), Value::Datetime(b)) if op == BinaryOp::Add => {
            Value::Datetime(b.checked_add_signed(*a).ok_or_else(invalid)?)
        }
        (Value::Timespan(a), Value::Timespan(b)) => match op {
            BinaryOp::Add => Value::Timespan(a.checked_add(b).ok_or_else(invalid)?),
            BinaryOp::Sub => Value::Timespan(a.checked_sub(b).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        },
        (Value::Timespan(ts), n) | (n, Value::Timespan(ts))
            if n.as_f64().is_some() && matches!(op, BinaryOp::Mul | BinaryOp::Div) =>
        {
            let factor = n.as_f64().ok_or_else(invalid)?;
            if matches!(right, Value::Timespan(_)) && op == BinaryOp::Div {
                return Err(invalid());
            }
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            let micros = ts.num_microseconds().ok_or_else(invalid)? as f64;
            let scaled = if op == BinaryOp::Mul {
                micros * factor
            } else {
                micros / factor
            };
            if !scaled.is_finite() {
                return Err(EvalError::DivisionByZero);
            }
            #[allow(clippy::cast_possible_truncation)]
            Value::Timespan(TimeDelta::microseconds(scaled as i64))
        }
        _ => return Err(invalid()),
    };
    Ok(result)
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, EvalError> {
    match (op, value) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Long(i)) => Ok(Value::Long(i.wrapping_neg())),
        (UnaryOp::Neg, Value::Real(r)) => Ok(Value::Real(-r)),
        (UnaryOp::Neg, Value::Timespan(ts)) => Ok(Value::Timespan(-ts)),
        (UnaryOp::Not, _) => Err(EvalError::InvalidArguments("not".to_string())),
        (UnaryOp::Neg, _) => Err(EvalError::InvalidArguments("-".to_string())),
    }
}

/// Calls a built-in scalar function.
fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let invalid = || EvalError::InvalidArguments(name.to_string());
    let arg = |i: usize| args.get(i).ok_or_else(invalid);

    let result = match name {
        "tolower" => map_text(arg(0)?, str::to_lowercase),
        "toupper" => map_text(arg(0)?, str::to_uppercase),
        "strlen" => match arg(0)? {
            Value::Null => Value::Null,
            v => Value::Long(len_i64(v.to_text().chars().count())),
        },
        "substring" => substring(args).ok_or_else(invalid)?,
        "strcat" => Value::String(args.iter().map(Value::to_text).collect()),
        "isempty" => Value::Bool(is_empty(arg(0)?)),
        "isnotempty" => Value::Bool(!is_empty(arg(0)?)),
        "now" => Value::Datetime(Utc::now()),
        "ago" => match arg(0)? {
            Value::Timespan(ts) => Value::Datetime(Utc::now() - *ts),
            _ => return Err(invalid()),
        },
        "startofday" => match arg(0)? {
            Value::Datetime(dt) => dt
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map_or(Value::Null, |d| Value::Datetime(d.and_utc())),
            Value::Null => Value::Null,
            _ => return Err(invalid()),
        },
        "bin" | "floor" => bin(arg(0)?, arg(1)?).ok_or_else(invalid)?,
        "abs" => match arg(0)? {
            Value::Long(i) => Value::Long(i.wrapping_abs()),
            Value::Real(r) => Value::Real(r.abs()),
            Value::Timespan(ts) => Value::Timespan(ts.abs()),
            Value::Null => Value::Null,
            _ => return Err(invalid()),
        },
        "round" => {
            let digits = match args.get(1) {
                Some(Value::Long(d)) => i32::try_from(*d).map_err(|_| invalid())?,
                None => 0,
                Some(_) => return Err(invalid()),
            };
            match arg(0)?.as_f64() {
                Some(x) => {
                    let scale = 10_f64.powi(digits);
                    Value::Real((x * scale).round() / scale)
                }
                None if arg(0)?.is_null() => Value::Null,
                None => return Err(invalid()),
            }
        }
        "isnull" => Value::Bool(arg(0)?.is_null()),
        "isnotnull" => Value::Bool(!arg(0)?.is_null()),
        "iff" | "iif" => {
            if arg(0)?.is_true() {
                arg(1)?.clone()
            } else {
                arg(2)?.clone()
            }
        }
        "coalesce" => args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null),
        "tostring" => match arg(0)? {
            Value::Null => Value::Null,
            v => Value::String(v.to_text()),
        },
        "tolong" | "toint" => to_long(arg(0)?),
        "todouble" | "toreal" => to_real(arg(0)?),
        "parse_json" => match arg(0)? {
            Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
                .map_or(Value::Null, |json| Value::String(json.to_string())),
            _ => Value::Null,
        },
        other => return Err(EvalError::UnknownFunction(other.to_string())),
    };
    Ok(result)
}

fn map_text(value: &Value, f: fn(&str) -> String) -> Value {
    match value {
        Value::Null => Value::Null,
        v => Value::String(f(&v.to_text())),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn substring(args: &[Value]) -> Option<Value> {
    let source = args.first()?;
    if source.is_null() {
        return Some(Value::Null);
    }
    let text: Vec<char> = source.to_text().chars().collect();
    let start = match args.get(1)? {
        Value::Long(i) => usize::try_from(*i).unwrap_or(0),
        _ => return None,
    };
    let len = match args.get(2) {
        Some(Value::Long(n)) => usize::try_from(*n).unwrap_or(0),
        Some(_) => return None,
        None => usize::MAX,
    };
    Some(Value::String(
        text.iter().skip(start).take(len).collect(),
    ))
}

/// Rounds down to a multiple of `size`.
fn bin(value: &Value, size: &Value) -> Option<Value> {
    match (value, size) {
        (Value::Null, _) => Some(Value::Null),
        (Value::Long(x), Value::Long(s)) if *s > 0 => Some(Value::Long(x.div_euclid(*s) * s)),
        (Value::Long(_) | Value::Real(_), Value::Long(_) | Value::Real(_)) => {
            let (x, s) = (value.as_f64()?, size.as_f64()?);
            (s > 0.0).then(|| Value::Real((x / s).floor() * s))
        }
        (Value::Datetime(dt), Value::Timespan(ts)) => {
            let step = ts.num_microseconds().filter(|s| *s > 0)?;
            let micros = dt.timestamp_micros();
            DateTime::from_timestamp_micros(micros.div_euclid(step) * step).map(Value::Datetime)
        }
        (Value::Timespan(x), Value::Timespan(ts)) => {
            let step = ts.num_microseconds().filter(|s| *s > 0)?;
            let micros = x.num_microseconds()?;
            Some(Value::Timespan(TimeDelta::microseconds(micros.div_euclid(step) * step)))
        }
        _ => None,
    }
}

fn to_long(value: &Value) -> Value {
    match value {
        Value::Long(i) => Value::Long(*i),
        #[allow(clippy::cast_possible_truncation)]
        Value::Real(r) if r.is_finite() => Value::Long(r.trunc() as i64),
        Value::Bool(b) => Value::Long(i64::from(*b)),
        Value::String(s) => s.trim().parse().map_or(Value::Null, Value::Long),
        _ => Value::Null,
    }
}

fn to_real(value: &Value) -> Value {
    match value {
        Value::Long(_) | Value::Real(_) => value.as_f64().map_or(Value::Null, Value::Real),
        Value::Bool(b) => Value::Real(f64::from(u8::from(*b))),
        Value::String(s) => s.trim().parse().map_or(Value::Null, Value::Real),
        _ => Value::Null,
    }
}
