//! Built-in function catalog.

use super::{FunctionSignature, ReturnKind};
use crate::models::ColumnType;

/// Names of the built-in aggregation functions.
pub const AGGREGATES: [&str; 7] = ["count", "countif", "sum", "avg", "min", "max", "dcount"];

/// Returns true if `name` is a built-in aggregation function.
#[must_use]
pub fn is_builtin_aggregate(name: &str) -> bool {
    AGGREGATES.contains(&name)
}

/// Returns the functions every catalog knows about.
///
/// `parse_json` is listed so that queries using it validate; it has no SQL
/// lowering.
#[must_use]
pub fn builtin_functions() -> Vec<FunctionSignature> {
    use ColumnType::{Bool, Datetime, Dynamic, Long, Real, String};
    use ReturnKind::{Fixed, SameAsArg};

    vec![
        // aggregates
        FunctionSignature::aggregate("count", 0, Some(0), Fixed(Long)),
        FunctionSignature::aggregate("countif", 1, Some(1), Fixed(Long)),
        FunctionSignature::aggregate("sum", 1, Some(1), SameAsArg(0)),
        FunctionSignature::aggregate("avg", 1, Some(1), Fixed(Real)),
        FunctionSignature::aggregate("min", 1, Some(1), SameAsArg(0)),
        FunctionSignature::aggregate("max", 1, Some(1), SameAsArg(0)),
        FunctionSignature::aggregate("dcount", 1, Some(1), Fixed(Long)),
        // strings
        FunctionSignature::scalar("tolower", 1, Some(1), Fixed(String)),
        FunctionSignature::scalar("toupper", 1, Some(1), Fixed(String)),
        FunctionSignature::scalar("strlen", 1, Some(1), Fixed(Long)),
        FunctionSignature::scalar("substring", 2, Some(3), Fixed(String)),
        FunctionSignature::scalar("strcat", 1, None, Fixed(String)),
        FunctionSignature::scalar("isempty", 1, Some(1), Fixed(Bool)),
        FunctionSignature::scalar("isnotempty", 1, Some(1), Fixed(Bool)),
        // time
        FunctionSignature::scalar("now", 0, Some(0), Fixed(Datetime)),
        FunctionSignature::scalar("ago", 1, Some(1), Fixed(Datetime)),
        FunctionSignature::scalar("startofday", 1, Some(1), Fixed(Datetime)),
        FunctionSignature::scalar("bin", 2, Some(2), SameAsArg(0)),
        FunctionSignature::scalar("floor", 2, Some(2), SameAsArg(0)),
        // math
        FunctionSignature::scalar("abs", 1, Some(1), SameAsArg(0)),
        FunctionSignature::scalar("round", 1, Some(2), Fixed(Real)),
        // nulls and conditionals
        FunctionSignature::scalar("isnull", 1, Some(1), Fixed(Bool)),
        FunctionSignature::scalar("isnotnull", 1, Some(1), Fixed(Bool)),
        FunctionSignature::scalar("iff", 3, Some(3), SameAsArg(1)),
        FunctionSignature::scalar("iif", 3, Some(3), SameAsArg(1)),
        FunctionSignature::scalar("coalesce", 1, None, SameAsArg(0)),
        // conversions
        FunctionSignature::scalar("tostring", 1, Some(1), Fixed(String)),
        FunctionSignature::scalar("tolong", 1, Some(1), Fixed(Long)),
        FunctionSignature::scalar("toint", 1, Some(1), Fixed(Long)),
        FunctionSignature::scalar("todouble", 1, Some(1), Fixed(Real)),
        FunctionSignature::scalar("toreal", 1, Some(1), Fixed(Real)),
        FunctionSignature::scalar("parse_json", 1, Some(1), Fixed(Dynamic)),
    ]
}
