//! Property tests.
//!
//! Tests cover:
//! - Printing a parsed query and parsing it again gives the same AST
//! - Optimized pipelines return the same rows as the originals, including
//!   joins, unions and `top` over a key that is unique in the fixtures
//! - Generated SQL never contains string literals and is always scoped

use engine::query::{generate, optimize, parse_query, validate};
use proptest::prelude::*;

use super::common::{catalog, dataset, names, sorted_rows, ORG};

fn comparison() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::sample::select(vec![4624, 4625, 4634, 4688]).prop_map(|id| format!("EventID == {id}")),
        prop::sample::select(vec!["alice", "bob", "carol", "dave", "mallory"])
            .prop_map(|a| format!("Account == \"{a}\"")),
        (0..6_i64).prop_map(|n| format!("LogonType > {n}")),
        prop::sample::select(vec!["fail", "logged", "process"])
            .prop_map(|s| format!("Activity contains \"{s}\"")),
        prop::sample::select(vec!["ws", "SRV"]).prop_map(|s| format!("Computer startswith \"{s}\"")),
        Just("isnotnull(LogonType)".to_string()),
        (1..4_i64, 1..4_i64, 2..7_i64).prop_map(|(a, b, c)| format!("{a} + {b} == {c}")),
        Just("Account in (\"alice\", \"erin\")".to_string()),
    ]
}

fn predicate() -> impl Strategy<Value = String> {
    comparison().prop_recursive(2, 8, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("({a}) and ({b})")),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("({a}) or ({b})")),
            inner.prop_map(|a| format!("not ({a})")),
        ]
    })
}

/// Stages that keep every source column in scope.
fn middle_stage() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => predicate().prop_map(|p| format!("where {p}")),
        1 => (0..3_i64).prop_map(|k| format!("extend Shifted = EventID + {k}")),
        1 => prop::sample::select(vec!["TimeGenerated", "Account", "LogonType"])
            .prop_flat_map(|c| prop::bool::ANY.prop_map(move |asc| {
                format!("order by {c} {}", if asc { "asc" } else { "desc" })
            })),
    ]
}

/// A final stage that may change the shape of the result.
fn tail_stage() -> impl Strategy<Value = Option<String>> {
    prop::option::of(prop::sample::select(vec![
        "project Account, EventID",
        "project Computer, Lower = tolower(Account)",
        "summarize count() by Account",
        "summarize n = count(), m = max(LogonType) by Computer",
        "distinct Account",
        "distinct *",
    ]))
    .prop_map(|s| s.map(str::to_string))
}

fn source() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "SecurityEvent",
        "(SecurityEvent | where EventID != 4688)",
    ])
    .prop_map(str::to_string)
}

/// A join or union that keeps the left columns under their own names.
fn combine_stage() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "join kind=inner (SigninLogs) on Account",
        "join kind=leftouter (SigninLogs) on Account",
        "join kind=leftouter (SigninLogs | where ResultType == 0) on Account",
        "union SigninLogs",
        "union (SigninLogs | where Account != \"erin\")",
    ])
    .prop_map(str::to_string)
}

/// `top` by `TimeGenerated`, which no two fixture rows share even after a
/// join or union, so the rows kept never depend on tie-breaking.
fn top_stage() -> impl Strategy<Value = String> {
    (1..10_u64, prop::bool::ANY).prop_map(|(n, asc)| {
        format!("top {n} by TimeGenerated {}", if asc { "asc" } else { "desc" })
    })
}

fn query_text() -> impl Strategy<Value = String> {
    (
        source(),
        prop::collection::vec(middle_stage(), 0..3),
        prop::option::of(combine_stage()),
        prop::collection::vec(middle_stage(), 0..3),
        prop::option::of(top_stage()),
        tail_stage(),
    )
        .prop_map(|(source, before, combine, after, top, tail)| {
            let mut stages = vec![source];
            stages.extend(before);
            stages.extend(combine);
            stages.extend(after);
            stages.extend(top);
            stages.extend(tail);
            stages.join(" | ")
        })
}

/// Adds row-limiting stages, which only the round-trip property uses.
fn any_query_text() -> impl Strategy<Value = String> {
    (
        query_text(),
        prop::option::of(prop_oneof![
            (1..20_u64).prop_map(|n| format!("take {n}")),
            (1..20_u64).prop_map(|n| format!("top {n} by EventID desc")),
            Just("union SigninLogs".to_string()),
            Just("join kind=leftouter (SigninLogs) on Account".to_string()),
        ]),
    )
        .prop_map(|(text, extra)| match extra {
            Some(extra) => format!("{text} | {extra}"),
            None => text,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_display_round_trips(text in any_query_text()) {
        let query = parse_query(&text).unwrap();
        let printed = query.to_string();
        let reparsed = parse_query(&printed).unwrap();
        prop_assert_eq!(&reparsed, &query, "{} printed as {}", text, printed);
        prop_assert_eq!(reparsed.to_string(), printed);
    }

    #[test]
    fn prop_optimizer_preserves_results(text in query_text()) {
        let schema = catalog();
        let query = parse_query(&text).unwrap();
        prop_assume!(validate(&query, &schema).is_ok());

        let optimized = optimize(&query, &schema);
        let data = dataset();
        let before = data.evaluate(&query).unwrap();
        let after = data.evaluate(&optimized).unwrap();
        prop_assert_eq!(names(&before), names(&after), "{} => {}", text, optimized);
        prop_assert_eq!(sorted_rows(&before), sorted_rows(&after), "{} => {}", text, optimized);
    }

    #[test]
    fn prop_optimizer_is_idempotent(text in query_text()) {
        let schema = catalog();
        let once = optimize(&parse_query(&text).unwrap(), &schema);
        let twice = optimize(&once, &schema);
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn prop_sql_is_scoped_and_parameterized(text in any_query_text()) {
        let schema = catalog();
        let query = parse_query(&text).unwrap();
        prop_assume!(validate(&query, &schema).is_ok());

        let sql = generate(&optimize(&query, &schema), &schema, ORG).unwrap();
        prop_assert!(!sql.sql.contains('\''));
        let org = format!("org_id = ${}", sql.params.len());
        prop_assert!(sql.sql.matches(&org).count() >= 1);
        prop_assert_eq!(
            sql.sql.matches("org_id = ").count(),
            sql.sql.matches(&org).count()
        );
    }
}
