//! Integration tests for the optimizer.
//!
//! Tests cover:
//! - Filters move below projections but never below aggregation
//! - Optimized pipelines return the same rows as the originals
//! - Pipelines that fail at runtime still fail once optimized
//! - Disabled passes leave the query alone

use engine::config::OptimizerConfig;
use engine::query::{optimize, parse_query, Operation, Optimizer, Pass};

use super::common::{catalog, dataset, names, sorted_rows};

fn optimized(text: &str) -> String {
    optimize(&parse_query(text).unwrap(), &catalog()).to_string()
}

#[test]
fn test_filter_moves_before_project() {
    assert_eq!(
        optimized("SecurityEvent | project Account, EventID | where EventID == 4625"),
        "SecurityEvent | where EventID == 4625 | project Account, EventID"
    );
}

fn where_follows_summarize(text: &str) -> bool {
    let query = optimize(&parse_query(text).unwrap(), &catalog());
    let position = |f: fn(&Operation) -> bool| query.pipeline.iter().position(f);
    match (
        position(|op| matches!(op, Operation::Summarize { .. })),
        position(|op| matches!(op, Operation::Where(_))),
    ) {
        (Some(summarize), Some(filter)) => filter > summarize,
        _ => false,
    }
}

#[test]
fn test_filter_stays_after_summarize() {
    assert!(where_follows_summarize(
        "SecurityEvent | summarize Failures = count() by Account | where Failures > 2"
    ));
    // even a filter on a group key stays put
    assert!(where_follows_summarize(
        "SecurityEvent | summarize count() by Account | where Account == \"alice\""
    ));
}

#[test]
fn test_constant_filter_removed() {
    assert_eq!(
        optimized("SecurityEvent | where 2 > 1 | take 5 | take 3"),
        "SecurityEvent | limit 3"
    );
}

#[test]
fn test_runtime_errors_survive_optimization() {
    let data = dataset();
    let schema = catalog();
    for text in [
        "SecurityEvent | where EventID / 0 == 1 and false",
        "SecurityEvent | where EventID % 0 == 1 or true | project Account",
    ] {
        let query = parse_query(text).unwrap();
        let optimized = optimize(&query, &schema);
        assert!(data.evaluate(&query).is_err(), "{text}");
        assert!(data.evaluate(&optimized).is_err(), "{text} => {optimized}");
    }
}

#[test]
fn test_optimized_results_match() {
    let data = dataset();
    let schema = catalog();
    let queries = [
        "SecurityEvent | project Account, EventID, LogonType | where EventID == 4625 and LogonType == 3",
        "SecurityEvent | extend Hour = bin(TimeGenerated, 1h) | where Account != \"carol\" | summarize n = count() by Hour",
        "SecurityEvent | where Activity matches regex \"fail.*\" | where EventID == 4625 | distinct Account",
        "SecurityEvent | order by TimeGenerated asc | summarize dcount(Computer) by Account",
        "SecurityEvent | join kind=leftouter (SigninLogs | project Account, IPAddress) on Account | where EventID == 4625",
        "SecurityEvent | union SigninLogs | where Account == \"bob\" | project Account, TimeGenerated",
        "SecurityEvent | where isnotnull(LogonType) | extend Remote = LogonType == 10 | where Remote == false",
        "SecurityEvent | where iff(1 > 2, EventID, LogonType) == 3 | project Account",
    ];
    for text in queries {
        let query = parse_query(text).unwrap();
        let optimized = optimize(&query, &schema);
        let before = data.evaluate(&query).unwrap();
        let after = data.evaluate(&optimized).unwrap();
        assert_eq!(names(&before), names(&after), "{text} => {optimized}");
        assert_eq!(sorted_rows(&before), sorted_rows(&after), "{text} => {optimized}");
    }
}

#[test]
fn test_disabled_passes() {
    let schema = catalog();
    let config = OptimizerConfig {
        predicate_pushdown: false,
        ..OptimizerConfig::default()
    };
    let query = parse_query("SecurityEvent | project Account, EventID | where EventID == 4625").unwrap();
    let (optimized, report) = Optimizer::new(&schema).with_config(config).optimize_with_report(&query);

    assert_eq!(optimized, query);
    assert!(report.iter().all(|r| r.pass != Pass::PredicatePushdown));
}
