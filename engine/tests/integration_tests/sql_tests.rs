//! Integration tests for SQL generation.
//!
//! Tests cover:
//! - Literals travel only as bound parameters
//! - Every table scan carries the organization predicate
//! - Physical names come from the catalog
//! - Unsupported constructs are rejected

use engine::models::Value;
use engine::query::{generate, optimize, parse_query, GenerationError, SqlQuery};

use super::common::{catalog, ORG};

fn compile(text: &str) -> SqlQuery {
    let schema = catalog();
    let query = parse_query(text).unwrap();
    generate(&optimize(&query, &schema), &schema, ORG).unwrap()
}

fn compile_err(text: &str) -> GenerationError {
    let schema = catalog();
    generate(&parse_query(text).unwrap(), &schema, ORG).unwrap_err()
}

fn org_predicate(sql: &SqlQuery) -> String {
    format!("org_id = ${}", sql.params.len())
}

#[test]
fn test_metacharacters_stay_in_params() {
    let hostile = [
        "'; DROP TABLE security_event; --",
        "\" OR 1=1 --",
        "x') UNION SELECT * FROM users --",
        "$1",
    ];
    for payload in hostile {
        let escaped = payload.replace('\\', "\\\\").replace('"', "\\\"");
        let sql = compile(&format!(
            "SecurityEvent | where Account == \"{escaped}\" or Activity contains \"{escaped}\""
        ));
        assert!(!sql.sql.contains("DROP"), "{}", sql.sql);
        assert!(!sql.sql.contains("UNION SELECT"), "{}", sql.sql);
        assert!(!sql.sql.contains("1=1"), "{}", sql.sql);
        let bound: Vec<&Value> = sql.params.iter().map(|p| &p.value).collect();
        assert_eq!(bound.iter().filter(|v| **v == &Value::String(payload.to_string())).count(), 2);
    }
}

#[test]
fn test_org_predicate_on_every_scan() {
    let cases = [
        ("SecurityEvent", 1),
        ("SecurityEvent | where EventID == 1 or EventID == 2", 1),
        ("SecurityEvent | join (SigninLogs) on Account", 2),
        ("SecurityEvent | union SigninLogs, SecurityEvent", 3),
        ("(SecurityEvent | where EventID == 4625) | summarize count() by Account", 1),
        (
            "SecurityEvent | join kind=fullouter (SigninLogs | union SigninLogs) on Account",
            3,
        ),
    ];
    for (text, scans) in cases {
        let sql = compile(text);
        assert_eq!(
            sql.sql.matches(&org_predicate(&sql)).count(),
            scans,
            "{text}: {}",
            sql.sql
        );
        assert_eq!(sql.params.last().map(|p| &p.value), Some(&Value::String(ORG.into())));
    }
}

#[test]
fn test_org_predicate_is_not_absorbed_by_disjunction() {
    let sql = compile("SecurityEvent | where EventID == 1 or Account == \"root\"");
    let predicate = format!("WHERE {} AND (", org_predicate(&sql));
    assert!(sql.sql.contains(&predicate), "{}", sql.sql);
}

#[test]
fn test_placeholders_are_dense_and_ordered() {
    let sql = compile(
        "SecurityEvent | where EventID in (4624, 4625) and Account startswith \"a\" | extend Slow = LogonType > 5",
    );
    for (i, param) in sql.params.iter().enumerate() {
        assert_eq!(param.placeholder, format!("${}", i + 1));
        assert!(sql.sql.contains(&param.placeholder));
    }
    assert!(!sql.sql.contains(&format!("${}", sql.params.len() + 1)));
}

#[test]
fn test_catalog_names() {
    let sql = compile("SigninLogs | where ResultType != 0 | project IPAddress, Account");
    assert!(sql.sql.contains("FROM signin_logs"), "{}", sql.sql);
    assert!(sql.sql.contains("result_type != $1"), "{}", sql.sql);
    assert!(sql.sql.contains("ip_address AS \"IPAddress\""), "{}", sql.sql);
    let names: Vec<&str> = sql.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["IPAddress", "Account"]);
}

#[test]
fn test_outer_join_settings() {
    let sql = compile("SecurityEvent | join kind=leftouter (SigninLogs) on Account");
    assert!(sql.sql.contains("LEFT OUTER JOIN"), "{}", sql.sql);
    assert!(sql.sql.ends_with("SETTINGS prefer_column_name_to_alias = 1, join_use_nulls = 1"));

    let inner = compile("SecurityEvent | join (SigninLogs) on Account");
    assert!(inner.sql.contains("INNER JOIN"));
    assert!(!inner.sql.contains("join_use_nulls"));
}

#[test]
fn test_join_output_columns() {
    let sql = compile("SecurityEvent | join (SigninLogs) on Account");
    let names: Vec<&str> = sql.columns.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"Account"));
    assert!(names.contains(&"Account1"));
    assert!(names.contains(&"TimeGenerated1"));
    assert!(names.contains(&"IPAddress"));
}

#[test]
fn test_unsupported_constructs() {
    assert_eq!(compile_err("SecurityEvent | extend J = parse_json(Activity)").construct, "parse_json");
    let err = compile_err("SecurityEvent | summarize count() by bin(TimeGenerated, LogonType)");
    assert!(err.to_string().starts_with("cannot translate bin"));
}
