//! Shared fixtures for unit tests.

use crate::models::{parse_datetime, ColumnInfo, ColumnType, RowSet, Value};
use crate::query::Dataset;
use crate::schema::{ColumnSchema, InMemorySchemaProvider, SchemaProvider, TableSchema};

pub(crate) fn security_catalog() -> InMemorySchemaProvider {
    InMemorySchemaProvider::new()
        .with_table(
            TableSchema::new(
                "SecurityEvent",
                vec![
                    ColumnSchema::new("TimeGenerated", ColumnType::Datetime),
                    ColumnSchema::new("EventID", ColumnType::Long),
                    ColumnSchema::new("Account", ColumnType::String),
                    ColumnSchema::new("Computer", ColumnType::String),
                    ColumnSchema::new("IpAddress", ColumnType::String),
                    ColumnSchema::new("LogonType", ColumnType::Long),
                    ColumnSchema::new("Activity", ColumnType::String),
                ],
            )
            .with_row_estimate(5_000_000),
        )
        .with_table(
            TableSchema::new(
                "SigninLogs",
                vec![
                    ColumnSchema::new("TimeGenerated", ColumnType::Datetime),
                    ColumnSchema::new("UserPrincipalName", ColumnType::String),
                    ColumnSchema::new("Account", ColumnType::String),
                    ColumnSchema::new("IPAddress", ColumnType::String).with_sql_name("ip_address"),
                    ColumnSchema::new("ResultType", ColumnType::Long),
                    ColumnSchema::new("AppDisplayName", ColumnType::String),
                    ColumnSchema::new("Location", ColumnType::String),
                ],
            )
            .with_row_estimate(200_000),
        )
}

fn at(text: &str) -> Value {
    parse_datetime(text).map_or(Value::Null, Value::Datetime)
}

fn text(s: &str) -> Value {
    Value::String(s.to_string())
}

fn table(schema: &InMemorySchemaProvider, name: &str, rows: Vec<Vec<Value>>) -> RowSet {
    let columns = schema
        .list_columns(name)
        .unwrap_or_default()
        .into_iter()
        .map(|c| ColumnInfo::new(c.name, c.kind))
        .collect();
    RowSet::new(columns, rows)
}

pub(crate) fn security_dataset() -> Dataset {
    let schema = security_catalog();
    let events = table(
        &schema,
        "SecurityEvent",
        vec![
            vec![at("2024-01-01T10:00:00Z"), Value::Long(4625), text("alice"), text("WS1"), text("10.0.0.1"), Value::Long(3), text("An account failed to log on")],
            vec![at("2024-01-01T10:05:00Z"), Value::Long(4624), text("alice"), text("WS1"), text("10.0.0.1"), Value::Long(10), text("An account was successfully logged on")],
            vec![at("2024-01-01T10:10:00Z"), Value::Long(4625), text("bob"), text("WS2"), text("10.0.0.2"), Value::Null, text("An account failed to log on")],
            vec![at("2024-01-01T11:00:00Z"), Value::Long(4625), text("alice"), text("WS2"), text("10.0.0.3"), Value::Long(2), text("An account failed to log on")],
            vec![at("2024-01-01T12:00:00Z"), Value::Long(4688), text("carol"), text("SRV1"), Value::Null, Value::Null, text("A new process has been created")],
        ],
    );
    let signins = table(
        &schema,
        "SigninLogs",
        vec![
            vec![at("2024-01-01T09:00:00Z"), text("alice"), text("alice"), text("10.0.0.1"), Value::Long(0), text("Portal"), text("US")],
            vec![at("2024-01-01T09:30:00Z"), text("bob"), text("bob"), text("192.168.1.5"), Value::Long(50126), text("Portal"), text("DE")],
            vec![at("2024-01-01T09:45:00Z"), text("dave"), text("dave"), text("172.16.0.9"), Value::Long(0), text("Teams"), text("US")],
        ],
    );
    Dataset::new()
        .with_table("SecurityEvent", events)
        .with_table("SigninLogs", signins)
}
