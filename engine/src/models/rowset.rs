//! Tabular result data.

use super::value::{ColumnType, Value};
use serde::{Deserialize, Serialize};

/// Name and type of a result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Column type.
    pub kind: ColumnType,
}

impl ColumnInfo {
    /// Creates a new column description.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A set of rows with a shared column layout.
///
/// Rows are positional: `rows[i][j]` is the value of `columns[j]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowSet {
    /// Column layout.
    pub columns: Vec<ColumnInfo>,
    /// Row values.
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    /// Creates a row set from columns and rows.
    #[must_use]
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of the named column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Builds a row set from JSON objects, taking the column layout from the
    /// given columns. Missing keys become nulls.
    #[must_use]
    pub fn from_json_objects(columns: Vec<ColumnInfo>, objects: &[serde_json::Value]) -> Self {
        let rows = objects
            .iter()
            .map(|obj| {
                columns
                    .iter()
                    .map(|c| {
                        obj.get(&c.name)
                            .map_or(Value::Null, Value::from_json)
                            .coerce(c.kind)
                    })
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    /// Renders rows as JSON objects keyed by column name.
    #[must_use]
    pub fn to_json_objects(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let map: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| {
                        (
                            c.name.clone(),
                            serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect();
                serde_json::Value::Object(map)
            })
            .collect()
    }
}
