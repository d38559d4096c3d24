//! Schema catalog consumed by validation, optimization, SQL generation and
//! completion.
//!
//! The catalog is owned by the surrounding platform; the engine only reads it
//! through the [`SchemaProvider`] trait.

mod functions;

pub use functions::{builtin_functions, is_builtin_aggregate, AGGREGATES};

use crate::models::ColumnType;
use serde::{Deserialize, Serialize};

/// A column in a catalog table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// KQL-facing column name (e.g. `EventID`).
    pub name: String,
    /// Physical column name in the backing store (e.g. `event_id`).
    #[serde(default)]
    pub sql_name: String,
    /// Column type.
    pub kind: ColumnType,
}

impl ColumnSchema {
    /// Creates a column whose physical name is the snake_case form of `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        let name = name.into();
        Self {
            sql_name: to_snake_case(&name),
            name,
            kind,
        }
    }

    /// Overrides the physical column name.
    #[must_use]
    pub fn with_sql_name(mut self, sql_name: impl Into<String>) -> Self {
        self.sql_name = sql_name.into();
        self
    }
}

/// A table in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// KQL-facing table name (e.g. `SecurityEvent`).
    pub name: String,
    /// Physical table name (e.g. `security_event`).
    #[serde(default)]
    pub sql_name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnSchema>,
    /// Approximate cardinality used by the cost model.
    #[serde(default = "default_row_estimate")]
    pub row_estimate: u64,
}

fn default_row_estimate() -> u64 {
    1_000_000
}

impl TableSchema {
    /// Creates a table whose physical name is the snake_case form of `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        let name = name.into();
        Self {
            sql_name: to_snake_case(&name),
            name,
            columns,
            row_estimate: default_row_estimate(),
        }
    }

    /// Sets the cardinality estimate.
    #[must_use]
    pub fn with_row_estimate(mut self, rows: u64) -> Self {
        self.row_estimate = rows;
        self
    }

    /// Looks up a column by KQL name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn normalized(mut self) -> Self {
        if self.sql_name.is_empty() {
            self.sql_name = to_snake_case(&self.name);
        }
        for column in &mut self.columns {
            if column.sql_name.is_empty() {
                column.sql_name = to_snake_case(&column.name);
            }
        }
        self
    }
}

/// How a function's result type is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    /// Always the given type.
    Fixed(ColumnType),
    /// Same type as the argument at this position.
    SameAsArg(usize),
}

/// Signature of a function known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    /// Function name as written in queries.
    pub name: String,
    /// Minimum number of arguments.
    pub min_args: usize,
    /// Maximum number of arguments (`None` = variadic).
    pub max_args: Option<usize>,
    /// Result type rule.
    pub returns: ReturnKind,
    /// True for aggregation functions usable in `summarize`.
    pub aggregate: bool,
}

impl FunctionSignature {
    /// Creates a scalar function signature.
    #[must_use]
    pub fn scalar(name: &str, min_args: usize, max_args: Option<usize>, returns: ReturnKind) -> Self {
        Self {
            name: name.to_string(),
            min_args,
            max_args,
            returns,
            aggregate: false,
        }
    }

    /// Creates an aggregate function signature.
    #[must_use]
    pub fn aggregate(name: &str, min_args: usize, max_args: Option<usize>, returns: ReturnKind) -> Self {
        Self {
            aggregate: true,
            ..Self::scalar(name, min_args, max_args, returns)
        }
    }

    /// Returns true if `count` arguments satisfy the arity.
    #[must_use]
    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_args && self.max_args.map_or(true, |max| count <= max)
    }

    /// Human-readable arity, e.g. `1`, `2..3`, `1..`.
    #[must_use]
    pub fn arity(&self) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => max.to_string(),
            Some(max) => format!("{}..{max}", self.min_args),
            None => format!("{}..", self.min_args),
        }
    }
}

/// Read-only access to table, column and function metadata.
///
/// Implementations must be thread-safe (Send + Sync); the executor shares one
/// provider across concurrent queries.
pub trait SchemaProvider: Send + Sync {
    /// Returns every table in the catalog.
    fn list_tables(&self) -> Vec<TableSchema>;

    /// Returns the columns of a table, or `None` if the table is unknown.
    fn list_columns(&self, table: &str) -> Option<Vec<ColumnSchema>>;

    /// Returns every known function.
    fn list_functions(&self) -> Vec<FunctionSignature>;

    /// Looks up a table by name.
    fn table(&self, name: &str) -> Option<TableSchema> {
        self.list_tables().into_iter().find(|t| t.name == name)
    }

    /// Looks up a function by name.
    fn function(&self, name: &str) -> Option<FunctionSignature> {
        self.list_functions().into_iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    tables: Vec<TableSchema>,
}

/// In-memory schema catalog.
///
/// Holds a fixed set of tables plus the built-in function list.
///
/// # Example
///
/// ```
/// use engine::models::ColumnType;
/// use engine::schema::{ColumnSchema, InMemorySchemaProvider, SchemaProvider, TableSchema};
///
/// let schema = InMemorySchemaProvider::new().with_table(TableSchema::new(
///     "SecurityEvent",
///     vec![ColumnSchema::new("EventID", ColumnType::Long)],
/// ));
///
/// let columns = schema.list_columns("SecurityEvent").unwrap();
/// assert_eq!(columns[0].sql_name, "event_id");
/// ```
#[derive(Debug, Clone)]
pub struct InMemorySchemaProvider {
    tables: Vec<TableSchema>,
    functions: Vec<FunctionSignature>,
}

impl InMemorySchemaProvider {
    /// Creates a catalog with no tables and the built-in functions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            functions: builtin_functions(),
        }
    }

    /// Adds a table.
    #[must_use]
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.tables.push(table.normalized());
        self
    }

    /// Loads tables from a JSON document of the form `{"tables": [...]}`.
    ///
    /// Missing `sql_name` fields default to the snake_case form of the name.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid catalog JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Ok(file
            .tables
            .into_iter()
            .fold(Self::new(), Self::with_table))
    }
}

impl Default for InMemorySchemaProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaProvider for InMemorySchemaProvider {
    fn list_tables(&self) -> Vec<TableSchema> {
        self.tables.clone()
    }

    fn list_columns(&self, table: &str) -> Option<Vec<ColumnSchema>> {
        self.tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.columns.clone())
    }

    fn list_functions(&self) -> Vec<FunctionSignature> {
        self.functions.clone()
    }

    fn table(&self, name: &str) -> Option<TableSchema> {
        self.tables.iter().find(|t| t.name == name).cloned()
    }

    fn function(&self, name: &str) -> Option<FunctionSignature> {
        self.functions.iter().find(|f| f.name == name).cloned()
    }
}

/// Converts a KQL name to snake_case (`EventID` → `event_id`,
/// `HTTPStatus` → `http_status`).
#[must_use]
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(char::is_lowercase),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}
