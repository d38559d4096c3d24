//! Vigil query engine
//!
//! Compiles Kusto-style queries (KQL) into parameterized ClickHouse SQL,
//! runs them against a backing store and returns typed rows with timing
//! metrics.
//!
//! # Modules
//!
//! - [`models`] - Scalar values, column types and row sets
//! - [`schema`] - Read-only table and function catalog
//! - [`query`] - Lexer, parser, optimizer, SQL generator and executor
//! - [`storage`] - Backing-store trait and implementations
//! - [`config`] - Engine limits and optimizer settings
//!
//! # Example
//!
//! ```
//! use engine::models::ColumnType;
//! use engine::query::{generate, optimize, parse_query};
//! use engine::schema::{ColumnSchema, InMemorySchemaProvider, TableSchema};
//!
//! let schema = InMemorySchemaProvider::new().with_table(TableSchema::new(
//!     "SecurityEvent",
//!     vec![
//!         ColumnSchema::new("EventID", ColumnType::Long),
//!         ColumnSchema::new("Account", ColumnType::String),
//!     ],
//! ));
//!
//! let query = parse_query("SecurityEvent | project Account, EventID | where EventID == 4625").unwrap();
//! let optimized = optimize(&query, &schema);
//! assert_eq!(
//!     optimized.to_string(),
//!     "SecurityEvent | where EventID == 4625 | project Account, EventID"
//! );
//!
//! let sql = generate(&optimized, &schema, "acme").unwrap();
//! assert!(sql.sql.contains("org_id = $2"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod models;
pub mod query;
pub mod schema;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

/// Re-export common dependencies for convenience.
pub use chrono;
pub use serde;
pub use serde_json;
pub use validator;
