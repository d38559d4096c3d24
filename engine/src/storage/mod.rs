//! Backing-store abstraction.
//!
//! The engine never talks to a database directly: it hands a parameterized
//! [`SqlQuery`] to a [`BackingStore`] and gets rows back. `ClickHouseStore`
//! runs the statement over the `clickhouse` HTTP client; `InMemoryStore`
//! returns canned rows for development and tests.

pub mod clickhouse;
pub mod memory;

pub use self::clickhouse::ClickHouseStore;
pub use memory::InMemoryStore;

use crate::models::RowSet;
use crate::query::SqlQuery;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Failed to acquire lock on the store.
    #[error("Failed to acquire lock on backing store")]
    LockError,

    /// The database rejected or failed the statement.
    #[error("Database error: {0}")]
    Database(String),

    /// A returned row could not be decoded.
    #[error("Malformed row: {0}")]
    Decode(String),
}

impl From<::clickhouse::error::Error> for StoreError {
    fn from(err: ::clickhouse::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Per-call limits passed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Wall-clock budget. The executor enforces it; stores may forward it to
    /// the database as a server-side limit.
    pub timeout: Duration,
    /// Maximum number of rows to return. The executor asks for one more row
    /// than the caller's cap to detect truncation.
    pub max_rows: u64,
}

/// A store that runs parameterized SQL.
///
/// Implementations must be thread-safe (Send + Sync); one store is shared by
/// every concurrent query.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Runs the statement and returns at most `options.max_rows` rows, laid
    /// out as `query.columns`.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails or a row cannot be decoded.
    async fn run_parameterized(
        &self,
        query: &SqlQuery,
        options: RunOptions,
    ) -> Result<RowSet, StoreError>;
}
