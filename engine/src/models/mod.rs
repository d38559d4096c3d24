//! Data models shared across the engine.
//!
//! - [`Value`] / [`ColumnType`] - scalar values and their types
//! - [`RowSet`] - tabular results returned by stores and the executor

mod rowset;
mod value;

pub use rowset::{ColumnInfo, RowSet};
pub use value::{format_timespan, parse_datetime, quote_string, ColumnType, Value};
