//! KQL compiler and executor.
//!
//! Query text flows through the lexer, parser and validator into an AST,
//! which the optimizer rewrites and the SQL generator lowers into a
//! parameterized, organization-scoped statement. [`QueryExecutor`] drives
//! the whole pipeline against a backing store and caches results.
//!
//! # Supported Syntax
//!
//! ```text
//! SecurityEvent
//! | where TimeGenerated > ago(1h) and EventID == 4625
//! | summarize Failures = count() by Account, bin(TimeGenerated, 5m)
//! | top 10 by Failures desc
//! ```
//!
//! Operators: `where`, `project`, `extend`, `summarize ... by`,
//! `order by` / `sort by`, `top`, `take` / `limit`, `distinct`, `join`,
//! `union`.
//!
//! # Example
//!
//! ```
//! use engine::query::{parse_query, Operation};
//!
//! let query = parse_query("SecurityEvent | where EventID == 4625 | take 10").unwrap();
//! assert_eq!(query.pipeline.len(), 2);
//! assert!(matches!(query.pipeline[1], Operation::Limit(10)));
//! ```

mod ast;
mod cache;
mod completion;
mod error;
pub mod eval;
mod executor;
mod lexer;
mod optimizer;
mod parser;
mod sql;
mod validate;

pub use ast::*;
pub use cache::{fingerprint, ResultCache};
pub use completion::{complete, CompletionItem, CompletionKind};
pub use error::{GenerationError, QueryError, SemanticError, SemanticErrorKind, Stage};
pub use eval::{eval_constant, Dataset, EvalError};
pub use executor::{
    Diagnostic, ExecuteOptions, ExecutionMetrics, ExecutionResult, ExplainResult, QueryExecutor,
    QueryFailure, QueryState, ValidationReport,
};
pub use lexer::{tokenize, Keyword, LexError, Symbol, Token, TokenKind};
pub use optimizer::{optimize, Cost, CostModel, Optimizer, Pass, PassReport};
pub use parser::{parse, parse_query, ParseError};
pub use sql::{generate, quote_identifier, Param, SqlQuery, ORG_COLUMN};
pub use validate::{infer_type, validate, validate_all};
