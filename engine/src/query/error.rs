//! Error types for every compile and execution stage.

use super::lexer::LexError;
use super::parser::ParseError;
use crate::storage::StoreError;
use serde::Serialize;
use thiserror::Error;

/// The stage a query was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Tokenizing.
    Lex,
    /// Building the AST.
    Parse,
    /// Resolving names against the catalog.
    Validate,
    /// Rewriting the AST.
    Optimize,
    /// Lowering to SQL.
    Generate,
    /// Running against the backing store.
    Execute,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lex => write!(f, "lex"),
            Self::Parse => write!(f, "parse"),
            Self::Validate => write!(f, "validate"),
            Self::Optimize => write!(f, "optimize"),
            Self::Generate => write!(f, "generate"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// Kinds of name-resolution and typing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticErrorKind {
    /// The table is not in the catalog.
    UnknownTable,
    /// The column is not in scope at this stage.
    UnknownColumn,
    /// The function is not in the catalog.
    UnknownFunction,
    /// The function was called with the wrong number of arguments.
    ArityMismatch,
    /// An aggregate was used outside `summarize`.
    AggregateOutsideSummarize,
    /// A `summarize` output is not an aggregate.
    NotAnAggregate,
}

/// A query that parses but does not make sense against the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.message())]
pub struct SemanticError {
    /// What went wrong.
    pub kind: SemanticErrorKind,
    /// The offending identifier.
    pub name: String,
}

impl SemanticError {
    /// Creates a semantic error.
    #[must_use]
    pub fn new(kind: SemanticErrorKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    fn message(&self) -> String {
        let name = &self.name;
        match self.kind {
            SemanticErrorKind::UnknownTable => format!("unknown table '{name}'"),
            SemanticErrorKind::UnknownColumn => format!("unknown column '{name}'"),
            SemanticErrorKind::UnknownFunction => format!("unknown function '{name}'"),
            SemanticErrorKind::ArityMismatch => {
                format!("wrong number of arguments to '{name}'")
            }
            SemanticErrorKind::AggregateOutsideSummarize => {
                format!("aggregate '{name}' is only allowed in summarize")
            }
            SemanticErrorKind::NotAnAggregate => {
                format!("summarize output '{name}' is not an aggregate")
            }
        }
    }
}

/// An AST construct that has no SQL lowering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot translate {construct} to SQL")]
pub struct GenerationError {
    /// Description of the unsupported construct.
    pub construct: String,
}

impl GenerationError {
    /// Creates a generation error.
    #[must_use]
    pub fn new(construct: impl Into<String>) -> Self {
        Self {
            construct: construct.into(),
        }
    }
}

/// Any error a query can fail with.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// Malformed source text.
    #[error("lex error: {0}")]
    Lex(#[from] LexError),

    /// Grammar violation.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Unknown name or misplaced aggregate.
    #[error("semantic error: {0}")]
    Semantic(#[from] SemanticError),

    /// Unsupported construct.
    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),

    /// Backing-store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The backing store did not answer in time.
    #[error("query timed out after {timeout_ms}ms")]
    TimedOut {
        /// The budget that was exceeded.
        timeout_ms: u64,
    },
}

impl QueryError {
    /// The stage the error originated in.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Lex(_) => Stage::Lex,
            Self::Parse(_) => Stage::Parse,
            Self::Semantic(_) => Stage::Validate,
            Self::Generation(_) => Stage::Generate,
            Self::Store(_) | Self::TimedOut { .. } => Stage::Execute,
        }
    }

    /// Returns true if resubmitting the same query could succeed.
    ///
    /// Only store failures qualify; a timeout is reported as its own outcome
    /// and left to the caller's judgement.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
