//! Context-aware completion.
//!
//! Tokenizes the text before the cursor, classifies the position from the
//! trailing tokens and offers tables, pipeline operators, columns and
//! functions, or binary operators, filtered by the word being typed.

use super::lexer::{tokenize, Keyword, Symbol, Token, TokenKind};
use super::parser::parse_query;
use super::validate::validate;
use crate::models::ColumnInfo;
use crate::schema::SchemaProvider;
use serde::Serialize;

/// Pipeline operators offered after `|`.
const OPERATORS: [&str; 12] = [
    "where",
    "project",
    "extend",
    "summarize",
    "order by",
    "sort by",
    "top",
    "take",
    "limit",
    "distinct",
    "join",
    "union",
];

/// Operators offered after a complete operand.
const BINARY_OPERATORS: [&str; 20] = [
    "==", "!=", "<", "<=", ">", ">=", "=~", "!~", "+", "-", "*", "/", "and", "or", "in",
    "contains", "has", "startswith", "endswith", "matches regex",
];

/// What a completion inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionKind {
    /// A catalog table.
    Table,
    /// A column in scope.
    Column,
    /// A function.
    Function,
    /// A pipeline operator.
    Operator,
    /// A binary operator or keyword.
    Keyword,
}

/// One completion suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionItem {
    /// Text to insert.
    pub label: String,
    /// Category.
    pub kind: CompletionKind,
    /// Type, arity or other hint.
    pub detail: Option<String>,
}

impl CompletionItem {
    fn new(label: impl Into<String>, kind: CompletionKind, detail: Option<String>) -> Self {
        Self {
            label: label.into(),
            kind,
            detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Tables,
    Operators,
    Expression,
    AfterOperand,
}

/// Completions for `text` at byte offset `cursor`.
///
/// A cursor past the end is clamped; text that does not tokenize (for
/// example inside an unterminated string) yields nothing.
///
/// # Example
///
/// ```
/// use engine::query::complete;
/// use engine::schema::{ColumnSchema, InMemorySchemaProvider, TableSchema};
/// use engine::models::ColumnType;
///
/// let schema = InMemorySchemaProvider::new().with_table(TableSchema::new(
///     "SecurityEvent",
///     vec![ColumnSchema::new("EventID", ColumnType::Long)],
/// ));
/// let items = complete("Sec", 3, &schema);
/// assert_eq!(items[0].label, "SecurityEvent");
/// ```
#[must_use]
pub fn complete(text: &str, cursor: usize, schema: &dyn SchemaProvider) -> Vec<CompletionItem> {
    let mut cursor = cursor.min(text.len());
    while !text.is_char_boundary(cursor) {
        cursor -= 1;
    }
    let before = &text[..cursor];

    let Ok(mut tokens) = tokenize(before) else {
        return Vec::new();
    };
    tokens.retain(|t| t.kind != TokenKind::Eof);

    // a word touching the cursor is the prefix being typed
    let partial = match tokens.last() {
        Some(last) if last.is_word() && last.end == cursor => {
            let word = last.text.clone();
            tokens.pop();
            word
        }
        _ => String::new(),
    };

    let items = match classify(&tokens) {
        Context::Tables => tables(schema),
        Context::Operators => OPERATORS
            .iter()
            .map(|op| CompletionItem::new(*op, CompletionKind::Operator, None))
            .collect(),
        Context::Expression => {
            let mut items: Vec<CompletionItem> = columns_in_scope(before, &tokens, schema)
                .into_iter()
                .map(|c| CompletionItem::new(c.name, CompletionKind::Column, Some(c.kind.to_string())))
                .collect();
            items.extend(schema.list_functions().into_iter().map(|f| {
                let detail = format!("{}({})", if f.aggregate { "aggregate" } else { "function" }, f.arity());
                CompletionItem::new(f.name, CompletionKind::Function, Some(detail))
            }));
            items
        }
        Context::AfterOperand => BINARY_OPERATORS
            .iter()
            .chain(&["by"])
            .map(|op| CompletionItem::new(*op, CompletionKind::Keyword, None))
            .collect(),
    };

    let partial = partial.to_lowercase();
    items
        .into_iter()
        .filter(|item| item.label.to_lowercase().starts_with(&partial))
        .collect()
}

fn tables(schema: &dyn SchemaProvider) -> Vec<CompletionItem> {
    schema
        .list_tables()
        .into_iter()
        .map(|t| {
            let detail = format!("table ({} columns)", t.columns.len());
            CompletionItem::new(t.name, CompletionKind::Table, Some(detail))
        })
        .collect()
}

fn classify(tokens: &[Token]) -> Context {
    let Some(last) = tokens.last() else {
        return Context::Tables;
    };
    let previous = tokens.len().checked_sub(2).and_then(|i| tokens.get(i));

    match last.kind {
        TokenKind::Keyword(Keyword::Join | Keyword::Union) => Context::Tables,
        TokenKind::Symbol(Symbol::LParen) if opens_source(&tokens[..tokens.len() - 1]) => {
            Context::Tables
        }
        TokenKind::Symbol(Symbol::Comma) if in_union(tokens) => Context::Tables,
        TokenKind::Symbol(Symbol::Pipe) => Context::Operators,
        // `join kind=inner ` and `union kind=all `
        TokenKind::Identifier
            if previous.is_some_and(|p| p.is_symbol(Symbol::Eq))
                && tokens.len() >= 3
                && tokens[tokens.len() - 3].is_keyword(Keyword::Kind) =>
        {
            Context::Tables
        }
        TokenKind::Identifier
        | TokenKind::StringLiteral
        | TokenKind::NumberLiteral
        | TokenKind::DatetimeLiteral
        | TokenKind::TimespanLiteral
        | TokenKind::GuidLiteral
        | TokenKind::Keyword(Keyword::True | Keyword::False | Keyword::Null)
        | TokenKind::Symbol(Symbol::RParen) => Context::AfterOperand,
        _ => Context::Expression,
    }
}

/// True when `tokens` end in `join` or `union`, optionally followed by
/// `kind=<name>`.
fn opens_source(tokens: &[Token]) -> bool {
    let mut end = tokens.len();
    if end >= 3
        && tokens[end - 3].is_keyword(Keyword::Kind)
        && tokens[end - 2].is_symbol(Symbol::Eq)
    {
        end -= 3;
    }
    end.checked_sub(1)
        .and_then(|i| tokens.get(i))
        .is_some_and(|t| t.is_keyword(Keyword::Join) || t.is_keyword(Keyword::Union))
}

/// True when the innermost stage is a `union` at parenthesis depth zero.
fn in_union(tokens: &[Token]) -> bool {
    let mut depth = 0_i32;
    for token in tokens.iter().rev() {
        match token.kind {
            TokenKind::Symbol(Symbol::RParen) => depth += 1,
            TokenKind::Symbol(Symbol::LParen) => depth -= 1,
            TokenKind::Symbol(Symbol::Pipe) if depth <= 0 => return false,
            TokenKind::Keyword(Keyword::Union) if depth <= 0 => return true,
            _ => {}
        }
    }
    false
}

/// Columns visible at the current stage: the output of everything before
/// the last top-level pipe, or the base table when that does not validate.
fn columns_in_scope(before: &str, tokens: &[Token], schema: &dyn SchemaProvider) -> Vec<ColumnInfo> {
    let mut depth = 0_i32;
    let mut last_pipe = None;
    for token in tokens {
        match token.kind {
            TokenKind::Symbol(Symbol::LParen) => depth += 1,
            TokenKind::Symbol(Symbol::RParen) => depth -= 1,
            TokenKind::Symbol(Symbol::Pipe) if depth == 0 => last_pipe = Some(token.start),
            _ => {}
        }
    }

    let resolved = last_pipe
        .and_then(|end| parse_query(&before[..end]).ok())
        .and_then(|query| validate(&query, schema).ok());
    if let Some(columns) = resolved {
        return columns;
    }

    tokens
        .first()
        .filter(|t| t.kind == TokenKind::Identifier)
        .and_then(|t| schema.list_columns(&t.text))
        .unwrap_or_default()
        .into_iter()
        .map(|c| ColumnInfo::new(c.name, c.kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::security_catalog;

    fn labels(text: &str) -> Vec<String> {
        complete(text, text.len(), &security_catalog())
            .into_iter()
            .map(|i| i.label)
            .collect()
    }

    #[test]
    fn test_tables_at_start() {
        assert_eq!(labels(""), vec!["SecurityEvent", "SigninLogs"]);
        assert_eq!(labels("si"), vec!["SigninLogs"]);
    }

    #[test]
    fn test_operators_after_pipe() {
        let items = labels("SecurityEvent | ");
        assert!(items.contains(&"where".to_string()));
        assert!(items.contains(&"summarize".to_string()));
        assert_eq!(labels("SecurityEvent | su"), vec!["summarize"]);
    }

    #[test]
    fn test_columns_after_where() {
        let items = complete("SecurityEvent | where Ev", 24, &security_catalog());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, "EventID");
        assert_eq!(items[0].kind, CompletionKind::Column);
        assert_eq!(items[0].detail.as_deref(), Some("long"));
    }

    #[test]
    fn test_columns_follow_pipeline() {
        let items = labels("SecurityEvent | summarize Failures = count() by Account | where ");
        assert!(items.contains(&"Failures".to_string()));
        assert!(items.contains(&"Account".to_string()));
        assert!(!items.contains(&"EventID".to_string()));
        assert!(items.contains(&"tolower".to_string()));
    }

    #[test]
    fn test_binary_operators_after_operand() {
        let items = labels("SecurityEvent | where Account ");
        assert!(items.contains(&"==".to_string()));
        assert!(items.contains(&"contains".to_string()));
        assert_eq!(labels("SecurityEvent | where Account st"), vec!["startswith"]);
    }

    #[test]
    fn test_tables_after_join() {
        assert_eq!(labels("SecurityEvent | join kind=inner (Sig"), vec!["SigninLogs"]);
        assert_eq!(labels("SecurityEvent | union Si"), vec!["SigninLogs"]);
        assert_eq!(labels("SecurityEvent | union SigninLogs, Se"), vec!["SecurityEvent"]);
    }

    #[test]
    fn test_cursor_in_middle() {
        let text = "SecurityEvent | where Acc | take 10";
        let items = complete(text, 25, &security_catalog());
        assert_eq!(items[0].label, "Account");
    }

    #[test]
    fn test_unterminated_string_yields_nothing() {
        assert!(labels("SecurityEvent | where Account == \"al").is_empty());
    }
}
