//! KQL lexer.
//!
//! Turns query text into a flat token stream. Small scanners are written with
//! nom; the driver loop owns position accounting so that every token (and
//! every error) carries a byte offset plus a 1-based line and column.

use crate::models::{parse_datetime, Value};
use chrono::TimeDelta;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{char, digit1, multispace1, not_line_ending, one_of},
    combinator::{opt, recognize, value},
    IResult, Parser,
};
use thiserror::Error;

/// Reserved words. Matching is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Keyword {
    Where,
    Project,
    Extend,
    Summarize,
    By,
    Order,
    Top,
    Limit,
    Distinct,
    Join,
    Union,
    And,
    Or,
    Not,
    In,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Regex,
    Has,
    Asc,
    Desc,
    On,
    Kind,
    As,
    Case,
    When,
    Then,
    Else,
    True,
    False,
    Null,
}

impl Keyword {
    const ALL: [Self; 33] = [
        Self::Where,
        Self::Project,
        Self::Extend,
        Self::Summarize,
        Self::By,
        Self::Order,
        Self::Top,
        Self::Limit,
        Self::Distinct,
        Self::Join,
        Self::Union,
        Self::And,
        Self::Or,
        Self::Not,
        Self::In,
        Self::Contains,
        Self::StartsWith,
        Self::EndsWith,
        Self::Matches,
        Self::Regex,
        Self::Has,
        Self::Asc,
        Self::Desc,
        Self::On,
        Self::Kind,
        Self::As,
        Self::Case,
        Self::When,
        Self::Then,
        Self::Else,
        Self::True,
        Self::False,
        Self::Null,
    ];

    /// Canonical lowercase spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Where => "where",
            Self::Project => "project",
            Self::Extend => "extend",
            Self::Summarize => "summarize",
            Self::By => "by",
            Self::Order => "order",
            Self::Top => "top",
            Self::Limit => "limit",
            Self::Distinct => "distinct",
            Self::Join => "join",
            Self::Union => "union",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::In => "in",
            Self::Contains => "contains",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::Matches => "matches",
            Self::Regex => "regex",
            Self::Has => "has",
            Self::Asc => "asc",
            Self::Desc => "desc",
            Self::On => "on",
            Self::Kind => "kind",
            Self::As => "as",
            Self::Case => "case",
            Self::When => "when",
            Self::Then => "then",
            Self::Else => "else",
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
        }
    }

    /// Looks up a keyword, ignoring case.
    #[must_use]
    pub fn from_word(word: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(word))
    }

    /// Every keyword, in declaration order.
    #[must_use]
    pub fn all() -> &'static [Self] {
        &Self::ALL
    }
}

/// Operators and punctuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `<>`
    LtGt,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `=~`
    TildeEq,
    /// `!~`
    BangTilde,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `|`
    Pipe,
    /// `=`
    Eq,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `,`
    Comma,
    /// `.`
    Dot,
    /// `!`
    Bang,
}

impl Symbol {
    /// Source spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::LtGt => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::TildeEq => "=~",
            Self::BangTilde => "!~",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Pipe => "|",
            Self::Eq => "=",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::Comma => ",",
            Self::Dot => ".",
            Self::Bang => "!",
        }
    }
}

/// Token category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Reserved word
    Keyword(Keyword),
    /// Name (plain, bracketed, or `$left`/`$right`)
    Identifier,
    /// Operator or punctuation
    Symbol(Symbol),
    /// Quoted string
    StringLiteral,
    /// Integer or real number
    NumberLiteral,
    /// `datetime(...)`
    DatetimeLiteral,
    /// `1d`, `2h30m`, ...
    TimespanLiteral,
    /// `guid(...)`
    GuidLiteral,
    /// End of input
    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keyword(k) => write!(f, "'{}'", k.as_str()),
            Self::Identifier => write!(f, "identifier"),
            Self::Symbol(s) => write!(f, "'{}'", s.as_str()),
            Self::StringLiteral => write!(f, "string"),
            Self::NumberLiteral => write!(f, "number"),
            Self::DatetimeLiteral => write!(f, "datetime"),
            Self::TimespanLiteral => write!(f, "timespan"),
            Self::GuidLiteral => write!(f, "guid"),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

/// A lexical token.
///
/// `text` is the source lexeme, except for bracketed identifiers where it is
/// the unquoted name. `value` holds the decoded literal for literal tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Token category.
    pub kind: TokenKind,
    /// Lexeme.
    pub text: String,
    /// Decoded literal value.
    pub value: Option<Value>,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// 1-based line of `start`.
    pub line: usize,
    /// 1-based column (in characters) of `start`.
    pub column: usize,
}

impl Token {
    /// Returns true if this token is the given keyword.
    #[must_use]
    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }

    /// Returns true if this token is the given symbol.
    #[must_use]
    pub fn is_symbol(&self, symbol: Symbol) -> bool {
        self.kind == TokenKind::Symbol(symbol)
    }

    /// Returns true for identifiers and keywords, i.e. anything usable as a
    /// name outside keyword position.
    #[must_use]
    pub fn is_word(&self) -> bool {
        matches!(self.kind, TokenKind::Identifier | TokenKind::Keyword(_))
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TokenKind::Eof => write!(f, "end of input"),
            _ => write!(f, "'{}'", self.text),
        }
    }
}

/// A lexical error. Lexing stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at line {line}, column {column}")]
pub struct LexError {
    /// What went wrong.
    pub message: String,
    /// Byte offset.
    pub offset: usize,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
}

/// Tokenizes query text. The last token is always `Eof`.
///
/// # Errors
///
/// Returns a [`LexError`] at the first unrecognized character, unterminated
/// string or comment, invalid escape, or malformed literal.
///
/// # Examples
///
/// ```
/// use engine::query::{tokenize, TokenKind};
///
/// let tokens = tokenize("SecurityEvent | take 10").unwrap();
/// assert_eq!(tokens.len(), 5);
/// assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
/// ```
pub fn tokenize(text: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(text).run()
}

// ============================================================================
// Scanners
// ============================================================================

fn line_comment(input: &str) -> IResult<&str, &str> {
    recognize((tag("//"), not_line_ending)).parse(input)
}

fn block_comment(input: &str) -> IResult<&str, &str> {
    recognize((tag("/*"), take_until("*/"), tag("*/"))).parse(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    recognize((
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    recognize((
        digit1,
        opt((char('.'), digit1)),
        opt((one_of("eE"), opt(one_of("+-")), digit1)),
    ))
    .parse(input)
}

fn timespan_unit(input: &str) -> IResult<&str, i64> {
    alt((
        value(1_000, tag("ms")),
        value(1, tag("us")),
        value(86_400_000_000, tag("d")),
        value(3_600_000_000, tag("h")),
        value(60_000_000, tag("m")),
        value(1_000_000, tag("s")),
    ))
    .parse(input)
}

fn symbol(input: &str) -> IResult<&str, Symbol> {
    alt((
        alt((
            value(Symbol::EqEq, tag("==")),
            value(Symbol::TildeEq, tag("=~")),
            value(Symbol::NotEq, tag("!=")),
            value(Symbol::BangTilde, tag("!~")),
            value(Symbol::LtGt, tag("<>")),
            value(Symbol::LtEq, tag("<=")),
            value(Symbol::GtEq, tag(">=")),
        )),
        alt((
            value(Symbol::Lt, char('<')),
            value(Symbol::Gt, char('>')),
            value(Symbol::Eq, char('=')),
            value(Symbol::Bang, char('!')),
            value(Symbol::Plus, char('+')),
            value(Symbol::Minus, char('-')),
            value(Symbol::Star, char('*')),
            value(Symbol::Slash, char('/')),
            value(Symbol::Percent, char('%')),
            value(Symbol::Pipe, char('|')),
            value(Symbol::LParen, char('(')),
            value(Symbol::RParen, char(')')),
            value(Symbol::Comma, char(',')),
            value(Symbol::Dot, char('.')),
        )),
    ))
    .parse(input)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_guid(text: &str) -> bool {
    text.len() == 36
        && text.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

// ============================================================================
// Driver
// ============================================================================

struct Lexer<'a> {
    source: &'a str,
    rest: &'a str,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            rest: source,
            line: 1,
            column: 1,
            tokens: Vec::new(),
        }
    }

    fn offset(&self) -> usize {
        self.source.len() - self.rest.len()
    }

    fn advance(&mut self, len: usize) -> &'a str {
        let (taken, rest) = self.rest.split_at(len);
        for c in taken.chars() {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.rest = rest;
        taken
    }

    fn error(&self, message: impl Into<String>) -> LexError {
        self.error_at(message, self.offset())
    }

    fn error_at(&self, message: impl Into<String>, offset: usize) -> LexError {
        let before = &self.source[..offset];
        let line = before.matches('\n').count() + 1;
        let column = before
            .rfind('\n')
            .map_or(before, |nl| &before[nl + 1..])
            .chars()
            .count()
            + 1;
        LexError {
            message: message.into(),
            offset,
            line,
            column,
        }
    }

    fn push(&mut self, kind: TokenKind, len: usize, value: Option<Value>, text: Option<String>) {
        let start = self.offset();
        let (line, column) = (self.line, self.column);
        let lexeme = self.advance(len);
        self.tokens.push(Token {
            kind,
            text: text.unwrap_or_else(|| lexeme.to_string()),
            value,
            start,
            end: start + len,
            line,
            column,
        });
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        loop {
            self.skip_trivia()?;
            if self.rest.is_empty() {
                let end = self.source.len();
                self.tokens.push(Token {
                    kind: TokenKind::Eof,
                    text: String::new(),
                    value: None,
                    start: end,
                    end,
                    line: self.line,
                    column: self.column,
                });
                return Ok(self.tokens);
            }
            self.next_token()?;
        }
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            if let Ok((_, ws)) = multispace1::<&str, nom::error::Error<&str>>(self.rest) {
                self.advance(ws.len());
            } else if let Ok((_, comment)) = line_comment(self.rest) {
                self.advance(comment.len());
            } else if self.rest.starts_with("/*") {
                let Ok((_, comment)) = block_comment(self.rest) else {
                    return Err(self.error("unterminated block comment"));
                };
                self.advance(comment.len());
            } else {
                return Ok(());
            }
        }
    }

    fn next_token(&mut self) -> Result<(), LexError> {
        let mut chars = self.rest.chars();
        let first = chars.next().unwrap_or_default();
        let second = chars.next();

        match first {
            '"' | '\'' => self.string(0, first, false),
            '@' if matches!(second, Some('"' | '\'')) => {
                self.string(1, second.unwrap_or('"'), true)
            }
            '[' => self.bracketed_identifier(),
            '$' => self.qualifier(),
            c if c.is_ascii_digit() => self.number_or_timespan(),
            c if c.is_alphabetic() || c == '_' => self.word(),
            _ => match symbol(self.rest) {
                Ok((rest, sym)) => {
                    let len = self.rest.len() - rest.len();
                    self.push(TokenKind::Symbol(sym), len, None, None);
                    Ok(())
                }
                Err(_) => Err(self.error(format!("unrecognized character '{first}'"))),
            },
        }
    }

    /// Scans a quoted string starting `prefix` bytes into the remaining input.
    /// Returns the decoded content and the total lexeme length.
    fn scan_string(&self, prefix: usize, quote: char, verbatim: bool) -> Result<(String, usize), LexError> {
        let base = self.offset();
        let body_start = prefix + quote.len_utf8();
        let mut decoded = String::new();
        let mut chars = self.rest[body_start..].char_indices();

        while let Some((i, c)) = chars.next() {
            if c == quote {
                return Ok((decoded, body_start + i + c.len_utf8()));
            }
            if c == '\\' && !verbatim {
                let Some((_, escaped)) = chars.next() else {
                    break;
                };
                let mapped = match escaped {
                    '\\' => '\\',
                    '"' => '"',
                    '\'' => '\'',
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    '0' => '\0',
                    other => {
                        return Err(self.error_at(
                            format!("invalid escape sequence '\\{other}'"),
                            base + body_start + i,
                        ))
                    }
                };
                decoded.push(mapped);
            } else {
                decoded.push(c);
            }
        }

        Err(self.error("unterminated string literal"))
    }

    fn string(&mut self, prefix: usize, quote: char, verbatim: bool) -> Result<(), LexError> {
        let (decoded, len) = self.scan_string(prefix, quote, verbatim)?;
        self.push(TokenKind::StringLiteral, len, Some(Value::String(decoded)), None);
        Ok(())
    }

    fn bracketed_identifier(&mut self) -> Result<(), LexError> {
        let quote = match self.rest[1..].chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected quoted name after '['")),
        };
        let (name, len) = self.scan_string(1, quote, false)?;
        if !self.rest[len..].starts_with(']') {
            return Err(self.error("unterminated bracketed identifier"));
        }
        if name.is_empty() {
            return Err(self.error("empty bracketed identifier"));
        }
        self.push(TokenKind::Identifier, len + 1, None, Some(name));
        Ok(())
    }

    fn qualifier(&mut self) -> Result<(), LexError> {
        match word(&self.rest[1..]) {
            Ok((_, name)) => {
                self.push(TokenKind::Identifier, 1 + name.len(), None, None);
                Ok(())
            }
            Err(_) => Err(self.error("unrecognized character '$'")),
        }
    }

    fn word(&mut self) -> Result<(), LexError> {
        let Ok((after, text)) = word(self.rest) else {
            return Err(self.error("invalid identifier"));
        };

        if after.starts_with('(') {
            if text.eq_ignore_ascii_case("datetime") {
                return self.wrapped_literal(text.len(), TokenKind::DatetimeLiteral);
            }
            if text.eq_ignore_ascii_case("guid") {
                return self.wrapped_literal(text.len(), TokenKind::GuidLiteral);
            }
        }

        let kind = Keyword::from_word(text).map_or(TokenKind::Identifier, TokenKind::Keyword);
        self.push(kind, text.len(), None, None);
        Ok(())
    }

    /// `datetime(...)` / `guid(...)`, with or without quotes inside.
    fn wrapped_literal(&mut self, name_len: usize, kind: TokenKind) -> Result<(), LexError> {
        let open = name_len + 1;
        let Some(close) = self.rest[open..].find(')') else {
            return Err(self.error(format!("unterminated {kind} literal")));
        };
        let inner = self.rest[open..open + close].trim();
        let inner = match inner.chars().next() {
            Some(q @ ('"' | '\'')) if inner.len() >= 2 && inner.ends_with(q) => {
                &inner[1..inner.len() - 1]
            }
            _ => inner,
        };

        let value = if kind == TokenKind::DatetimeLiteral {
            parse_datetime(inner).map(Value::Datetime)
        } else {
            is_guid(inner).then(|| Value::Guid(inner.to_ascii_lowercase()))
        };
        let Some(value) = value else {
            return Err(self.error(format!("malformed {kind} literal '{inner}'")));
        };

        self.push(kind, open + close + 1, Some(value), None);
        Ok(())
    }

    fn number_or_timespan(&mut self) -> Result<(), LexError> {
        let mut cursor = self.rest;
        let mut total_us = 0.0_f64;
        let mut pairs = 0;

        loop {
            let Ok((after_number, digits)) = number(cursor) else {
                break;
            };
            match timespan_unit(after_number) {
                Ok((after_unit, unit_us))
                    if !after_unit.starts_with(|c: char| c.is_alphabetic() || c == '_') =>
                {
                    let amount: f64 = digits.parse().unwrap_or_default();
                    #[allow(clippy::cast_precision_loss)]
                    let unit = unit_us as f64;
                    total_us += amount * unit;
                    pairs += 1;
                    cursor = after_unit;
                    if !cursor.starts_with(|c: char| c.is_ascii_digit()) {
                        break;
                    }
                }
                _ if pairs > 0 => {
                    return Err(self.error("malformed timespan literal"));
                }
                _ => {
                    if after_number.starts_with(is_word_char) {
                        return Err(self.error(format!(
                            "malformed number or timespan starting with '{digits}'"
                        )));
                    }
                    let value = if digits.contains(['.', 'e', 'E']) {
                        Value::Real(digits.parse().unwrap_or_default())
                    } else {
                        digits.parse::<i64>().map_or_else(
                            |_| Value::Real(digits.parse().unwrap_or_default()),
                            Value::Long,
                        )
                    };
                    self.push(TokenKind::NumberLiteral, digits.len(), Some(value), None);
                    return Ok(());
                }
            }
        }

        let len = self.rest.len() - cursor.len();
        #[allow(clippy::cast_possible_truncation)]
        let micros = total_us.round() as i64;
        self.push(
            TokenKind::TimespanLiteral,
            len,
            Some(Value::Timespan(TimeDelta::microseconds(micros))),
            None,
        );
        Ok(())
    }
}
