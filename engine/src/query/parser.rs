//! Recursive-descent KQL parser.
//!
//! Parses token streams like:
//! - `SecurityEvent | where EventID == 4625 | summarize count() by Account`
//! - `SigninLogs | where ResultType != 0 | top 10 by TimeGenerated desc`
//! - `SecurityEvent | join kind=leftouter (SigninLogs) on $left.Account == $right.UserPrincipalName`
//!
//! Expressions use precedence climbing. Operators are recognised by the word
//! in operator position, so `sort` and `take` need no reserved word and any
//! keyword is accepted as a name outside keyword position.

use super::ast::{
    BinaryOp, CaseBranch, Expr, JoinKind, Operation, ProjectItem, Query, SortKey, SortOrder,
    TableExpression, UnaryOp, UnionKind,
};
use super::error::QueryError;
use super::lexer::{tokenize, Keyword, Symbol, Token, TokenKind};
use crate::models::Value;
use thiserror::Error;

/// A syntax error: the parser stops at the first one.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "expected {}, found {found} at line {}, column {}{}",
    describe_expected(.expected),
    .found.line,
    .found.column,
    .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
)]
pub struct ParseError {
    /// Token kinds that would have been accepted, in the order they were tried.
    pub expected: Vec<TokenKind>,
    /// The offending token.
    pub found: Token,
    /// Why the token was refused, when its kind alone does not say.
    pub detail: Option<String>,
}

fn describe_expected(expected: &[TokenKind]) -> String {
    match expected {
        [] => "more input".to_string(),
        [one] => one.to_string(),
        many => {
            let names: Vec<String> = many.iter().map(ToString::to_string).collect();
            format!("one of {}", names.join(", "))
        }
    }
}

/// Parses a token stream into a query.
///
/// # Errors
///
/// Returns a [`ParseError`] naming the expected token kinds and the token
/// found instead.
pub fn parse(tokens: &[Token]) -> Result<Query, ParseError> {
    if tokens.last().is_some_and(|t| t.kind == TokenKind::Eof) {
        return Parser::new(tokens).run();
    }

    let last = tokens.last();
    let end = last.map_or(0, |t| t.end);
    let mut terminated = tokens.to_vec();
    terminated.push(Token {
        kind: TokenKind::Eof,
        text: String::new(),
        value: None,
        start: end,
        end,
        line: last.map_or(1, |t| t.line),
        column: last.map_or(1, |t| t.column + t.text.chars().count()),
    });
    Parser::new(&terminated).run()
}

/// Tokenizes and parses query text.
///
/// # Errors
///
/// Returns [`QueryError::Lex`] or [`QueryError::Parse`].
///
/// # Examples
///
/// ```
/// use engine::query::{parse_query, Operation};
///
/// let query = parse_query("SecurityEvent | where EventID == 4625 | take 10").unwrap();
/// assert_eq!(query.pipeline.len(), 2);
/// assert!(matches!(query.pipeline[1], Operation::Limit(10)));
/// ```
pub fn parse_query(text: &str) -> Result<Query, QueryError> {
    let tokens = tokenize(text)?;
    Ok(parse(&tokens)?)
}

const PRIMARY_STARTERS: [TokenKind; 9] = [
    TokenKind::Identifier,
    TokenKind::Symbol(Symbol::LParen),
    TokenKind::StringLiteral,
    TokenKind::NumberLiteral,
    TokenKind::DatetimeLiteral,
    TokenKind::TimespanLiteral,
    TokenKind::GuidLiteral,
    TokenKind::Keyword(Keyword::Not),
    TokenKind::Symbol(Symbol::Minus),
];

const OPERATION_STARTERS: [TokenKind; 10] = [
    TokenKind::Keyword(Keyword::Where),
    TokenKind::Keyword(Keyword::Project),
    TokenKind::Keyword(Keyword::Extend),
    TokenKind::Keyword(Keyword::Summarize),
    TokenKind::Keyword(Keyword::Order),
    TokenKind::Keyword(Keyword::Top),
    TokenKind::Keyword(Keyword::Limit),
    TokenKind::Keyword(Keyword::Distinct),
    TokenKind::Keyword(Keyword::Join),
    TokenKind::Keyword(Keyword::Union),
];

enum InfixOp {
    Binary(BinaryOp),
    In { negated: bool },
}

struct Parser<'t> {
    /// Never empty; the last token is `Eof`.
    tokens: &'t [Token],
    pos: usize,
    expected: Vec<TokenKind>,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            expected: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Query, ParseError> {
        let query = self.query()?;
        self.expect(TokenKind::Eof)?;
        Ok(query)
    }

    // ========================================================================
    // Token helpers
    // ========================================================================

    fn peek(&self) -> &'t Token {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &'t Token {
        let tokens: &'t [Token] = self.tokens;
        &tokens[(self.pos + ahead).min(tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn advance(&mut self) -> &'t Token {
        let token = self.peek();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        self.expected.clear();
        token
    }

    fn check(&mut self, kind: TokenKind) -> bool {
        let hit = self.peek_kind() == kind;
        if !hit {
            self.expected.push(kind);
        }
        hit
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        let hit = self.check(kind);
        if hit {
            self.advance();
        }
        hit
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        self.eat(TokenKind::Keyword(keyword))
    }

    fn eat_symbol(&mut self, symbol: Symbol) -> bool {
        self.eat(TokenKind::Symbol(symbol))
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&'t Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error())
        }
    }

    fn error(&self) -> ParseError {
        let mut expected: Vec<TokenKind> = Vec::with_capacity(self.expected.len());
        for kind in &self.expected {
            if !expected.contains(kind) {
                expected.push(*kind);
            }
        }
        ParseError {
            expected,
            found: self.peek().clone(),
            detail: None,
        }
    }

    fn error_expecting(&mut self, kinds: &[TokenKind]) -> ParseError {
        self.expected.extend_from_slice(kinds);
        self.error()
    }

    /// Any identifier or keyword, returned as a name.
    fn name(&mut self) -> Result<String, ParseError> {
        if self.peek().is_word() {
            Ok(self.advance().text.clone())
        } else {
            Err(self.error_expecting(&[TokenKind::Identifier]))
        }
    }

    /// Lowercased text of the current token if it is a word.
    fn peek_word(&self) -> Option<String> {
        let token = self.peek();
        token.is_word().then(|| token.text.to_ascii_lowercase())
    }

    fn count(&mut self) -> Result<u64, ParseError> {
        if !self.check(TokenKind::NumberLiteral) {
            return Err(self.error());
        }
        let token = self.peek();
        let parsed = match token.value {
            Some(Value::Long(n)) => u64::try_from(n).ok(),
            // integers past i64 lex as reals; counts may still fit a u64
            _ if token.text.bytes().all(|b| b.is_ascii_digit()) => token.text.parse::<u64>().ok(),
            _ => None,
        };
        match parsed {
            Some(n) => {
                self.advance();
                Ok(n)
            }
            None => {
                let detail = if token.text.contains(['.', 'e', 'E']) {
                    "row count must be a whole number"
                } else {
                    "row count out of range"
                };
                let mut err = self.error_expecting(&[TokenKind::NumberLiteral]);
                err.detail = Some(detail.to_string());
                Err(err)
            }
        }
    }

    // ========================================================================
    // Query and table expressions
    // ========================================================================

    fn query(&mut self) -> Result<Query, ParseError> {
        let source = self.table_expression()?;
        let mut pipeline = Vec::new();
        while self.eat_symbol(Symbol::Pipe) {
            pipeline.push(self.operation()?);
        }
        Ok(Query { source, pipeline })
    }

    fn table_expression(&mut self) -> Result<TableExpression, ParseError> {
        let expr = if self.eat_symbol(Symbol::LParen) {
            let query = self.query()?;
            self.expect(TokenKind::Symbol(Symbol::RParen))?;
            TableExpression::Subquery {
                query: Box::new(query),
                alias: None,
            }
        } else {
            TableExpression::Table {
                name: self.name()?,
                alias: None,
            }
        };

        if !self.eat_keyword(Keyword::As) {
            return Ok(expr);
        }
        let alias = Some(self.name()?);
        Ok(match expr {
            TableExpression::Table { name, .. } => TableExpression::Table { name, alias },
            TableExpression::Subquery { query, .. } => TableExpression::Subquery { query, alias },
        })
    }

    // ========================================================================
    // Operations
    // ========================================================================

    fn operation(&mut self) -> Result<Operation, ParseError> {
        let Some(word) = self.peek_word() else {
            return Err(self.error_expecting(&OPERATION_STARTERS));
        };

        match word.as_str() {
            "where" => {
                self.advance();
                Ok(Operation::Where(self.expr()?))
            }
            "project" => {
                self.advance();
                Ok(Operation::Project(self.items()?))
            }
            "extend" => {
                self.advance();
                Ok(Operation::Extend(self.items()?))
            }
            "summarize" => {
                self.advance();
                self.summarize()
            }
            "order" | "sort" => {
                self.advance();
                self.expect(TokenKind::Keyword(Keyword::By))?;
                let mut keys = vec![self.sort_key()?];
                while self.eat_symbol(Symbol::Comma) {
                    keys.push(self.sort_key()?);
                }
                Ok(Operation::OrderBy(keys))
            }
            "top" => {
                self.advance();
                let count = self.count()?;
                let by = if self.eat_keyword(Keyword::By) {
                    Some(self.sort_key()?)
                } else {
                    None
                };
                Ok(Operation::Top { count, by })
            }
            "limit" | "take" => {
                self.advance();
                Ok(Operation::Limit(self.count()?))
            }
            "distinct" => {
                self.advance();
                if self.eat_symbol(Symbol::Star) {
                    return Ok(Operation::Distinct(None));
                }
                let mut exprs = vec![self.expr()?];
                while self.eat_symbol(Symbol::Comma) {
                    exprs.push(self.expr()?);
                }
                Ok(Operation::Distinct(Some(exprs)))
            }
            "join" => {
                self.advance();
                self.join()
            }
            "union" => {
                self.advance();
                self.union()
            }
            _ => Err(self.error_expecting(&OPERATION_STARTERS)),
        }
    }

    fn summarize(&mut self) -> Result<Operation, ParseError> {
        let aggregations = if self.check(TokenKind::Keyword(Keyword::By)) {
            Vec::new()
        } else {
            self.items()?
        };
        let group_by = if self.eat_keyword(Keyword::By) {
            self.items()?
        } else {
            Vec::new()
        };
        Ok(Operation::Summarize {
            aggregations,
            group_by,
        })
    }

    fn items(&mut self) -> Result<Vec<ProjectItem>, ParseError> {
        let mut items = vec![self.item()?];
        while self.eat_symbol(Symbol::Comma) {
            items.push(self.item()?);
        }
        Ok(items)
    }

    fn item(&mut self) -> Result<ProjectItem, ParseError> {
        let named = self.peek().is_word() && self.peek_at(1).is_symbol(Symbol::Eq);
        if named {
            let alias = self.advance().text.clone();
            self.advance();
            return Ok(ProjectItem::named(alias, self.expr()?));
        }
        Ok(ProjectItem::new(self.expr()?))
    }

    fn sort_key(&mut self) -> Result<SortKey, ParseError> {
        let expr = self.expr()?;
        let order = if self.eat_keyword(Keyword::Asc) {
            SortOrder::Asc
        } else if self.eat_keyword(Keyword::Desc) {
            SortOrder::Desc
        } else {
            SortOrder::default()
        };
        Ok(SortKey { expr, order })
    }

    /// Parses `kind = <word>` and returns the lowercased word, if present.
    fn kind_option(&mut self) -> Result<Option<(String, &'t Token)>, ParseError> {
        if !self.eat_keyword(Keyword::Kind) {
            return Ok(None);
        }
        self.expect(TokenKind::Symbol(Symbol::Eq))?;
        let token = self.peek();
        let word = self.name()?;
        Ok(Some((word.to_ascii_lowercase(), token)))
    }

    fn join(&mut self) -> Result<Operation, ParseError> {
        let kind = match self.kind_option()? {
            None => JoinKind::Inner,
            Some((word, token)) => match word.as_str() {
                "inner" | "innerunique" => JoinKind::Inner,
                "left" | "leftouter" => JoinKind::Left,
                "right" | "rightouter" => JoinKind::Right,
                "full" | "fullouter" => JoinKind::Full,
                _ => {
                    return Err(ParseError {
                        expected: vec![TokenKind::Identifier],
                        found: token.clone(),
                        detail: Some(format!("unknown join kind '{word}'")),
                    })
                }
            },
        };

        let right = self.table_expression()?;
        self.expect(TokenKind::Keyword(Keyword::On))?;

        let mut terms = vec![self.join_term()?];
        while self.eat_symbol(Symbol::Comma) {
            terms.push(self.join_term()?);
        }
        let on = terms
            .into_iter()
            .reduce(Expr::and)
            .ok_or_else(|| self.error())?;

        Ok(Operation::Join { kind, right, on })
    }

    /// `Column` (same-name equality) or an expression over `$left`/`$right`.
    fn join_term(&mut self) -> Result<Expr, ParseError> {
        Ok(match self.expr()? {
            Expr::ColumnRef(name) if !name.starts_with('$') => Expr::binary(
                BinaryOp::Eq,
                Expr::ColumnRef(format!("$left.{name}")),
                Expr::ColumnRef(format!("$right.{name}")),
            ),
            other => other,
        })
    }

    fn union(&mut self) -> Result<Operation, ParseError> {
        let kind = match self.kind_option()? {
            None => UnionKind::default(),
            Some((word, token)) => match word.as_str() {
                "all" => UnionKind::All,
                "distinct" => UnionKind::Distinct,
                _ => {
                    return Err(ParseError {
                        expected: vec![
                            TokenKind::Identifier,
                            TokenKind::Keyword(Keyword::Distinct),
                        ],
                        found: token.clone(),
                        detail: Some(format!("unknown union kind '{word}'")),
                    })
                }
            },
        };

        let mut others = vec![self.table_expression()?];
        while self.eat_symbol(Symbol::Comma) {
            others.push(self.table_expression()?);
        }
        Ok(Operation::Union { kind, others })
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.binary(1)
    }

    fn peek_infix(&self) -> Option<(InfixOp, usize)> {
        let next = self.peek_at(1);
        let op = match self.peek().kind {
            TokenKind::Symbol(symbol) => match symbol {
                Symbol::EqEq => BinaryOp::Eq,
                Symbol::NotEq | Symbol::LtGt => BinaryOp::NotEq,
                Symbol::Lt => BinaryOp::Lt,
                Symbol::LtEq => BinaryOp::LtEq,
                Symbol::Gt => BinaryOp::Gt,
                Symbol::GtEq => BinaryOp::GtEq,
                Symbol::TildeEq => BinaryOp::EqTilde,
                Symbol::BangTilde => BinaryOp::NotEqTilde,
                Symbol::Plus => BinaryOp::Add,
                Symbol::Minus => BinaryOp::Sub,
                Symbol::Star => BinaryOp::Mul,
                Symbol::Slash => BinaryOp::Div,
                Symbol::Percent => BinaryOp::Mod,
                Symbol::Bang => {
                    let negated = match next.kind {
                        TokenKind::Keyword(Keyword::Contains) => BinaryOp::NotContains,
                        TokenKind::Keyword(Keyword::Has) => BinaryOp::NotHas,
                        TokenKind::Keyword(Keyword::StartsWith) => BinaryOp::NotStartsWith,
                        TokenKind::Keyword(Keyword::EndsWith) => BinaryOp::NotEndsWith,
                        TokenKind::Keyword(Keyword::In) => {
                            return Some((InfixOp::In { negated: true }, 2))
                        }
                        _ => return None,
                    };
                    return Some((InfixOp::Binary(negated), 2));
                }
                _ => return None,
            },
            TokenKind::Keyword(keyword) => match keyword {
                Keyword::And => BinaryOp::And,
                Keyword::Or => BinaryOp::Or,
                Keyword::Contains => BinaryOp::Contains,
                Keyword::Has => BinaryOp::Has,
                Keyword::StartsWith => BinaryOp::StartsWith,
                Keyword::EndsWith => BinaryOp::EndsWith,
                Keyword::In => return Some((InfixOp::In { negated: false }, 1)),
                Keyword::Matches if next.is_keyword(Keyword::Regex) => {
                    return Some((InfixOp::Binary(BinaryOp::MatchesRegex), 2))
                }
                _ => return None,
            },
            _ => return None,
        };
        Some((InfixOp::Binary(op), 1))
    }

    fn binary(&mut self, min_precedence: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;

        while let Some((op, width)) = self.peek_infix() {
            let precedence = match &op {
                InfixOp::Binary(op) => op.precedence(),
                InfixOp::In { .. } => 3,
            };
            if precedence < min_precedence {
                break;
            }
            for _ in 0..width {
                self.advance();
            }

            lhs = match op {
                InfixOp::Binary(op) => {
                    let rhs = self.binary(precedence + 1)?;
                    Expr::binary(op, lhs, rhs)
                }
                InfixOp::In { negated } => {
                    self.expect(TokenKind::Symbol(Symbol::LParen))?;
                    let list = self.arguments()?;
                    Expr::InList {
                        expr: Box::new(lhs),
                        list,
                        negated,
                    }
                }
            };
        }

        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek_kind() {
            TokenKind::Keyword(Keyword::Not) => {
                self.advance();
                Ok(Expr::unary(UnaryOp::Not, self.unary()?))
            }
            TokenKind::Symbol(Symbol::Minus) => {
                self.advance();
                let negated = match self.peek_kind() {
                    TokenKind::NumberLiteral | TokenKind::TimespanLiteral => {
                        match &self.peek().value {
                            Some(Value::Long(i)) => Some(Value::Long(-i)),
                            // -9223372036854775808 only fits once negated
                            Some(Value::Real(r)) => Some(
                                format!("-{}", self.peek().text)
                                    .parse::<i64>()
                                    .map_or(Value::Real(-r), Value::Long),
                            ),
                            Some(Value::Timespan(ts)) => Some(Value::Timespan(-*ts)),
                            _ => None,
                        }
                    }
                    _ => None,
                };
                match negated {
                    Some(value) => {
                        self.advance();
                        Ok(Expr::Literal(value))
                    }
                    None => Ok(Expr::unary(UnaryOp::Neg, self.unary()?)),
                }
            }
            _ => self.primary(),
        }
    }

    /// Comma-separated expressions up to and including `)`. The opening
    /// parenthesis has already been consumed.
    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat_symbol(Symbol::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat_symbol(Symbol::Comma) {
                continue;
            }
            self.expect(TokenKind::Symbol(Symbol::RParen))?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek();

        match token.kind {
            TokenKind::StringLiteral
            | TokenKind::NumberLiteral
            | TokenKind::DatetimeLiteral
            | TokenKind::TimespanLiteral
            | TokenKind::GuidLiteral => {
                self.advance();
                Ok(Expr::Literal(token.value.clone().unwrap_or(Value::Null)))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::Keyword(Keyword::Case) => {
                self.advance();
                self.case()
            }
            TokenKind::Symbol(Symbol::LParen) => {
                self.advance();
                let inner = self.expr()?;
                self.expect(TokenKind::Symbol(Symbol::RParen))?;
                Ok(inner)
            }
            TokenKind::Identifier | TokenKind::Keyword(_) => {
                self.advance();
                let name = token.text.clone();
                if name.starts_with('$') {
                    self.expect(TokenKind::Symbol(Symbol::Dot))?;
                    let column = self.name()?;
                    return Ok(Expr::ColumnRef(format!("{name}.{column}")));
                }
                if self.eat_symbol(Symbol::LParen) {
                    let args = self.arguments()?;
                    return Ok(Expr::FunctionCall { name, args });
                }
                Ok(Expr::ColumnRef(name))
            }
            _ => Err(self.error_expecting(&PRIMARY_STARTERS)),
        }
    }

    /// `case when B then E ... else E` or `case(p1, v1, ..., else)`.
    fn case(&mut self) -> Result<Expr, ParseError> {
        if self.eat_symbol(Symbol::LParen) {
            let mut args = self.arguments()?;
            if args.len() < 3 || args.len() % 2 == 0 {
                return Err(ParseError {
                    expected: vec![TokenKind::Symbol(Symbol::Comma)],
                    found: self.tokens[self.pos.saturating_sub(1)].clone(),
                    detail: Some("case() takes condition and value pairs plus an else value".to_string()),
                });
            }
            let otherwise = args.pop().unwrap_or(Expr::Literal(Value::Null));
            let mut branches = Vec::with_capacity(args.len() / 2);
            let mut rest = args.into_iter();
            while let (Some(when), Some(then)) = (rest.next(), rest.next()) {
                branches.push(CaseBranch { when, then });
            }
            return Ok(Expr::Case {
                branches,
                otherwise: Box::new(otherwise),
            });
        }

        let mut branches = Vec::new();
        while self.eat_keyword(Keyword::When) {
            let when = self.expr()?;
            self.expect(TokenKind::Keyword(Keyword::Then))?;
            let then = self.expr()?;
            branches.push(CaseBranch { when, then });
        }
        if branches.is_empty() {
            return Err(self.error());
        }
        self.expect(TokenKind::Keyword(Keyword::Else))?;
        let otherwise = self.expr()?;
        Ok(Expr::Case {
            branches,
            otherwise: Box::new(otherwise),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
