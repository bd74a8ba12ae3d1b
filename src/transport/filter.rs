//! Subscription filter expressions
//!
//! Supported syntax, evaluated against message attributes:
//!
//! ```text
//! attributes:KEY                      key is present
//! attributes.KEY = "value"            key equals value
//! attributes.KEY != "value"           key is absent or differs
//! hasPrefix(attributes.KEY, "p")      key starts with prefix
//! NOT expr | -expr                    negation
//! expr AND expr | expr OR expr        conjunction / disjunction
//! ( expr )                            grouping
//! ```
//!
//! `AND` and `OR` cannot be mixed at one level without parentheses.

use crate::attributes::Attributes;
use std::fmt;
use thiserror::Error;

/// Filter parse failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filter at offset {offset}: {reason}")]
pub struct FilterError {
    pub offset: usize,
    pub reason: String,
}

/// Parsed filter expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    source: String,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Has(String),
    Equals(String, String),
    NotEquals(String, String),
    HasPrefix(String, String),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Filter {
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let expr = parser.expr()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(FilterError {
                offset: *offset,
                reason: format!("unexpected {token}"),
            });
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.expr.eval(attributes)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Expr {
    fn eval(&self, attributes: &Attributes) -> bool {
        match self {
            Expr::Has(key) => attributes.contains_key(key),
            Expr::Equals(key, value) => attributes.get(key) == Some(value),
            Expr::NotEquals(key, value) => attributes.get(key) != Some(value),
            Expr::HasPrefix(key, prefix) => attributes
                .get(key)
                .is_some_and(|v| v.starts_with(prefix.as_str())),
            Expr::Not(inner) => !inner.eval(attributes),
            Expr::And(terms) => terms.iter().all(|t| t.eval(attributes)),
            Expr::Or(terms) => terms.iter().any(|t| t.eval(attributes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Colon,
    Dot,
    Equals,
    NotEquals,
    Minus,
    Str(String),
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::Colon => f.write_str("':'"),
            Token::Dot => f.write_str("'.'"),
            Token::Equals => f.write_str("'='"),
            Token::NotEquals => f.write_str("'!='"),
            Token::Minus => f.write_str("'-'"),
            Token::Str(s) => write!(f, "string \"{s}\""),
            Token::Ident(s) => write!(f, "'{s}'"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '.' => Token::Dot,
            '=' => Token::Equals,
            '-' => Token::Minus,
            '!' => match chars.next() {
                Some((_, '=')) => Token::NotEquals,
                _ => {
                    return Err(FilterError {
                        offset,
                        reason: "expected '=' after '!'".to_string(),
                    })
                }
            },
            '"' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        Some((_, c)) => value.push(c),
                        None => {
                            return Err(FilterError {
                                offset,
                                reason: "unterminated string".to_string(),
                            })
                        }
                    }
                }
                Token::Str(value)
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut ident = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' || next == '-' {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                Token::Ident(ident)
            }
            other => {
                return Err(FilterError {
                    offset,
                    reason: format!("unexpected character '{other}'"),
                })
            }
        };
        tokens.push((offset, token));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(o, _)| *o)
    }

    fn error(&self, reason: impl Into<String>) -> FilterError {
        FilterError {
            offset: self.offset(),
            reason: reason.into(),
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), FilterError> {
        match self.peek() {
            Some(token) if *token == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(token) => Err(self.error(format!("expected {expected}, found {token}"))),
            None => Err(self.error(format!("expected {expected}, found end of filter"))),
        }
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(ident)) if ident == word)
    }

    fn expr(&mut self) -> Result<Expr, FilterError> {
        let first = self.term()?;
        let mut terms = vec![first];
        let mut joiner: Option<&'static str> = None;

        loop {
            let word = if self.keyword("AND") {
                "AND"
            } else if self.keyword("OR") {
                "OR"
            } else {
                break;
            };

            match joiner {
                Some(current) if current != word => {
                    return Err(self.error("AND and OR must be separated by parentheses"));
                }
                _ => joiner = Some(word),
            }
            self.pos += 1;
            terms.push(self.term()?);
        }

        Ok(match joiner {
            None => terms.remove(0),
            Some("AND") => Expr::And(terms),
            Some(_) => Expr::Or(terms),
        })
    }

    fn term(&mut self) -> Result<Expr, FilterError> {
        if self.keyword("NOT") || self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.term()?)));
        }

        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }

        if self.keyword("hasPrefix") {
            self.pos += 1;
            self.expect(Token::LParen)?;
            self.expect_attributes()?;
            self.expect(Token::Dot)?;
            let key = self.key()?;
            self.expect(Token::Comma)?;
            let prefix = self.string()?;
            self.expect(Token::RParen)?;
            return Ok(Expr::HasPrefix(key, prefix));
        }

        self.expect_attributes()?;
        match self.next() {
            Some(Token::Colon) => Ok(Expr::Has(self.key()?)),
            Some(Token::Dot) => {
                let key = self.key()?;
                match self.next() {
                    Some(Token::Equals) => Ok(Expr::Equals(key, self.string()?)),
                    Some(Token::NotEquals) => Ok(Expr::NotEquals(key, self.string()?)),
                    _ => Err(self.error("expected '=' or '!=' after attribute key")),
                }
            }
            _ => Err(self.error("expected ':' or '.' after 'attributes'")),
        }
    }

    fn expect_attributes(&mut self) -> Result<(), FilterError> {
        if self.keyword("attributes") {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error("expected 'attributes'"))
        }
    }

    fn key(&mut self) -> Result<String, FilterError> {
        match self.next() {
            Some(Token::Ident(key)) | Some(Token::Str(key)) => Ok(key),
            _ => Err(self.error("expected attribute key")),
        }
    }

    fn string(&mut self) -> Result<String, FilterError> {
        match self.next() {
            Some(Token::Str(value)) => Ok(value),
            _ => Err(self.error("expected quoted string")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn matches(filter: &str, pairs: &[(&str, &str)]) -> bool {
        Filter::parse(filter).unwrap().matches(&attrs(pairs))
    }

    #[test]
    fn presence() {
        assert!(matches("attributes:region", &[("region", "eu")]));
        assert!(!matches("attributes:region", &[("zone", "a")]));
    }

    #[test]
    fn equality_and_inequality() {
        assert!(matches(r#"attributes.region = "eu""#, &[("region", "eu")]));
        assert!(!matches(r#"attributes.region = "eu""#, &[("region", "us")]));
        assert!(matches(r#"attributes.region != "eu""#, &[("region", "us")]));
        assert!(matches(r#"attributes.region != "eu""#, &[]));
    }

    #[test]
    fn prefix() {
        let filter = r#"hasPrefix(attributes.event, "guild.")"#;
        assert!(matches(filter, &[("event", "guild.join")]));
        assert!(!matches(filter, &[("event", "member.join")]));
        assert!(!matches(filter, &[]));
    }

    #[test]
    fn negation() {
        assert!(matches("NOT attributes:debug", &[]));
        assert!(!matches("-attributes:debug", &[("debug", "1")]));
    }

    #[test]
    fn conjunction_disjunction_and_grouping() {
        let filter = r#"attributes.region = "eu" AND (attributes:vip OR attributes.tier = "gold")"#;
        assert!(matches(filter, &[("region", "eu"), ("vip", "")]));
        assert!(matches(filter, &[("region", "eu"), ("tier", "gold")]));
        assert!(!matches(filter, &[("region", "us"), ("vip", "")]));
        assert!(!matches(filter, &[("region", "eu")]));
    }

    #[test]
    fn quoted_keys_and_escapes() {
        assert!(matches(
            r#"attributes."x region" = "a \"b\"""#,
            &[("x region", r#"a "b""#)]
        ));
        assert!(matches(r#"attributes.x-region = "eu""#, &[("x-region", "eu")]));
    }

    #[test]
    fn mixing_and_or_requires_parentheses() {
        let err = Filter::parse("attributes:a AND attributes:b OR attributes:c").unwrap_err();
        assert!(err.reason.contains("parentheses"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Filter::parse("").is_err());
        assert!(Filter::parse("region = \"eu\"").is_err());
        assert!(Filter::parse("attributes.region = eu").is_err());
        assert!(Filter::parse("attributes.region = \"eu").is_err());
        assert!(Filter::parse("(attributes:a").is_err());
        assert!(Filter::parse("attributes:a attributes:b").is_err());
    }

    #[test]
    fn keeps_source_text() {
        let filter = Filter::parse("attributes:a").unwrap();
        assert_eq!(filter.to_string(), "attributes:a");
        assert_eq!(filter.as_str(), "attributes:a");
    }
}
