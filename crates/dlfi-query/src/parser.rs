//! Recursive-descent parser for the query language
//!
//! Grammar:
//! ```text
//! Expr  := Or
//! Or    := And ('|' And)*
//! And   := Unary (WS Unary)*
//! Unary := '-'? Atom
//! Atom  := Clause | '(' Expr ')'
//! ```
//! An empty query parses to [`Expr::All`], the universe of nodes.

use crate::lexer::{tokenize, Token, TokenKind};
use dlfi_core::{path, DlfiError, NodeType, Result};

/// A literal scalar in a `meta.<key>=<value>` clause
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
}

/// The smallest filter unit
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Descendants of the node at a path, recursive
    Inside(String),
    Type(NodeType),
    Tag(String),
    MetaEq { key: String, value: Scalar },
    MetaLike { key: String, needle: String },
    Rel { relation: String, target: String },
    ContainsRel { relation: String, target: String },
    NameLike(String),
    PathLike(String),
    /// Records with a binding whose blob extension matches
    Ext(String),
}

/// Parsed query expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Empty query: every node
    All,
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Clause(Clause),
}

pub fn parse(input: &str) -> Result<Expr> {
    let mut parser = Parser {
        tokens: tokenize(input),
        pos: 0,
    };
    if parser.current().kind == TokenKind::Eof {
        return Ok(Expr::All);
    }
    let expr = parser.parse_or()?;
    match parser.current().kind {
        TokenKind::Eof => Ok(expr),
        TokenKind::RParen => Err(parse_error(parser.current(), "unmatched ')'")),
        _ => Err(parse_error(parser.current(), "unexpected token")),
    }
}

fn parse_error(token: &Token, message: &str) -> DlfiError {
    DlfiError::QueryParse {
        offset: token.offset,
        message: message.to_string(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.current().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut branches = vec![self.parse_and()?];
        while self.eat(TokenKind::Pipe) {
            branches.push(self.parse_and()?);
        }
        if branches.len() == 1 {
            Ok(branches.pop().expect("one branch"))
        } else {
            Ok(Expr::Or(branches))
        }
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut parts = Vec::new();
        loop {
            match self.current().kind {
                TokenKind::Eof | TokenKind::Pipe | TokenKind::RParen => break,
                _ => parts.push(self.parse_unary()?),
            }
        }
        match parts.len() {
            0 => Err(parse_error(self.current(), "expected a clause")),
            1 => Ok(parts.pop().expect("one part")),
            _ => Ok(Expr::And(parts)),
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(TokenKind::Minus) {
            Ok(Expr::Not(Box::new(self.parse_atom()?)))
        } else {
            self.parse_atom()
        }
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        if self.eat(TokenKind::LParen) {
            let inner = self.parse_or()?;
            if !self.eat(TokenKind::RParen) {
                return Err(parse_error(self.current(), "expected ')'"));
            }
            return Ok(inner);
        }
        self.parse_clause().map(Expr::Clause)
    }

    fn parse_clause(&mut self) -> Result<Clause> {
        let field = match self.current().kind {
            TokenKind::Text => self.advance(),
            _ => return Err(parse_error(self.current(), "expected a clause")),
        };

        if let Some(key) = field.text.strip_prefix("meta.") {
            if key.is_empty() {
                return Err(parse_error(&field, "empty metadata key"));
            }
            let key = key.to_string();
            return if self.eat(TokenKind::Equals) {
                let (value, quoted) = self.expect_value()?;
                Ok(Clause::MetaEq {
                    key,
                    value: parse_scalar(&value, quoted),
                })
            } else if self.eat(TokenKind::Tilde) {
                let (needle, _) = self.expect_value()?;
                Ok(Clause::MetaLike { key, needle })
            } else {
                Err(parse_error(
                    self.current(),
                    "expected '=' or '~' after metadata key",
                ))
            };
        }

        match field.text.as_str() {
            "inside" => {
                self.expect_colon()?;
                let (value, _) = self.expect_value()?;
                Ok(Clause::Inside(value))
            }
            "type" => {
                self.expect_colon()?;
                let (value, _) = self.expect_value()?;
                match NodeType::parse(value.to_uppercase().as_str()) {
                    Some(node_type) => Ok(Clause::Type(node_type)),
                    None => Err(parse_error(self.current(), "expected VAULT or RECORD")),
                }
            }
            "tag" => {
                self.expect_colon()?;
                let (value, _) = self.expect_value()?;
                Ok(Clause::Tag(path::normalize_tag(&value)))
            }
            "name" => {
                self.expect_colon()?;
                let (value, _) = self.expect_value()?;
                Ok(Clause::NameLike(value))
            }
            "path" => {
                self.expect_colon()?;
                let (value, _) = self.expect_value()?;
                Ok(Clause::PathLike(value))
            }
            "ext" => {
                self.expect_colon()?;
                let (value, _) = self.expect_value()?;
                Ok(Clause::Ext(value.trim_start_matches('.').to_lowercase()))
            }
            "rel" | "contains-rel" => {
                self.expect_colon()?;
                let relation = match self.current().kind {
                    TokenKind::Text => self.advance(),
                    _ => return Err(parse_error(self.current(), "expected a relation label")),
                };
                if !path::valid_relation(&relation.text) {
                    return Err(parse_error(&relation, "invalid relation label"));
                }
                if !self.eat(TokenKind::Equals) {
                    return Err(parse_error(self.current(), "expected '=' after relation"));
                }
                let (target, _) = self.expect_value()?;
                if field.text == "rel" {
                    Ok(Clause::Rel {
                        relation: relation.text,
                        target,
                    })
                } else {
                    Ok(Clause::ContainsRel {
                        relation: relation.text,
                        target,
                    })
                }
            }
            _ => Err(parse_error(&field, "unknown field")),
        }
    }

    fn expect_colon(&mut self) -> Result<()> {
        if self.eat(TokenKind::Colon) {
            Ok(())
        } else {
            Err(parse_error(self.current(), "expected ':'"))
        }
    }

    /// A value token: bare text or a quoted string. Returns the text and
    /// whether it was quoted (quoted values are always string literals).
    fn expect_value(&mut self) -> Result<(String, bool)> {
        match self.current().kind {
            TokenKind::Text => Ok((self.advance().text, false)),
            TokenKind::Quoted => Ok((self.advance().text, true)),
            _ => Err(parse_error(self.current(), "expected a value")),
        }
    }
}

fn parse_scalar(raw: &str, quoted: bool) -> Scalar {
    if quoted {
        return Scalar::Str(raw.to_string());
    }
    match raw {
        "null" => Scalar::Null,
        "true" => Scalar::Bool(true),
        "false" => Scalar::Bool(false),
        _ => match raw.parse::<i64>() {
            Ok(n) => Scalar::Int(n),
            Err(_) => Scalar::Str(raw.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clause(input: &str) -> Clause {
        match parse(input).unwrap() {
            Expr::Clause(c) => c,
            other => panic!("expected clause, got {other:?}"),
        }
    }

    #[test]
    fn empty_query_is_universe() {
        assert_eq!(parse("").unwrap(), Expr::All);
        assert_eq!(parse("   ").unwrap(), Expr::All);
    }

    #[test]
    fn single_clauses() {
        assert_eq!(clause("inside:m/jojo"), Clause::Inside("m/jojo".into()));
        assert_eq!(clause("type:VAULT"), Clause::Type(NodeType::Vault));
        assert_eq!(clause("type:record"), Clause::Type(NodeType::Record));
        assert_eq!(clause("tag:Nature"), Clause::Tag("nature".into()));
        assert_eq!(clause("name:jojo"), Clause::NameLike("jojo".into()));
        assert_eq!(clause("ext:.JPG"), Clause::Ext("jpg".into()));
    }

    #[test]
    fn meta_clauses_type_values() {
        assert_eq!(
            clause("meta.year=2023"),
            Clause::MetaEq {
                key: "year".into(),
                value: Scalar::Int(2023)
            }
        );
        assert_eq!(
            clause("meta.done=true"),
            Clause::MetaEq {
                key: "done".into(),
                value: Scalar::Bool(true)
            }
        );
        assert_eq!(
            clause("meta.note=null"),
            Clause::MetaEq {
                key: "note".into(),
                value: Scalar::Null
            }
        );
        assert_eq!(
            clause("meta.year=\"2023\""),
            Clause::MetaEq {
                key: "year".into(),
                value: Scalar::Str("2023".into())
            }
        );
        assert_eq!(
            clause("meta.title~jojo"),
            Clause::MetaLike {
                key: "title".into(),
                needle: "jojo".into()
            }
        );
    }

    #[test]
    fn rel_clauses() {
        assert_eq!(
            clause("rel:AUTHORED_BY=people/araki"),
            Clause::Rel {
                relation: "AUTHORED_BY".into(),
                target: "people/araki".into()
            }
        );
        assert_eq!(
            clause("contains-rel:AUTHORED_BY=people/araki"),
            Clause::ContainsRel {
                relation: "AUTHORED_BY".into(),
                target: "people/araki".into()
            }
        );
    }

    #[test]
    fn boolean_structure() {
        let expr = parse("(tag:nature | tag:landscape) -meta.year=2023").unwrap();
        let Expr::And(parts) = expr else {
            panic!("expected And");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], Expr::Or(branches) if branches.len() == 2));
        assert!(matches!(&parts[1], Expr::Not(_)));
    }

    #[test]
    fn intersection_is_implicit() {
        let expr = parse("type:VAULT contains-rel:AUTHORED_BY=people/araki").unwrap();
        assert!(matches!(expr, Expr::And(parts) if parts.len() == 2));
    }

    #[test]
    fn errors_carry_offsets() {
        let err = parse("bogus:x").unwrap_err();
        let DlfiError::QueryParse { offset, message } = err else {
            panic!("expected parse error");
        };
        assert_eq!(offset, 0);
        assert!(message.contains("unknown field"));

        let err = parse("tag:a | ").unwrap_err();
        assert!(matches!(err, DlfiError::QueryParse { .. }));

        let err = parse("(tag:a").unwrap_err();
        let DlfiError::QueryParse { message, .. } = err else {
            panic!("expected parse error");
        };
        assert!(message.contains("')'"));

        let err = parse("rel:lowercase=x").unwrap_err();
        let DlfiError::QueryParse { offset, .. } = err else {
            panic!("expected parse error");
        };
        assert_eq!(offset, 4);
    }

    #[test]
    fn meta_requires_operator() {
        let err = parse("meta.year").unwrap_err();
        let DlfiError::QueryParse { message, .. } = err else {
            panic!("expected parse error");
        };
        assert!(message.contains("'='"));
    }
}
