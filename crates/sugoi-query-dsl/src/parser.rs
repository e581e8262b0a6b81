//! Filter DSL parser
//!
//! Parses filter strings into a structured term list.

use std::fmt;

/// A parsed filter containing one or more terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub terms: Vec<Term>,
}

impl Query {
    /// Names of every term that must be present (`And` operator, single name).
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.terms
            .iter()
            .filter(|t| t.operator == Operator::And && t.names.len() == 1)
            .map(|t| t.names[0].as_str())
    }

    /// Names of every excluded term.
    pub fn excluded(&self) -> impl Iterator<Item = &str> {
        self.terms
            .iter()
            .filter(|t| t.operator == Operator::Not)
            .flat_map(|t| t.names.iter().map(String::as_str))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}

/// A single comma-separated term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    /// Access requested for the component data.
    pub access: Access,
    /// Whether the term touches entities outside the iterated chunk.
    pub order: Order,
    pub operator: Operator,
    /// `$` prefix: the component is read through meta entities.
    pub shared: bool,
    /// One name, or several joined by `|`.
    pub names: Vec<String>,
    /// Byte offset of the term in the source string.
    pub position: usize,
}

impl Term {
    /// Get the single name if this term names exactly one component.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self.names.as_slice() {
            [name] => Some(name),
            _ => None,
        }
    }

    /// Check if this term is an `A|B|...` alternative.
    #[must_use]
    pub fn is_alternative(&self) -> bool {
        self.names.len() > 1
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.access {
            Access::In => {}
            Access::Out => write!(f, "[out]")?,
            Access::InOut => write!(f, "[inout]")?,
            Access::Atomic => write!(f, "[atomic]")?,
            Access::Has => write!(f, "[has]")?,
        }
        if self.order == Order::Random {
            write!(f, "<rand>")?;
        }
        match self.operator {
            Operator::And => {}
            Operator::Not => write!(f, "!")?,
            Operator::Optional => write!(f, "?")?,
        }
        if self.shared {
            write!(f, "$")?;
        }
        write!(f, "{}", self.names.join("|"))
    }
}

/// Access attribute of a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    /// `[in]` (default): read only.
    #[default]
    In,
    /// `[out]`: written without reading.
    Out,
    /// `[inout]`: read and written.
    InOut,
    /// `[atomic]`: accessed with atomic operations.
    Atomic,
    /// `[has]`: filter only, no data access.
    Has,
}

/// Iteration order attribute of a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// `<seq>` (default): only the rows of the iterated chunk are touched.
    #[default]
    Sequential,
    /// `<rand>`: any entity may be touched.
    Random,
}

/// Term operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operator {
    /// Entity must have the component (default)
    #[default]
    And,
    /// Entity must NOT have the component
    Not,
    /// Component is fetched if present
    Optional,
}

/// Parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for ParseError {}

/// Parse a filter string into a [`Query`].
///
/// # Syntax
///
/// - `Component` - entity must have Component (read only)
/// - `[inout]Component` - read and write Component
/// - `!Component` - entity must NOT have Component
/// - `?Component` - fetch Component when present
/// - `A|B` - entity must have A or B
/// - `$Component` - Component is shared through a meta entity
/// - `<rand>Component` - Component of arbitrary entities is accessed
///
/// # Errors
///
/// Returns `ParseError` if the filter string is malformed.
pub fn parse_query(input: &str) -> Result<Query, ParseError> {
    let mut parser = Parser::new(input);
    parser.parse()
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(&mut self) -> Result<Query, ParseError> {
        let mut terms = Vec::new();

        self.skip_whitespace();
        if self.is_eof() {
            return Err(self.error("empty query"));
        }

        loop {
            terms.push(self.parse_term()?);
            self.skip_whitespace();

            match self.peek() {
                None => break,
                Some(',') => {
                    self.advance();
                    self.skip_whitespace();
                    if self.is_eof() {
                        return Err(self.error("expected term after ','"));
                    }
                }
                Some(c) => return Err(self.error(&format!("unexpected character '{c}'"))),
            }
        }

        Ok(Query { terms })
    }

    fn parse_term(&mut self) -> Result<Term, ParseError> {
        self.skip_whitespace();
        let position = self.pos;

        let mut access = None;
        let mut order = None;

        // Attributes come first, in any order
        loop {
            match self.peek() {
                Some('[') => {
                    let at = self.pos;
                    let word = self.parse_bracketed('[', ']')?;
                    let parsed = match word.as_str() {
                        "in" => Access::In,
                        "out" => Access::Out,
                        "inout" => Access::InOut,
                        "atomic" => Access::Atomic,
                        "has" => Access::Has,
                        other => {
                            return Err(ParseError {
                                message: format!("unknown access attribute '{other}'"),
                                position: at,
                            });
                        }
                    };
                    if access.replace(parsed).is_some() {
                        return Err(ParseError {
                            message: "duplicate access attribute".to_string(),
                            position: at,
                        });
                    }
                }
                Some('<') => {
                    let at = self.pos;
                    let word = self.parse_bracketed('<', '>')?;
                    let parsed = match word.as_str() {
                        "seq" => Order::Sequential,
                        "rand" => Order::Random,
                        other => {
                            return Err(ParseError {
                                message: format!("unknown order attribute '{other}'"),
                                position: at,
                            });
                        }
                    };
                    if order.replace(parsed).is_some() {
                        return Err(ParseError {
                            message: "duplicate order attribute".to_string(),
                            position: at,
                        });
                    }
                }
                _ => break,
            }
            self.skip_whitespace();
        }

        let operator = match self.peek() {
            Some('!') => {
                self.advance();
                Operator::Not
            }
            Some('?') => {
                self.advance();
                Operator::Optional
            }
            _ => Operator::And,
        };

        let shared = if self.peek() == Some('$') {
            self.advance();
            true
        } else {
            false
        };

        let mut names = vec![self.parse_identifier()?];
        loop {
            self.skip_whitespace();
            if self.peek() != Some('|') {
                break;
            }
            self.advance();
            self.skip_whitespace();
            names.push(self.parse_identifier()?);
        }

        Ok(Term {
            access: access.unwrap_or_default(),
            order: order.unwrap_or_default(),
            operator,
            shared,
            names,
            position,
        })
    }

    fn parse_bracketed(&mut self, open: char, close: char) -> Result<String, ParseError> {
        if self.peek() != Some(open) {
            return Err(self.error(&format!("expected '{open}'")));
        }
        self.advance();
        self.skip_whitespace();
        let word = self.parse_identifier()?;
        self.skip_whitespace();
        if self.peek() != Some(close) {
            return Err(self.error(&format!("expected '{close}'")));
        }
        self.advance();
        Ok(word)
    }

    fn parse_identifier(&mut self) -> Result<String, ParseError> {
        let mut ident = String::new();

        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == ':' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }

        if ident.is_empty() {
            return Err(self.error("expected identifier"));
        }

        Ok(ident)
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            position: self.pos,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn remaining(&self) -> &str {
        self.input.get(self.pos..).unwrap_or("")
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }
}
