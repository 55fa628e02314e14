//! Criteria evaluation against a flat key-value map
//!
//! Two kinds of criteria are supported: a list of key-value conditions
//! combined with all/any semantics, and a small boolean expression language:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | "(" expr ")" | compare
//! compare := operand ( ( "==" | "!=" | "=~" ) operand )?
//! operand := "quoted string" | 'quoted string' | bare-word
//! ```
//!
//! A bare word on the left of a comparison, or standing alone, resolves to
//! the value stored under that key when the key is present, and to the word
//! itself otherwise. The right-hand side is always a literal, so
//! `Status == REJECTED` compares the `Status` output against `REJECTED` even
//! when the output also carries a `REJECTED` key.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CriteriaError {
    #[error("Missing key '{0}' in task output")]
    MissingKey(String),

    #[error("Invalid expression at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("'{0}' is not a boolean")]
    NotBoolean(String),

    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),
}

/// Criteria an approval output must match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriteriaSpec {
    KeyValues {
        /// Match when any condition holds instead of all of them
        #[serde(default)]
        match_any: bool,
        conditions: Vec<KeyValueCondition>,
    },
    Expression {
        expression: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValueCondition {
    pub key: String,
    pub operator: ConditionOperator,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    /// Value is a comma-separated list
    In,
    NotIn,
    /// Value is a regular expression
    Matches,
}

/// Pluggable boolean evaluator
pub trait CriteriaEvaluator: Send + Sync {
    fn evaluate(&self, criteria: &CriteriaSpec, values: &HashMap<String, String>) -> Result<bool, CriteriaError>;
}

/// Built-in evaluator for key-value and expression criteria
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCriteriaEvaluator;

impl CriteriaEvaluator for DefaultCriteriaEvaluator {
    fn evaluate(&self, criteria: &CriteriaSpec, values: &HashMap<String, String>) -> Result<bool, CriteriaError> {
        match criteria {
            CriteriaSpec::KeyValues {
                match_any,
                conditions,
            } => evaluate_conditions(conditions, *match_any, values),
            CriteriaSpec::Expression { expression } => {
                let expr = Parser::new(tokenize(expression)?).parse()?;
                expr.evaluate(values)
            }
        }
    }
}

fn evaluate_conditions(
    conditions: &[KeyValueCondition],
    match_any: bool,
    values: &HashMap<String, String>,
) -> Result<bool, CriteriaError> {
    if conditions.is_empty() {
        return Ok(false);
    }
    for condition in conditions {
        let matched = evaluate_condition(condition, values)?;
        if match_any && matched {
            return Ok(true);
        }
        if !match_any && !matched {
            return Ok(false);
        }
    }
    Ok(!match_any)
}

fn evaluate_condition(condition: &KeyValueCondition, values: &HashMap<String, String>) -> Result<bool, CriteriaError> {
    let actual = values
        .get(&condition.key)
        .ok_or_else(|| CriteriaError::MissingKey(condition.key.clone()))?;
    let in_list = || condition.value.split(',').any(|item| item.trim() == actual);

    Ok(match condition.operator {
        ConditionOperator::Equals => actual == &condition.value,
        ConditionOperator::NotEquals => actual != &condition.value,
        ConditionOperator::In => in_list(),
        ConditionOperator::NotIn => !in_list(),
        ConditionOperator::Matches => Regex::new(&condition.value)?.is_match(actual),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Match,
    Quoted(String),
    Word(String),
}

fn parse_error(position: usize, message: impl Into<String>) -> CriteriaError {
    CriteriaError::Parse {
        position,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, CriteriaError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => tokens.push((start, Token::LParen)),
            ')' => tokens.push((start, Token::RParen)),
            '&' if next == Some('&') => {
                tokens.push((start, Token::And));
                i += 1;
            }
            '|' if next == Some('|') => {
                tokens.push((start, Token::Or));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push((start, Token::Eq));
                i += 1;
            }
            '=' if next == Some('~') => {
                tokens.push((start, Token::Match));
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push((start, Token::Ne));
                i += 1;
            }
            '!' => tokens.push((start, Token::Not)),
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(parse_error(start, "unterminated string")),
                        Some('\\') if chars.get(i + 1) == Some(&quote) => {
                            value.push(quote);
                            i += 2;
                        }
                        Some(ch) if *ch == quote => break,
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Quoted(value)));
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(ch) = chars.get(i).copied().filter(|ch| is_word_char(*ch)) {
                    word.push(ch);
                    i += 1;
                }
                tokens.push((start, Token::Word(word)));
                continue;
            }
            other => return Err(parse_error(start, format!("unexpected character '{}'", other))),
        }
        i += 1;
    }

    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-')
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(String),
    Word(String),
}

impl Operand {
    fn resolve<'a>(&'a self, values: &'a HashMap<String, String>) -> &'a str {
        match self {
            Operand::Literal(value) => value,
            Operand::Word(word) => values.get(word).map(String::as_str).unwrap_or(word),
        }
    }

    fn literal(&self) -> &str {
        match self {
            Operand::Literal(value) | Operand::Word(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Match,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CompareOp, Operand),
    Truthy(Operand),
}

impl Expr {
    fn evaluate(&self, values: &HashMap<String, String>) -> Result<bool, CriteriaError> {
        match self {
            Expr::Or(lhs, rhs) => Ok(lhs.evaluate(values)? || rhs.evaluate(values)?),
            Expr::And(lhs, rhs) => Ok(lhs.evaluate(values)? && rhs.evaluate(values)?),
            Expr::Not(inner) => Ok(!inner.evaluate(values)?),
            Expr::Compare(lhs, op, rhs) => {
                let lhs = lhs.resolve(values);
                let rhs = rhs.literal();
                match op {
                    CompareOp::Eq => Ok(lhs == rhs),
                    CompareOp::Ne => Ok(lhs != rhs),
                    CompareOp::Match => Ok(Regex::new(rhs)?.is_match(lhs)),
                }
            }
            Expr::Truthy(operand) => match operand.resolve(values) {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(CriteriaError::NotBoolean(other.to_string())),
            },
        }
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<(usize, Token)>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn parse(mut self) -> Result<Expr, CriteriaError> {
        if self.tokens.is_empty() {
            return Err(parse_error(0, "empty expression"));
        }
        let expr = self.parse_or()?;
        if let Some((position, token)) = self.tokens.get(self.pos) {
            return Err(parse_error(*position, format!("unexpected token {:?}", token)));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(position, _)| *position)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, CriteriaError> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            expr = Expr::Or(Box::new(expr), Box::new(self.parse_and()?));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, CriteriaError> {
        let mut expr = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            expr = Expr::And(Box::new(expr), Box::new(self.parse_unary()?));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, CriteriaError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::LParen) => {
                self.advance();
                let expr = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(parse_error(self.position(), "expected ')'")),
                }
            }
            _ => self.parse_compare(),
        }
    }

    fn parse_compare(&mut self) -> Result<Expr, CriteriaError> {
        let lhs = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Match) => CompareOp::Match,
            _ => return Ok(Expr::Truthy(lhs)),
        };
        self.advance();
        let rhs = self.parse_operand()?;
        Ok(Expr::Compare(lhs, op, rhs))
    }

    fn parse_operand(&mut self) -> Result<Operand, CriteriaError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Quoted(value)) => Ok(Operand::Literal(value)),
            Some(Token::Word(word)) => Ok(Operand::Word(word)),
            Some(other) => Err(parse_error(position, format!("expected a value, found {:?}", other))),
            None => Err(parse_error(position, "expected a value")),
        }
    }
}
