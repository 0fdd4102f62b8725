//! Transitions and guards
//!
//! A transition is a directed edge between two steps. Transitions leaving a
//! gateway may carry a [`Guard`]; transitions leaving a task answer a named
//! signal.

use crate::{ProcedureError, ProcedureResult, StepId, Value, Variables, COMPLETE_SIGNAL};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A directed edge in the procedure graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Source step
    pub from: StepId,
    /// Target step
    pub to: StepId,
    /// Predicate over instance variables (gateway transitions only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    /// Taken by a gateway when no guarded transition matches
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_default: bool,
    /// Signal a task answers with this transition; `complete` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Human-readable label
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

impl Transition {
    /// Unconditional transition
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: StepId::new(from),
            to: StepId::new(to),
            guard: None,
            is_default: false,
            signal: None,
            label: String::new(),
        }
    }

    /// Gateway transition taken when `guard` holds
    pub fn guarded(from: impl Into<String>, to: impl Into<String>, guard: Guard) -> Self {
        let mut transition = Self::new(from, to);
        transition.guard = Some(guard);
        transition
    }

    /// Gateway fallback transition
    pub fn default_branch(from: impl Into<String>, to: impl Into<String>) -> Self {
        let mut transition = Self::new(from, to);
        transition.is_default = true;
        transition
    }

    pub fn with_signal(mut self, signal: impl Into<String>) -> Self {
        self.signal = Some(signal.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// The signal name this transition answers
    pub fn signal_name(&self) -> &str {
        self.signal.as_deref().unwrap_or(COMPLETE_SIGNAL)
    }

    /// Does this transition answer `signal`?
    pub fn answers(&self, signal: &str) -> bool {
        self.signal_name() == signal
    }
}

// ── Guards ───────────────────────────────────────────────────────────

/// A boolean predicate over instance variables.
///
/// Unset variables make every comparison false, so "false or unset" always
/// falls through to a gateway's default transition. Guards serialize as
/// their textual form, e.g. `"test_auto_ok == true"` or `"retries < 3"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Guard {
    /// Variable is the boolean `true`
    IsTrue(String),
    /// Variable is the boolean `false`
    IsFalse(String),
    /// Variable equals the value
    Equals(String, Value),
    /// Variable is set and differs from the value
    NotEquals(String, Value),
    /// Integer variable is below the bound
    LessThan(String, i64),
    /// Integer variable is at or above the bound
    AtLeast(String, i64),
    Not(Box<Guard>),
    All(Vec<Guard>),
    Any(Vec<Guard>),
}

impl Guard {
    pub fn is_true(var: impl Into<String>) -> Self {
        Self::IsTrue(var.into())
    }

    pub fn is_false(var: impl Into<String>) -> Self {
        Self::IsFalse(var.into())
    }

    pub fn equals(var: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals(var.into(), value.into())
    }

    pub fn less_than(var: impl Into<String>, bound: i64) -> Self {
        Self::LessThan(var.into(), bound)
    }

    pub fn at_least(var: impl Into<String>, bound: i64) -> Self {
        Self::AtLeast(var.into(), bound)
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluate against instance variables
    pub fn evaluate(&self, vars: &Variables) -> bool {
        match self {
            Self::IsTrue(var) => vars.get(var).and_then(Value::as_bool) == Some(true),
            Self::IsFalse(var) => vars.get(var).and_then(Value::as_bool) == Some(false),
            Self::Equals(var, value) => vars.get(var) == Some(value),
            Self::NotEquals(var, value) => vars.get(var).is_some_and(|v| v != value),
            Self::LessThan(var, bound) => {
                vars.get(var).and_then(Value::as_int).is_some_and(|v| v < *bound)
            }
            Self::AtLeast(var, bound) => {
                vars.get(var).and_then(Value::as_int).is_some_and(|v| v >= *bound)
            }
            Self::Not(inner) => !inner.evaluate(vars),
            Self::All(guards) => guards.iter().all(|g| g.evaluate(vars)),
            Self::Any(guards) => guards.iter().any(|g| g.evaluate(vars)),
        }
    }

    /// Parse the textual guard form.
    ///
    /// Grammar: `or := and ("||" and)*`, `and := unary ("&&" unary)*`,
    /// `unary := "!" unary | "(" or ")" | var [op literal]` with
    /// `op ∈ {==, !=, <, >=}` and literals `true`, `false`, integers or
    /// double-quoted text. A bare variable means `var == true`.
    pub fn parse(input: &str) -> ProcedureResult<Self> {
        let fail = |reason: &str| ProcedureError::InvalidGuard {
            expression: input.to_string(),
            reason: reason.to_string(),
        };
        let tokens = tokenize(input).map_err(|reason| fail(&reason))?;
        let mut parser = Parser { tokens, pos: 0 };
        let guard = parser.parse_or().map_err(|reason| fail(&reason))?;
        if parser.pos != parser.tokens.len() {
            return Err(fail("unexpected trailing input"));
        }
        Ok(guard)
    }

    fn is_composite(&self) -> bool {
        matches!(self, Self::All(_) | Self::Any(_))
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IsTrue(var) => write!(f, "{} == true", var),
            Self::IsFalse(var) => write!(f, "{} == false", var),
            Self::Equals(var, value) => write!(f, "{} == {}", var, Literal(value)),
            Self::NotEquals(var, value) => write!(f, "{} != {}", var, Literal(value)),
            Self::LessThan(var, bound) => write!(f, "{} < {}", var, bound),
            Self::AtLeast(var, bound) => write!(f, "{} >= {}", var, bound),
            Self::Not(inner) => write!(f, "!({})", inner),
            Self::All(guards) => write_joined(f, guards, " && "),
            Self::Any(guards) => write_joined(f, guards, " || "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, guards: &[Guard], sep: &str) -> fmt::Result {
    for (i, guard) in guards.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        if guard.is_composite() {
            write!(f, "({})", guard)?;
        } else {
            write!(f, "{}", guard)?;
        }
    }
    Ok(())
}

struct Literal<'a>(&'a Value);

impl fmt::Display for Literal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Text(text) => write!(f, "{:?}", text),
            other => write!(f, "{}", other),
        }
    }
}

impl TryFrom<String> for Guard {
    type Error = ProcedureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Guard> for String {
    fn from(guard: Guard) -> Self {
        guard.to_string()
    }
}

// ── Guard text parsing ───────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Text(String),
    EqEq,
    NotEq,
    Lt,
    Ge,
    Bang,
    AndAnd,
    OrOr,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '<' => {
                chars.next();
                tokens.push(Token::Lt);
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err("expected '>='".into());
                }
                tokens.push(Token::Ge);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err("expected '=='".into());
                }
                tokens.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_none() {
                    return Err("expected '&&'".into());
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_none() {
                    return Err("expected '||'".into());
                }
                tokens.push(Token::OrOr);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => text.push(escaped),
                            None => return Err("unterminated string".into()),
                        },
                        Some(ch) => text.push(ch),
                        None => return Err("unterminated string".into()),
                    }
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut number = String::new();
                number.push(c);
                chars.next();
                while let Some(d) = chars.next_if(|d| d.is_ascii_digit()) {
                    number.push(d);
                }
                let parsed = number
                    .parse::<i64>()
                    .map_err(|_| format!("invalid integer '{}'", number))?;
                tokens.push(Token::Int(parsed));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_' || *ch == '.') {
                    ident.push(ch);
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    if tokens.is_empty() {
        return Err("empty expression".into());
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Guard, String> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&Token::OrOr) {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Guard::Any(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Guard, String> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat(&Token::AndAnd) {
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Guard::All(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Guard, String> {
        match self.next() {
            Some(Token::Bang) => Ok(self.parse_unary()?.negate()),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err("expected ')'".into());
                }
                Ok(inner)
            }
            Some(Token::Ident(var)) => self.parse_comparison(var),
            Some(other) => Err(format!("unexpected token {:?}", other)),
            None => Err("unexpected end of expression".into()),
        }
    }

    fn parse_comparison(&mut self, var: String) -> Result<Guard, String> {
        let op = match self.peek() {
            Some(Token::EqEq | Token::NotEq | Token::Lt | Token::Ge) => self.next(),
            _ => return Ok(Guard::IsTrue(var)),
        };
        let literal = match self.next() {
            Some(Token::Ident(word)) if word == "true" => Value::Bool(true),
            Some(Token::Ident(word)) if word == "false" => Value::Bool(false),
            Some(Token::Int(n)) => Value::Int(n),
            Some(Token::Text(text)) => Value::Text(text),
            Some(other) => return Err(format!("expected a literal, found {:?}", other)),
            None => return Err("expected a literal".into()),
        };

        match (op, literal) {
            (Some(Token::EqEq), Value::Bool(true)) => Ok(Guard::IsTrue(var)),
            (Some(Token::EqEq), Value::Bool(false)) => Ok(Guard::IsFalse(var)),
            (Some(Token::EqEq), value) => Ok(Guard::Equals(var, value)),
            (Some(Token::NotEq), value) => Ok(Guard::NotEquals(var, value)),
            (Some(Token::Lt), Value::Int(n)) => Ok(Guard::LessThan(var, n)),
            (Some(Token::Ge), Value::Int(n)) => Ok(Guard::AtLeast(var, n)),
            _ => Err(format!("'{}' can only be ordered against an integer", var)),
        }
    }
}
