//! Label selector expressions: boolean combinations of label operands with
//! `!`, `&&`, `||` and parentheses, e.g.
//! `konveyor.io/target=eap8+ && !konveyor.io/source=websphere`.

use std::fmt::{Display, Formatter};
use std::iter::Peekable;
use std::str::FromStr;
use std::vec::IntoIter;

use lazy_regex::regex_captures;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{INCLUDE_ALWAYS, INCLUDE_KEY, INCLUDE_NEVER, Label, ParseLabelError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorSyntaxError {
    #[error("label selector expression is empty")]
    Empty,
    #[error("unexpected token `{0}` in label selector")]
    UnexpectedToken(String),
    #[error("label selector expression ended unexpectedly")]
    UnexpectedEnd,
    #[error("unbalanced parenthesis in label selector")]
    UnbalancedParen,
    #[error(transparent)]
    InvalidOperand(#[from] ParseLabelError),
}

/// A compiled label selector expression.
///
/// Compilation happens once; [`LabelSelector::matches`] then evaluates the
/// expression by replacing every operand with "does any of the target's
/// values for that key match the operand's value".
#[derive(Debug, Clone)]
pub struct LabelSelector {
    source: String,
    expr: Expr,
}

impl LabelSelector {
    pub fn new(source: &str) -> Result<Self, SelectorSyntaxError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(SelectorSyntaxError::Empty);
        }
        let expr = Parser::parse(tokens)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The expression source this selector was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, labels: &[Label]) -> bool {
        let mut collected: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for label in labels {
            collected
                .entry(label.key().to_string())
                .or_default()
                .push(label.value().unwrap_or_default().to_string());
        }
        self.matches_collected(&collected)
    }

    /// Parse then match a target's raw label strings. An unparsable target
    /// label is an error, which callers treat like a non-match that must be
    /// reported (rules with bad labels are skipped, not silently kept).
    pub fn matches_labels<S: AsRef<str>>(&self, labels: &[S]) -> Result<bool, ParseLabelError> {
        let collected = crate::collect_labels(labels.iter().map(AsRef::as_ref))?;
        Ok(self.matches_collected(&collected))
    }

    /// Match against an already-collected `key -> [values...]` multimap. Used
    /// directly by incident selectors, where variable values are arbitrary
    /// strings rather than parsed labels.
    pub fn matches_collected(&self, labels: &FxHashMap<String, Vec<String>>) -> bool {
        if let Some(values) = labels.get(INCLUDE_KEY) {
            if values.iter().any(|value| value == INCLUDE_ALWAYS) {
                return true;
            }
            if values.iter().any(|value| value == INCLUDE_NEVER) {
                return false;
            }
        }
        self.expr.eval(labels)
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorSyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Operand(Label),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    fn eval(&self, labels: &FxHashMap<String, Vec<String>>) -> bool {
        match self {
            Expr::Operand(operand) => match labels.get(operand.key()) {
                None => false,
                Some(values) => match operand.value() {
                    None => true,
                    Some(pattern) => values
                        .iter()
                        .any(|candidate| value_matches(candidate, pattern)),
                },
            },
            Expr::Not(inner) => !inner.eval(labels),
            Expr::And(children) => children.iter().all(|child| child.eval(labels)),
            Expr::Or(children) => children.iter().any(|child| child.eval(labels)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Operand(String),
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Operand(operand) => write!(f, "{operand}"),
        }
    }
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, SelectorSyntaxError> {
    let mut tokens = Vec::new();
    let mut operand = String::new();
    let mut flush = |operand: &mut String, tokens: &mut Vec<Token>| {
        if !operand.is_empty() {
            tokens.push(Token::Operand(std::mem::take(operand)));
        }
    };
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '&' | '|' => {
                if chars.peek() != Some(&c) {
                    return Err(SelectorSyntaxError::UnexpectedToken(c.to_string()));
                }
                chars.next();
                flush(&mut operand, &mut tokens);
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            '!' => {
                flush(&mut operand, &mut tokens);
                tokens.push(Token::Not);
            }
            '(' => {
                flush(&mut operand, &mut tokens);
                tokens.push(Token::LParen);
            }
            ')' => {
                flush(&mut operand, &mut tokens);
                tokens.push(Token::RParen);
            }
            c if c.is_whitespace() => flush(&mut operand, &mut tokens),
            c => operand.push(c),
        }
    }
    flush(&mut operand, &mut tokens);
    Ok(tokens)
}

/// Recursive-descent parser over the token stream. Precedence, tightest
/// first: `!`, `&&`, `||`; both binary operators are left-associative.
struct Parser {
    tokens: Peekable<IntoIter<Token>>,
}

impl Parser {
    fn parse(tokens: Vec<Token>) -> Result<Expr, SelectorSyntaxError> {
        let mut parser = Self {
            tokens: tokens.into_iter().peekable(),
        };
        let expr = parser.or_expr()?;
        match parser.tokens.next() {
            Some(token) => Err(SelectorSyntaxError::UnexpectedToken(token.to_string())),
            None => Ok(expr),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, SelectorSyntaxError> {
        let mut children = vec![self.and_expr()?];
        while self.tokens.peek() == Some(&Token::Or) {
            self.tokens.next();
            children.push(self.and_expr()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            Expr::Or(children)
        })
    }

    fn and_expr(&mut self) -> Result<Expr, SelectorSyntaxError> {
        let mut children = vec![self.unary()?];
        while self.tokens.peek() == Some(&Token::And) {
            self.tokens.next();
            children.push(self.unary()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            Expr::And(children)
        })
    }

    fn unary(&mut self) -> Result<Expr, SelectorSyntaxError> {
        if self.tokens.peek() == Some(&Token::Not) {
            self.tokens.next();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, SelectorSyntaxError> {
        match self.tokens.next() {
            Some(Token::LParen) => {
                let expr = self.or_expr()?;
                match self.tokens.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(SelectorSyntaxError::UnbalancedParen),
                }
            }
            Some(Token::Operand(operand)) => Ok(Expr::Operand(operand.parse()?)),
            Some(token) => Err(SelectorSyntaxError::UnexpectedToken(token.to_string())),
            None => Err(SelectorSyntaxError::UnexpectedEnd),
        }
    }
}

/// Split a trailing numeric version (and optional `+`/`-` bound) off a label
/// value: `eap8+` -> (`eap`, `8`, `+`).
fn split_version(value: &str) -> (&str, Option<&str>, Option<char>) {
    match regex_captures!(r"(\d[\d.]*\d?)([+-])?$", value) {
        Some((whole, version, bound)) => (
            &value[..value.len() - whole.len()],
            Some(version),
            bound.chars().next(),
        ),
        None => (value, None, None),
    }
}

/// Does a target's `candidate` value satisfy a selector operand's `pattern`
/// value, honoring trailing version ranges?
fn value_matches(candidate: &str, pattern: &str) -> bool {
    let (candidate_name, candidate_version, _) = split_version(candidate);
    let (pattern_name, pattern_version, bound) = split_version(pattern);
    if candidate_name != pattern_name {
        return false;
    }
    let Some(pattern_version) = pattern_version else {
        // An unversioned pattern matches any candidate version. When neither
        // side carries a version this reduces to the name equality above.
        return true;
    };
    let versions = candidate_version
        .and_then(lenient_version)
        .zip(lenient_version(pattern_version));
    match (versions, bound) {
        (Some((candidate, pattern)), None) => candidate == pattern,
        (Some((candidate, pattern)), Some('+')) => candidate >= pattern,
        (Some((candidate, pattern)), Some('-')) => candidate <= pattern,
        // Either side failed to parse as a version: fall back to comparing
        // the raw strings.
        _ => candidate == pattern,
    }
}

/// Parse with semver semantics but forgiving arity: `8` -> `8.0.0`,
/// `5.7` -> `5.7.0`.
fn lenient_version(version: &str) -> Option<semver::Version> {
    let mut parts = version.trim_matches('.').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
    let patch = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
    if parts.next().is_some() {
        return None;
    }
    Some(semver::Version::new(major, minor, patch))
}
