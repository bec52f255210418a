//! `${{ }}` expression evaluation for workflow files.
//!
//! Covers the subset of the GitHub Actions expression language the pipeline
//! relies on: context lookups, literals, boolean/comparison operators, status
//! functions and `hashFiles`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::secrets::Secrets;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("syntax error in expression `{expr}`: {message}")]
    Syntax { expr: String, message: String },

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("function `{name}` expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: &'static str,
        got: usize,
    },

    #[error("unterminated expression in `{0}`")]
    Unterminated(String),

    #[error("hashFiles failed: {0}")]
    HashFiles(String),

    #[error("format: {0}")]
    Format(String),
}

/// Runtime value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
        }
    }

    fn to_number(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Number(n) => *n,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
        }
    }

    fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
            _ => self.to_number() == other.to_number(),
        }
    }

    fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
            _ => self.to_number().partial_cmp(&other.to_number()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => f.write_str(s),
        }
    }
}

// ── Lexer ──

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Dot,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Ident(String),
    Str(String),
    Num(f64),
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' => {
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            literal.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            literal.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{text}`"))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }

    Ok(tokens)
}

// ── Parser ──

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Call { name: String, args: Vec<Expr> },
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

const STATUS_FUNCTIONS: [&str; 4] = ["success", "failure", "always", "cancelled"];

impl Expr {
    fn uses_status_function(&self) -> bool {
        match self {
            Expr::Literal(_) | Expr::Path(_) => false,
            Expr::Call { name, args } => {
                STATUS_FUNCTIONS.contains(&name.to_ascii_lowercase().as_str())
                    || args.iter().any(Expr::uses_status_function)
            }
            Expr::Not(inner) => inner.uses_status_function(),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.uses_status_function() || rhs.uses_status_function()
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.advance() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected:?}, found {token:?}")),
            None => Err(format!("expected {expected:?}, found end of input")),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call { name: ident, args })
                }
                _ => {
                    let mut path = vec![ident];
                    while self.peek() == Some(&Token::Dot) {
                        self.pos += 1;
                        match self.advance() {
                            Some(Token::Ident(segment)) => path.push(segment),
                            other => return Err(format!("expected property name, found {other:?}")),
                        }
                    }
                    Ok(Expr::Path(path))
                }
            },
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn parse(source: &str) -> Result<Expr, ExprError> {
    let syntax = |message: String| ExprError::Syntax {
        expr: source.trim().to_string(),
        message,
    };

    let tokens = tokenize(source).map_err(syntax)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or().map_err(syntax)?;
    if let Some(token) = parser.peek() {
        return Err(syntax(format!("unexpected trailing token {token:?}")));
    }
    Ok(expr)
}

/// Byte offset of the `}}` closing an expression, ignoring braces in strings.
fn find_closing(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut in_string = false;
    for i in 0..bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
    }
    None
}

/// Strip an optional `${{ ... }}` wrapper spanning the whole text.
fn unwrap_expression(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("${{") {
        if find_closing(inner).map(|end| end + 2) == Some(inner.len()) {
            return &inner[..inner.len() - 2];
        }
    }
    trimmed
}

// ── Evaluation ──

/// Status of the job the expression is evaluated in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobState {
    pub failed: bool,
    pub cancelled: bool,
}

/// Contexts visible to expressions.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub github: BTreeMap<String, String>,
    pub env: IndexMap<String, String>,
    pub runner: BTreeMap<String, String>,
    /// Job id to result (`success`, `failure`, `skipped`).
    pub needs: BTreeMap<String, String>,
    /// Step id to outcome.
    pub steps: BTreeMap<String, String>,
    pub secrets: Secrets,
    pub workspace: PathBuf,
    pub state: JobState,
}

impl Scope {
    /// Evaluate a single expression (without the `${{ }}` wrapper).
    pub fn evaluate(&self, source: &str) -> Result<Value, ExprError> {
        let expr = parse(unwrap_expression(source))?;
        self.eval(&expr)
    }

    /// Replace every `${{ expr }}` in `template` with its string value.
    pub fn interpolate(&self, template: &str) -> Result<String, ExprError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let end =
                find_closing(after).ok_or_else(|| ExprError::Unterminated(template.to_string()))?;
            let value = self.evaluate(&after[..end])?;
            out.push_str(&value.to_string());
            rest = &after[end + 2..];
        }

        out.push_str(rest);
        Ok(out)
    }

    /// Evaluate an `if:` condition. Without a status function the condition
    /// is implicitly `success() && (...)`.
    pub fn condition(&self, source: Option<&str>) -> Result<bool, ExprError> {
        let Some(source) = source.map(unwrap_expression).filter(|s| !s.is_empty()) else {
            return Ok(!self.state.failed && !self.state.cancelled);
        };

        let expr = parse(source)?;
        let expr = if expr.uses_status_function() {
            expr
        } else {
            Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(Expr::Call {
                    name: "success".to_string(),
                    args: Vec::new(),
                }),
                rhs: Box::new(expr),
            }
        };

        Ok(self.eval(&expr)?.is_truthy())
    }

    fn lookup(&self, path: &[String]) -> Value {
        let string = |value: Option<&String>| {
            value
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null)
        };

        match path {
            [context, key] if context == "github" => string(self.github.get(key)),
            [context, key] if context == "env" => string(self.env.get(key)),
            [context, key] if context == "runner" => string(self.runner.get(key)),
            [context, key] if context == "secrets" => Value::String(
                self.secrets
                    .get(key)
                    .map(|s| s.expose_secret().to_string())
                    .unwrap_or_default(),
            ),
            [context, job, field] if context == "needs" && field == "result" => {
                string(self.needs.get(job))
            }
            [context, id, field]
                if context == "steps" && (field == "outcome" || field == "conclusion") =>
            {
                string(self.steps.get(id))
            }
            _ => Value::Null,
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Value, ExprError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(path) => Ok(self.lookup(path)),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
            Expr::Call { name, args } => {
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(name, &values)
            }
            Expr::Binary { op, lhs, rhs } => {
                let left = self.eval(lhs)?;
                match op {
                    BinOp::And if !left.is_truthy() => Ok(left),
                    BinOp::Or if left.is_truthy() => Ok(left),
                    BinOp::And | BinOp::Or => self.eval(rhs),
                    _ => {
                        let right = self.eval(rhs)?;
                        let ordering = left.compare(&right);
                        let result = match op {
                            BinOp::Eq => left.loosely_equals(&right),
                            BinOp::Ne => !left.loosely_equals(&right),
                            BinOp::Lt => ordering.is_some_and(|o| o.is_lt()),
                            BinOp::Le => ordering.is_some_and(|o| o.is_le()),
                            BinOp::Gt => ordering.is_some_and(|o| o.is_gt()),
                            BinOp::Ge => ordering.is_some_and(|o| o.is_ge()),
                            BinOp::And | BinOp::Or => unreachable!(),
                        };
                        Ok(Value::Bool(result))
                    }
                }
            }
        }
    }

    fn call(&self, name: &str, args: &[Value]) -> Result<Value, ExprError> {
        let arity = |expected: &'static str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ExprError::Arity {
                    name: name.to_string(),
                    expected,
                    got: args.len(),
                })
            }
        };

        match name.to_ascii_lowercase().as_str() {
            "success" => {
                arity("0", args.is_empty())?;
                Ok(Value::Bool(!self.state.failed && !self.state.cancelled))
            }
            "failure" => {
                arity("0", args.is_empty())?;
                Ok(Value::Bool(self.state.failed))
            }
            "always" => {
                arity("0", args.is_empty())?;
                Ok(Value::Bool(true))
            }
            "cancelled" => {
                arity("0", args.is_empty())?;
                Ok(Value::Bool(self.state.cancelled))
            }
            "contains" | "startswith" | "endswith" => {
                arity("2", args.len() == 2)?;
                let haystack = args[0].to_string().to_lowercase();
                let needle = args[1].to_string().to_lowercase();
                let found = match name.to_ascii_lowercase().as_str() {
                    "contains" => haystack.contains(&needle),
                    "startswith" => haystack.starts_with(&needle),
                    _ => haystack.ends_with(&needle),
                };
                Ok(Value::Bool(found))
            }
            "format" => {
                arity("at least 1", !args.is_empty())?;
                format_string(&args[0].to_string(), &args[1..]).map(Value::String)
            }
            "hashfiles" => {
                arity("at least 1", !args.is_empty())?;
                let patterns: Vec<String> = args.iter().map(ToString::to_string).collect();
                hash_files(&self.workspace, &patterns).map(Value::String)
            }
            _ => Err(ExprError::UnknownFunction(name.to_string())),
        }
    }
}

/// Replace `{N}` with the N-th argument; `{{` and `}}` are literal braces.
fn format_string(template: &str, args: &[Value]) -> Result<String, ExprError> {
    let invalid = |why: String| ExprError::Format(format!("{why} in `{template}`"));

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        _ => return Err(invalid("malformed placeholder".to_string())),
                    }
                }
                let index: usize = digits
                    .parse()
                    .map_err(|_| invalid("empty placeholder".to_string()))?;
                let value = args
                    .get(index)
                    .ok_or_else(|| invalid(format!("no argument for {{{index}}}")))?;
                out.push_str(&value.to_string());
            }
            '}' => return Err(invalid("unmatched `}`".to_string())),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// SHA-256 over the SHA-256 digests of every file matching `patterns`
/// (relative to `workspace`, sorted). Empty when nothing matches.
/// Patterns prefixed with `!` exclude.
pub fn hash_files(workspace: &Path, patterns: &[String]) -> Result<String, ExprError> {
    let err = |e: &dyn fmt::Display| ExprError::HashFiles(e.to_string());

    let mut includes = Vec::new();
    let mut excludes = Vec::new();
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(excluded) => excludes.push(glob::Pattern::new(excluded).map_err(|e| err(&e))?),
            None => includes.push(pattern),
        }
    }

    let root = glob::Pattern::escape(&workspace.to_string_lossy());
    let mut files = Vec::new();
    for pattern in includes {
        let full = format!("{root}/{}", pattern.trim_start_matches("./"));
        for entry in glob::glob(&full).map_err(|e| err(&e))? {
            let path = entry.map_err(|e| err(&e))?;
            if !path.is_file() {
                continue;
            }
            let relative = path.strip_prefix(workspace).unwrap_or(&path);
            if excludes.iter().any(|ex| ex.matches_path(relative)) {
                continue;
            }
            files.push(path);
        }
    }

    files.sort();
    files.dedup();
    if files.is_empty() {
        return Ok(String::new());
    }

    let mut outer = Sha256::new();
    for file in &files {
        let bytes = std::fs::read(file).map_err(|e| err(&e))?;
        outer.update(Sha256::digest(&bytes));
    }
    Ok(hex::encode(outer.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        let mut scope = Scope::default();
        scope
            .github
            .insert("ref".to_string(), "refs/heads/main".to_string());
        scope
            .github
            .insert("event_name".to_string(), "push".to_string());
        scope
            .env
            .insert("PYTHON_VERSION".to_string(), "3.12.7".to_string());
        scope.runner.insert("os".to_string(), "Linux".to_string());
        scope
    }

    #[test]
    fn test_ref_comparison() {
        let scope = scope();
        assert_eq!(
            scope.evaluate("github.ref == 'refs/heads/main'").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            scope.evaluate("github.ref != 'refs/heads/main'").unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_string_equality_ignores_case() {
        let scope = scope();
        assert!(scope.evaluate("runner.os == 'linux'").unwrap().is_truthy());
    }

    #[test]
    fn test_or_falls_back_on_empty_secret() {
        let scope = scope();
        assert_eq!(
            scope.interpolate("${{ secrets.DO_USERNAME || 'root' }}@host").unwrap(),
            "root@host"
        );
    }

    #[test]
    fn test_or_prefers_configured_secret() {
        let mut scope = scope();
        scope.secrets = Secrets::from_pairs([("DO_USERNAME", "deployer")]);
        assert_eq!(
            scope.interpolate("${{ secrets.DO_USERNAME || 'root' }}").unwrap(),
            "deployer"
        );
    }

    #[test]
    fn test_interpolate_multiple() {
        let scope = scope();
        assert_eq!(
            scope
                .interpolate("${{ runner.os }}-pip-${{ env.PYTHON_VERSION }}")
                .unwrap(),
            "Linux-pip-3.12.7"
        );
    }

    #[test]
    fn test_interpolate_braces_in_string_literal() {
        let scope = scope();
        assert_eq!(scope.interpolate("${{ '}}' }}!").unwrap(), "}}!");
    }

    #[test]
    fn test_interpolate_unterminated() {
        let scope = scope();
        assert!(matches!(
            scope.interpolate("${{ github.ref"),
            Err(ExprError::Unterminated(_))
        ));
    }

    #[test]
    fn test_missing_context_is_empty() {
        let scope = scope();
        assert_eq!(scope.interpolate("[${{ github.head_ref }}]").unwrap(), "[]");
        assert_eq!(scope.evaluate("env.NOPE").unwrap(), Value::Null);
    }

    #[test]
    fn test_condition_defaults_to_success() {
        let mut scope = scope();
        assert!(scope.condition(None).unwrap());
        assert!(scope.condition(Some("github.ref == 'refs/heads/main'")).unwrap());

        scope.state.failed = true;
        assert!(!scope.condition(None).unwrap());
        assert!(!scope.condition(Some("github.ref == 'refs/heads/main'")).unwrap());
        assert!(scope.condition(Some("always()")).unwrap());
        assert!(scope.condition(Some("${{ failure() }}")).unwrap());
    }

    #[test]
    fn test_condition_on_pull_request_ref() {
        let mut scope = scope();
        scope
            .github
            .insert("ref".to_string(), "refs/pull/7/merge".to_string());
        assert!(!scope.condition(Some("github.ref == 'refs/heads/main'")).unwrap());
    }

    #[test]
    fn test_needs_result() {
        let mut scope = scope();
        scope
            .needs
            .insert("test".to_string(), "success".to_string());
        assert!(scope
            .condition(Some("needs.test.result == 'success'"))
            .unwrap());
    }

    #[test]
    fn test_operators_and_literals() {
        let scope = scope();
        assert_eq!(scope.evaluate("!false && (1 < 2)").unwrap(), Value::Bool(true));
        assert_eq!(scope.evaluate("'it''s'").unwrap(), Value::String("it's".into()));
        assert_eq!(scope.evaluate("null || 3").unwrap(), Value::Number(3.0));
        assert_eq!(scope.evaluate("'1' == 1").unwrap(), Value::Bool(true));
        assert_eq!(scope.evaluate("'abc' == 0").unwrap(), Value::Bool(false));
        assert_eq!(scope.evaluate("false && x.y").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_string_functions() {
        let scope = scope();
        assert!(scope
            .evaluate("startsWith(github.ref, 'refs/heads/')")
            .unwrap()
            .is_truthy());
        assert!(scope.evaluate("endsWith(github.ref, 'MAIN')").unwrap().is_truthy());
        assert!(scope.evaluate("contains(github.ref, 'heads')").unwrap().is_truthy());
    }

    #[test]
    fn test_format() {
        let scope = scope();
        assert_eq!(
            scope
                .evaluate("format('{0}-pip-{1}', runner.os, env.PYTHON_VERSION)")
                .unwrap(),
            Value::String("Linux-pip-3.12.7".into())
        );
        assert_eq!(
            scope.evaluate("format('{{{0}}} {1}{0}', 'a', true)").unwrap(),
            Value::String("{a} truea".into())
        );
        assert_eq!(
            scope
                .interpolate("key: ${{ format('{0}-{1}', runner.os, github.event_name) }}")
                .unwrap(),
            "key: Linux-push"
        );
        assert!(matches!(
            scope.evaluate("format('{2}', 'a')"),
            Err(ExprError::Format(_))
        ));
        assert!(matches!(
            scope.evaluate("format('{x}', 'a')"),
            Err(ExprError::Format(_))
        ));
        assert!(matches!(scope.evaluate("format()"), Err(ExprError::Arity { .. })));
    }

    #[test]
    fn test_errors() {
        let scope = scope();
        assert!(matches!(
            scope.evaluate("github.ref =="),
            Err(ExprError::Syntax { .. })
        ));
        assert!(matches!(
            scope.evaluate("'open"),
            Err(ExprError::Syntax { .. })
        ));
        assert_eq!(
            scope.evaluate("toJSON(github)"),
            Err(ExprError::UnknownFunction("toJSON".to_string()))
        );
        assert!(matches!(
            scope.evaluate("success(1)"),
            Err(ExprError::Arity { .. })
        ));
    }

    #[test]
    fn test_number_display() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(3.5).to_string(), "3.5");
        assert_eq!(Value::Null.to_string(), "");
    }

    #[test]
    fn test_hash_files_matches_digest_of_digests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bscore")).unwrap();
        std::fs::write(dir.path().join("bscore/requirements.txt"), "Django==5.1\n").unwrap();

        let mut expected = Sha256::new();
        expected.update(Sha256::digest(b"Django==5.1\n"));
        let expected = hex::encode(expected.finalize());

        let mut scope = scope();
        scope.workspace = dir.path().to_path_buf();
        assert_eq!(
            scope
                .evaluate("hashFiles('bscore/requirements.txt')")
                .unwrap(),
            Value::String(expected)
        );
    }

    #[test]
    fn test_hash_files_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        std::fs::write(&path, "a\n").unwrap();
        let first = hash_files(dir.path(), &["requirements.txt".to_string()]).unwrap();
        std::fs::write(&path, "b\n").unwrap();
        let second = hash_files(dir.path(), &["requirements.txt".to_string()]).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_hash_files_no_match_and_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(hash_files(dir.path(), &["missing.txt".to_string()]).unwrap(), "");

        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let only_a = hash_files(dir.path(), &["a.txt".to_string()]).unwrap();
        let excluded = hash_files(
            dir.path(),
            &["*.txt".to_string(), "!b.txt".to_string()],
        )
        .unwrap();
        assert_eq!(only_a, excluded);
    }
}
