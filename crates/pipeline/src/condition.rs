//! Condition expressions for conditional regex rules.
//!
//! ```text
//! var.mood == "angry"
//! global.turns >= 10 AND NOT var.quiet
//! text MATCHES "(?i)^ooc:" OR view == "user"
//! var.inventory CONTAINS "key"
//! ```
//!
//! Grammar (informal):
//! ```text
//! expr     = and ("OR" and)*
//! and      = unary ("AND" unary)*
//! unary    = "NOT" unary | primary
//! primary  = "(" expr ")" | field [OP value]
//! field    = "var." PATH | "global." PATH | "text" | "view"
//! OP       = ["NOT"] ("CONTAINS" | "MATCHES" | "STARTS_WITH" | "ENDS_WITH")
//!          | "==" | "!=" | ">" | "<" | ">=" | "<="
//! value    = QUOTED_STRING | NUMBER | "true" | "false" | IDENT
//! ```
//!
//! A field without an operator tests truthiness.

use loomweave_core::View;
use loomweave_variables::{VariableScope, VariableState};
use regex_lite::Regex;
use serde_json::Value as Json;

/// A parsed condition tree.
#[derive(Debug, Clone)]
pub enum Condition {
    Atom(Atom),
    /// A bare field, true when its value is truthy
    Truthy(Field),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    /// Empty condition
    Always,
}

#[derive(Debug, Clone)]
pub struct Atom {
    pub field: Field,
    pub op: Op,
    pub value: Literal,
    /// Compiled once for `MATCHES`
    regex: Option<Regex>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// `var.<path>`, local variables
    Var(String),
    /// `global.<path>`
    Global(String),
    /// The item text being rewritten
    Text,
    /// The requested view, `user` or `model`
    View,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Contains,
    NotContains,
    Matches,
    NotMatches,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Literal {
    fn text(&self) -> String {
        match self {
            Literal::Str(s) => s.clone(),
            Literal::Num(n) => format_number(*n),
            Literal::Bool(b) => b.to_string(),
        }
    }
}

/// What a condition is evaluated against.
pub struct EvalContext<'a> {
    pub variables: &'a VariableState,
    pub text: &'a str,
    pub view: View,
}

impl Condition {
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Atom(atom) => atom.evaluate(ctx),
            Condition::Truthy(field) => resolve(field, ctx).is_some_and(|v| truthy(&v)),
            Condition::And(a, b) => a.evaluate(ctx) && b.evaluate(ctx),
            Condition::Or(a, b) => a.evaluate(ctx) || b.evaluate(ctx),
            Condition::Not(inner) => !inner.evaluate(ctx),
        }
    }
}

fn resolve(field: &Field, ctx: &EvalContext<'_>) -> Option<Json> {
    match field {
        Field::Text => Some(Json::String(ctx.text.to_string())),
        Field::View => Some(Json::String(ctx.view.as_str().to_string())),
        Field::Var(path) => ctx.variables.get(VariableScope::Local, path).cloned(),
        Field::Global(path) => ctx.variables.get(VariableScope::Global, path).cloned(),
    }
}

/// Non-empty string, non-zero number, `true`, non-empty array or object.
pub fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn as_text(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

fn as_number(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse().ok(),
        Json::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn contains(value: &Json, needle: &Literal) -> bool {
    match value {
        Json::Array(items) => items.iter().any(|item| equals(item, needle)),
        Json::Object(map) => map.contains_key(&needle.text()),
        other => as_text(other).contains(&needle.text()),
    }
}

fn equals(value: &Json, literal: &Literal) -> bool {
    match literal {
        Literal::Num(n) => as_number(value).is_some_and(|x| (x - n).abs() < f64::EPSILON),
        Literal::Bool(b) => match value {
            Json::Bool(v) => v == b,
            other => as_text(other) == b.to_string(),
        },
        Literal::Str(s) => as_text(value) == *s,
    }
}

impl Atom {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        let Some(value) = resolve(&self.field, ctx) else {
            return matches!(
                self.op,
                Op::NotEq | Op::NotContains | Op::NotMatches | Op::NotStartsWith | Op::NotEndsWith
            );
        };
        let text = as_text(&value);
        let needle = self.value.text();
        match self.op {
            Op::Contains => contains(&value, &self.value),
            Op::NotContains => !contains(&value, &self.value),
            Op::Matches => self.regex.as_ref().is_some_and(|re| re.is_match(&text)),
            Op::NotMatches => self.regex.as_ref().is_some_and(|re| !re.is_match(&text)),
            Op::StartsWith => text.starts_with(&needle),
            Op::NotStartsWith => !text.starts_with(&needle),
            Op::EndsWith => text.ends_with(&needle),
            Op::NotEndsWith => !text.ends_with(&needle),
            Op::Eq => equals(&value, &self.value),
            Op::NotEq => !equals(&value, &self.value),
            Op::Gt => self.compare(&value, |a, b| a > b),
            Op::Lt => self.compare(&value, |a, b| a < b),
            Op::Gte => self.compare(&value, |a, b| a >= b),
            Op::Lte => self.compare(&value, |a, b| a <= b),
        }
    }

    fn compare(&self, value: &Json, cmp: impl Fn(f64, f64) -> bool) -> bool {
        match (as_number(value), &self.value) {
            (Some(x), Literal::Num(n)) => cmp(x, *n),
            _ => false,
        }
    }
}

// ─── Parser ──────────────────────────────────────────────────────────

/// Longest condition accepted, in tokens. The parsed tree is never deeper
/// than its token count, so this also bounds parser and evaluator recursion.
pub const MAX_CONDITION_TOKENS: usize = 256;

/// Parse a condition expression. Empty input is [`Condition::Always`].
pub fn parse_condition(input: &str) -> Result<Condition, String> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Condition::Always);
    }
    let tokens = tokenize(input)?;
    if tokens.len() > MAX_CONDITION_TOKENS {
        return Err(format!(
            "condition too long: {} tokens, limit {MAX_CONDITION_TOKENS}",
            tokens.len()
        ));
    }
    let (cond, rest) = parse_or(&tokens)?;
    if !rest.is_empty() {
        return Err(format!("unexpected tokens after expression: {rest:?}"));
    }
    Ok(cond)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    And,
    Or,
    Not,
    Contains,
    Matches,
    StartsWith,
    EndsWith,
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
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
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            // Keep regex escapes intact; only quotes and backslashes collapse
                            Some(escaped) if escaped == quote || escaped == '\\' => s.push(escaped),
                            Some(escaped) => {
                                s.push('\\');
                                s.push(escaped);
                            }
                            None => return Err("unterminated string literal".into()),
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err("unterminated string literal".into()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '>' | '<' => {
                chars.next();
                let eq = chars.peek() == Some(&'=');
                if eq {
                    chars.next();
                }
                tokens.push(match (c, eq) {
                    ('>', true) => Token::Gte,
                    ('>', false) => Token::Gt,
                    (_, true) => Token::Lte,
                    _ => Token::Lt,
                });
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Not);
                }
            }
            _ if c.is_ascii_digit() || c == '-' => {
                let mut num_str = String::new();
                num_str.push(c);
                chars.next();
                while let Some(&nc) = chars.peek() {
                    if nc.is_ascii_digit() || nc == '.' {
                        num_str.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = num_str
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number: {num_str}"))?;
                tokens.push(Token::Num(n));
            }
            _ if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&wc) = chars.peek() {
                    if is_word_char(wc) {
                        word.push(wc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.as_str() {
                    "AND" | "and" => Token::And,
                    "OR" | "or" => Token::Or,
                    "NOT" | "not" => Token::Not,
                    "CONTAINS" | "contains" => Token::Contains,
                    "MATCHES" | "matches" => Token::Matches,
                    "STARTS_WITH" | "starts_with" => Token::StartsWith,
                    "ENDS_WITH" | "ends_with" => Token::EndsWith,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            _ => return Err(format!("unexpected character: {c}")),
        }
    }

    Ok(tokens)
}

/// Path characters allowed in a field reference, `[0]` indices included.
fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '[' | ']')
}

fn parse_or(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    let (mut left, mut rest) = parse_and(tokens)?;
    while rest.first() == Some(&Token::Or) {
        let (right, remaining) = parse_and(&rest[1..])?;
        left = Condition::Or(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_and(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    let (mut left, mut rest) = parse_unary(tokens)?;
    while rest.first() == Some(&Token::And) {
        let (right, remaining) = parse_unary(&rest[1..])?;
        left = Condition::And(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_unary(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    if tokens.first() == Some(&Token::Not) {
        let (inner, rest) = parse_unary(&tokens[1..])?;
        return Ok((Condition::Not(Box::new(inner)), rest));
    }
    parse_primary(tokens)
}

fn parse_primary(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    if tokens.first() == Some(&Token::LParen) {
        let (inner, rest) = parse_or(&tokens[1..])?;
        if rest.first() != Some(&Token::RParen) {
            return Err("expected closing parenthesis".into());
        }
        return Ok((inner, &rest[1..]));
    }
    parse_atom(tokens)
}

fn parse_atom(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    let (field, rest) = parse_field(tokens)?;
    let Some((op, rest)) = parse_op(rest)? else {
        return Ok((Condition::Truthy(field), rest));
    };
    let (value, rest) = parse_value(rest)?;
    let regex = match op {
        Op::Matches | Op::NotMatches => Some(
            Regex::new(&value.text()).map_err(|e| format!("invalid pattern in condition: {e}"))?,
        ),
        _ => None,
    };
    Ok((
        Condition::Atom(Atom {
            field,
            op,
            value,
            regex,
        }),
        rest,
    ))
}

fn parse_field(tokens: &[Token]) -> Result<(Field, &[Token]), String> {
    let Some(Token::Ident(name)) = tokens.first() else {
        return Err(format!("expected field name, got {:?}", tokens.first()));
    };
    let field = if let Some(path) = name.strip_prefix("var.") {
        Field::Var(path.to_string())
    } else if let Some(path) = name.strip_prefix("global.") {
        Field::Global(path.to_string())
    } else {
        match name.as_str() {
            "text" => Field::Text,
            "view" => Field::View,
            other => return Err(format!("unknown field: {other}")),
        }
    };
    Ok((field, &tokens[1..]))
}

/// `None` when no operator follows the field.
fn parse_op(tokens: &[Token]) -> Result<Option<(Op, &[Token])>, String> {
    if tokens.first() == Some(&Token::Not) {
        // `NOT` after a field negates the operator that follows it
        let Some((base, rest)) = parse_base_op(&tokens[1..]) else {
            return Err(format!("expected operator after NOT, got {:?}", tokens.get(1)));
        };
        let negated = match base {
            Op::Contains => Op::NotContains,
            Op::Matches => Op::NotMatches,
            Op::StartsWith => Op::NotStartsWith,
            Op::EndsWith => Op::NotEndsWith,
            other => return Err(format!("cannot negate operator: {other:?}")),
        };
        return Ok(Some((negated, rest)));
    }
    Ok(parse_base_op(tokens))
}

fn parse_base_op(tokens: &[Token]) -> Option<(Op, &[Token])> {
    let op = match tokens.first()? {
        Token::Contains => Op::Contains,
        Token::Matches => Op::Matches,
        Token::StartsWith => Op::StartsWith,
        Token::EndsWith => Op::EndsWith,
        Token::Eq => Op::Eq,
        Token::NotEq => Op::NotEq,
        Token::Gt => Op::Gt,
        Token::Lt => Op::Lt,
        Token::Gte => Op::Gte,
        Token::Lte => Op::Lte,
        _ => return None,
    };
    Some((op, &tokens[1..]))
}

fn parse_value(tokens: &[Token]) -> Result<(Literal, &[Token]), String> {
    let value = match tokens.first() {
        Some(Token::Str(s)) => Literal::Str(s.clone()),
        Some(Token::Num(n)) => Literal::Num(*n),
        Some(Token::Ident(s)) if s == "true" => Literal::Bool(true),
        Some(Token::Ident(s)) if s == "false" => Literal::Bool(false),
        Some(Token::Ident(s)) => Literal::Str(s.clone()),
        other => return Err(format!("expected value, got {other:?}")),
    };
    Ok((value, &tokens[1..]))
}

// ─── Tests ──────────────────────────────────────────────────────────
