//! A small boolean expression language over JSON documents.
//!
//! Used by profile selectors and the policy evaluators. Supports literals (strings,
//! numbers, booleans, `null`, lists), dotted paths with `[index]` access, comparison
//! operators, `in`, `&&`, `||`, `!`, parentheses and a handful of functions
//! (`has`, `startsWith`, `endsWith`, `contains`, `size`, `matches`).
//!
//! Missing fields resolve to `null` rather than failing, so `has(x.y)` and
//! comparisons against absent data behave predictably.

use std::cmp::Ordering;

use nom::sequence::terminated;
use regex::Regex;
use serde_json::Value;

use crate::error::ExprError;
use crate::grammar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

/// Parsed expression tree.
///
/// `&&` and `||` chains are kept flat, as are chains of field and index accesses.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Var(String),
    Path(Box<Expr>, Vec<Step>),
    Not(Box<Expr>),
    All(Vec<Expr>),
    Any(Vec<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// One access step applied to a value: `.name` or `[expr]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Field(String),
    Index(Expr),
}

impl Expr {
    /// Parses a complete expression.
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let (rest, ()) = grammar::finish(input, grammar::sp(input))?;
        if rest.is_empty() {
            return Err(grammar::syntax(input.len(), "empty expression"));
        }
        let (rest, expr) = grammar::finish(
            input,
            terminated(|i| grammar::expression(i, 0), grammar::sp)(rest),
        )?;
        if !rest.is_empty() {
            return Err(grammar::syntax(
                grammar::offset(input, rest),
                "unexpected trailing input",
            ));
        }
        Ok(expr)
    }

    /// Evaluates the expression against a root document whose top-level keys are variables.
    pub fn eval(&self, root: &Value) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::List(items) => items
                .iter()
                .map(|item| item.eval(root))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Var(name) => Ok(root.get(name).cloned().unwrap_or(Value::Null)),
            Expr::Path(base, steps) => {
                let mut current = base.eval(root)?;
                for step in steps {
                    current = match step {
                        Step::Field(name) => current.get(name).cloned().unwrap_or(Value::Null),
                        Step::Index(index) => index_value(&current, &index.eval(root)?),
                    };
                }
                Ok(current)
            }
            Expr::Not(inner) => Ok(Value::Bool(!as_bool(&inner.eval(root)?, "!")?)),
            Expr::All(terms) => {
                for term in terms {
                    if !as_bool(&term.eval(root)?, "&&")? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Any(terms) => {
                for term in terms {
                    if as_bool(&term.eval(root)?, "||")? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Compare(op, left, right) => {
                let left = left.eval(root)?;
                let right = right.eval(root)?;
                compare(*op, &left, &right).map(Value::Bool)
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| arg.eval(root))
                    .collect::<Result<Vec<_>, _>>()?;
                call(name, &args)
            }
        }
    }

    /// Evaluates the expression and requires a boolean result.
    pub fn eval_bool(&self, root: &Value) -> Result<bool, ExprError> {
        as_bool(&self.eval(root)?, "expression")
    }
}

fn index_value(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn as_bool(value: &Value, context: &str) -> Result<bool, ExprError> {
    value
        .as_bool()
        .ok_or_else(|| ExprError::Type(format!("{context} expects a boolean, got {value}")))
}

fn as_str<'a>(value: &'a Value, function: &str) -> Result<&'a str, ExprError> {
    value
        .as_str()
        .ok_or_else(|| ExprError::Type(format!("{function} expects a string, got {value}")))
}

/// JSON equality with numeric tolerance, so `1 == 1.0`.
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(lhs), Value::Number(rhs)) => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(l), Some(r)) if lhs.is_f64() || rhs.is_f64() => (l - r).abs() < f64::EPSILON,
            _ => lhs == rhs,
        },
        (Value::Array(lhs), Value::Array(rhs)) => {
            lhs.len() == rhs.len() && lhs.iter().zip(rhs).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(lhs), Value::Object(rhs)) => {
            lhs.len() == rhs.len()
                && lhs
                    .iter()
                    .all(|(key, l)| rhs.get(key).map_or(false, |r| values_equal(l, r)))
        }
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Result<Ordering, ExprError> {
    match (left, right) {
        (Value::Number(lhs), Value::Number(rhs)) => {
            let (Some(l), Some(r)) = (lhs.as_f64(), rhs.as_f64()) else {
                return Err(ExprError::Type("numbers are not comparable".into()));
            };
            l.partial_cmp(&r)
                .ok_or_else(|| ExprError::Type("numbers are not comparable".into()))
        }
        (Value::String(lhs), Value::String(rhs)) => Ok(lhs.cmp(rhs)),
        _ => Err(ExprError::Type(format!("cannot order {left} and {right}"))),
    }
}

fn contains(haystack: &Value, needle: &Value, function: &str) -> Result<bool, ExprError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(map) => Ok(map.contains_key(as_str(needle, function)?)),
        Value::String(text) => Ok(text.contains(as_str(needle, function)?)),
        Value::Null => Ok(false),
        other => Err(ExprError::Type(format!("{function} cannot search {other}"))),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    Ok(match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Lt => order(left, right)? == Ordering::Less,
        CompareOp::Le => order(left, right)? != Ordering::Greater,
        CompareOp::Gt => order(left, right)? == Ordering::Greater,
        CompareOp::Ge => order(left, right)? != Ordering::Less,
        CompareOp::In => contains(right, left, "in")?,
    })
}

fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match (name, args) {
        ("has", [value]) => Ok(Value::Bool(!value.is_null())),
        ("size", [value]) => {
            let size = match value {
                Value::String(text) => text.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => return Err(ExprError::Type(format!("size of {other} is undefined"))),
            };
            Ok(Value::from(size as u64))
        }
        ("startsWith", [text, prefix]) => Ok(Value::Bool(
            as_str(text, name)?.starts_with(as_str(prefix, name)?),
        )),
        ("endsWith", [text, suffix]) => Ok(Value::Bool(
            as_str(text, name)?.ends_with(as_str(suffix, name)?),
        )),
        ("contains", [haystack, needle]) => contains(haystack, needle, name).map(Value::Bool),
        ("matches", [text, pattern]) => {
            let pattern = Regex::new(as_str(pattern, name)?)
                .map_err(|err| ExprError::Type(format!("invalid pattern: {err}")))?;
            Ok(Value::Bool(pattern.is_match(as_str(text, name)?)))
        }
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}
