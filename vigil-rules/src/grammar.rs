//! `nom` grammar shared by selector expressions and policies.
//!
//! Whitespace and `#` line comments may appear between any two tokens. Nesting through
//! parentheses, lists, call arguments, index brackets and `!` is capped at [`MAX_DEPTH`].

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, anychar, char, digit1, multispace1, not_line_ending},
    combinator::{cut, map, opt, recognize, value, verify},
    error::{ContextError, ErrorKind, ParseError},
    multi::{fold_many0, many0, many0_count, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde_json::{Number, Value};

use crate::error::ExprError;
use crate::expr::{CompareOp, Expr, Step};

pub(crate) const MAX_DEPTH: usize = 32;

#[derive(Debug)]
enum Cause {
    Message(String),
    Rejected(ExprError),
}

/// Parse failure positioned by the unconsumed input at the point of failure.
#[derive(Debug)]
pub(crate) struct GrammarError<'a> {
    at: &'a str,
    cause: Cause,
}

impl<'a> GrammarError<'a> {
    pub(crate) fn new(at: &'a str, message: impl Into<String>) -> Self {
        Self {
            at,
            cause: Cause::Message(message.into()),
        }
    }

    fn rejected(at: &'a str, err: ExprError) -> Self {
        Self {
            at,
            cause: Cause::Rejected(err),
        }
    }

    fn into_expr_error(self, source: &str) -> ExprError {
        match self.cause {
            Cause::Rejected(err) => err,
            Cause::Message(message) => ExprError::Syntax {
                offset: offset(source, self.at),
                message,
            },
        }
    }
}

impl<'a> ParseError<&'a str> for GrammarError<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        match input.chars().next() {
            Some(found) => Self::new(input, format!("unexpected {found:?}")),
            None => Self::new(input, "unexpected end of input"),
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn or(self, other: Self) -> Self {
        if other.at.len() < self.at.len() {
            other
        } else {
            self
        }
    }
}

impl<'a> ContextError<&'a str> for GrammarError<'a> {
    fn add_context(_input: &'a str, context: &'static str, mut other: Self) -> Self {
        if let Cause::Message(message) = &mut other.cause {
            *message = format!("{message}, expected {context}");
        }
        other
    }
}

pub(crate) type PResult<'a, T> = IResult<&'a str, T, GrammarError<'a>>;

pub(crate) fn offset(source: &str, rest: &str) -> usize {
    source.len().saturating_sub(rest.len())
}

/// Converts a parser result into the public error type.
pub(crate) fn finish<'a, T>(
    source: &str,
    result: Result<T, nom::Err<GrammarError<'a>>>,
) -> Result<T, ExprError> {
    result.map_err(|err| match err {
        nom::Err::Error(err) | nom::Err::Failure(err) => err.into_expr_error(source),
        nom::Err::Incomplete(_) => ExprError::Syntax {
            offset: source.len(),
            message: "incomplete input".into(),
        },
    })
}

pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        offset,
        message: message.into(),
    }
}

/// Skips whitespace and comments.
pub(crate) fn sp(input: &str) -> PResult<'_, ()> {
    value(
        (),
        many0_count(alt((multispace1, preceded(char('#'), not_line_ending)))),
    )(input)
}

pub(crate) fn identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(input)
}

pub(crate) fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    verify(identifier, move |candidate: &str| candidate == word)
}

pub(crate) fn boolean(input: &str) -> PResult<'_, bool> {
    alt((value(true, keyword("true")), value(false, keyword("false"))))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> PResult<'a, String> {
    move |input: &'a str| {
        let (rest, _) = char(quote)(input)?;
        let (rest, text) = fold_many0(
            alt((
                preceded(
                    char('\\'),
                    map(anychar, |escaped| match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    }),
                ),
                verify(anychar, move |ch: &char| *ch != quote && *ch != '\\'),
            )),
            String::new,
            |mut text, ch| {
                text.push(ch);
                text
            },
        )(rest)?;
        let (rest, _) = char(quote)(rest).map_err(|_: nom::Err<GrammarError<'a>>| {
            nom::Err::Failure(GrammarError::new(input, "unterminated string"))
        })?;
        Ok((rest, text))
    }
}

/// A single- or double-quoted string with `\n`, `\t` and `\<char>` escapes.
pub(crate) fn string_literal(input: &str) -> PResult<'_, String> {
    alt((quoted('"'), quoted('\'')))(input)
}

fn number(input: &str) -> PResult<'_, Number> {
    let (rest, raw) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(pair(char('.'), digit1)),
    )))(input)?;
    let parsed = if raw.contains('.') {
        raw.parse::<f64>().ok().and_then(Number::from_f64)
    } else {
        raw.parse::<i64>().ok().map(Number::from)
    };
    match parsed {
        Some(number) => Ok((rest, number)),
        None => Err(nom::Err::Failure(GrammarError::new(
            input,
            format!("invalid number {raw}"),
        ))),
    }
}

fn too_deep(input: &str) -> nom::Err<GrammarError<'_>> {
    nom::Err::Failure(GrammarError::new(
        input,
        format!("expression nests deeper than {MAX_DEPTH} levels"),
    ))
}

/// Parses one expression at the given nesting depth.
pub(crate) fn expression(input: &str, depth: usize) -> PResult<'_, Expr> {
    if depth > MAX_DEPTH {
        return Err(too_deep(input));
    }
    let (input, first) = conjunction(input, depth)?;
    let (input, rest) = many0(preceded(
        pair(sp, tag("||")),
        cut(|i| conjunction(i, depth)),
    ))(input)?;
    Ok((input, flatten(first, rest, Expr::Any)))
}

fn conjunction(input: &str, depth: usize) -> PResult<'_, Expr> {
    let (input, first) = comparison(input, depth)?;
    let (input, rest) = many0(preceded(
        pair(sp, tag("&&")),
        cut(|i| comparison(i, depth)),
    ))(input)?;
    Ok((input, flatten(first, rest, Expr::All)))
}

fn flatten(first: Expr, rest: Vec<Expr>, combine: fn(Vec<Expr>) -> Expr) -> Expr {
    if rest.is_empty() {
        return first;
    }
    let mut terms = Vec::with_capacity(rest.len() + 1);
    terms.push(first);
    terms.extend(rest);
    combine(terms)
}

fn compare_op(input: &str) -> PResult<'_, CompareOp> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::In, keyword("in")),
    ))(input)
}

fn comparison(input: &str, depth: usize) -> PResult<'_, Expr> {
    let (input, left) = unary(input, depth)?;
    let (input, op) = opt(preceded(sp, compare_op))(input)?;
    let Some(op) = op else {
        return Ok((input, left));
    };
    let (input, right) = cut(|i| unary(i, depth))(input)?;
    Ok((input, Expr::Compare(op, Box::new(left), Box::new(right))))
}

fn unary(input: &str, depth: usize) -> PResult<'_, Expr> {
    let start = input;
    let (input, negations) = many0_count(preceded(sp, char('!')))(input)?;
    let depth = depth + negations;
    if depth > MAX_DEPTH {
        return Err(too_deep(start));
    }
    let (input, operand) = postfix(input, depth)?;
    let expr = (0..negations).fold(operand, |inner, _| Expr::Not(Box::new(inner)));
    Ok((input, expr))
}

fn step(input: &str, depth: usize) -> PResult<'_, Step> {
    alt((
        map(
            preceded(pair(sp, char('.')), cut(preceded(sp, identifier))),
            |name: &str| Step::Field(name.to_string()),
        ),
        map(
            delimited(
                pair(sp, char('[')),
                cut(|i| expression(i, depth + 1)),
                cut(preceded(sp, char(']'))),
            ),
            Step::Index,
        ),
    ))(input)
}

fn postfix(input: &str, depth: usize) -> PResult<'_, Expr> {
    let (input, base) = primary(input, depth)?;
    let (input, steps) = many0(|i| step(i, depth))(input)?;
    if steps.is_empty() {
        Ok((input, base))
    } else {
        Ok((input, Expr::Path(Box::new(base), steps)))
    }
}

fn arguments(input: &str, depth: usize) -> PResult<'_, Vec<Expr>> {
    separated_list0(preceded(sp, char(',')), |i| expression(i, depth + 1))(input)
}

fn group(input: &str, depth: usize) -> PResult<'_, Expr> {
    delimited(
        char('('),
        cut(|i| expression(i, depth + 1)),
        cut(preceded(sp, char(')'))),
    )(input)
}

fn list(input: &str, depth: usize) -> PResult<'_, Expr> {
    map(
        delimited(
            char('['),
            |i| arguments(i, depth),
            cut(preceded(sp, char(']'))),
        ),
        Expr::List,
    )(input)
}

fn word(input: &str, depth: usize) -> PResult<'_, Expr> {
    let (rest, name) = identifier(input)?;
    match name {
        "true" => return Ok((rest, Expr::Literal(Value::Bool(true)))),
        "false" => return Ok((rest, Expr::Literal(Value::Bool(false)))),
        "null" => return Ok((rest, Expr::Literal(Value::Null))),
        _ => {}
    }
    let (rest, args) = opt(preceded(
        pair(sp, char('(')),
        cut(terminated(
            |i| arguments(i, depth),
            preceded(sp, char(')')),
        )),
    ))(rest)?;
    match args {
        None => Ok((rest, Expr::Var(name.to_string()))),
        Some(args) => {
            check_call(input, name, args.len())?;
            Ok((rest, Expr::Call(name.to_string(), args)))
        }
    }
}

fn check_call<'a>(at: &'a str, name: &str, arity: usize) -> Result<(), nom::Err<GrammarError<'a>>> {
    let expected = match name {
        "has" | "size" => 1,
        "startsWith" | "endsWith" | "contains" | "matches" => 2,
        _ => {
            return Err(nom::Err::Failure(GrammarError::rejected(
                at,
                ExprError::UnknownFunction(name.to_string()),
            )))
        }
    };
    if arity != expected {
        return Err(nom::Err::Failure(GrammarError::new(
            at,
            format!("{name} expects {expected} argument(s), got {arity}"),
        )));
    }
    Ok(())
}

fn primary(input: &str, depth: usize) -> PResult<'_, Expr> {
    let (input, _) = sp(input)?;
    alt((
        map(string_literal, |text| Expr::Literal(Value::String(text))),
        map(number, |number| Expr::Literal(Value::Number(number))),
        |i| group(i, depth),
        |i| list(i, depth),
        |i| word(i, depth),
    ))(input)
}
