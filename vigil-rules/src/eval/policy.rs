//! Policy evaluators written in the expression language.
//!
//! A policy is a list of statements:
//!
//! ```text
//! default allow = false
//! message = "branch protection is disabled"
//! allow { input.ingested.enabled == input.profile.enabled }
//! skip { input.properties.is_archived }
//! violation "secret scanning is off" { !input.ingested.secret_scanning }
//! ```
//!
//! Several expressions inside one block must all hold. Several blocks with the same head
//! are alternatives. An expression that fails with a type error does not hold.

use async_trait::async_trait;
use nom::{
    branch::alt,
    character::complete::char,
    combinator::{cut, map, opt},
    error::context,
    multi::many1,
    sequence::{pair, preceded, terminated, tuple},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{EvalInput, EvalOutput, Evaluator};
use crate::error::{EngineError, EvalError, ExprError};
use crate::expr::Expr;
use crate::grammar::{self, keyword, sp, PResult};
use crate::ingest::section_config;
use crate::rule_type::EvalSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// Fails unless `allow` holds.
    DenyByDefault,
    /// Fails when any `violation` block holds.
    Constraints,
}

impl PolicyMode {
    fn tag(self) -> &'static str {
        match self {
            PolicyMode::DenyByDefault => super::DENY_BY_DEFAULT,
            PolicyMode::Constraints => super::CONSTRAINTS,
        }
    }
}

type Block = Vec<Expr>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
    pub default_allow: Option<bool>,
    pub message: Option<String>,
    pub allow: Vec<Block>,
    pub skip: Vec<Block>,
    pub violations: Vec<(String, Block)>,
}

enum Statement {
    DefaultAllow(bool),
    Message(String),
    Allow(Block),
    Skip(Block),
    Violation(String, Block),
}

fn block(input: &str) -> PResult<'_, Block> {
    context(
        "a `{ ... }` block with at least one expression",
        preceded(
            pair(sp, char('{')),
            cut(terminated(
                many1(|i| grammar::expression(i, 0)),
                pair(sp, char('}')),
            )),
        ),
    )(input)
}

fn default_allow(input: &str) -> PResult<'_, Statement> {
    preceded(
        keyword("default"),
        cut(context(
            "`default allow = <bool>`",
            map(
                preceded(
                    tuple((sp, keyword("allow"), sp, char('='), sp)),
                    grammar::boolean,
                ),
                Statement::DefaultAllow,
            ),
        )),
    )(input)
}

fn message(input: &str) -> PResult<'_, Statement> {
    preceded(
        keyword("message"),
        cut(context(
            "`message = <string>`",
            map(
                preceded(tuple((sp, char('='), sp)), grammar::string_literal),
                Statement::Message,
            ),
        )),
    )(input)
}

fn violation(input: &str) -> PResult<'_, Statement> {
    let (input, _) = keyword("violation")(input)?;
    let (input, message) = opt(preceded(sp, grammar::string_literal))(input)?;
    let (input, block) = block(input)?;
    let message = message.unwrap_or_else(|| "policy violation".to_string());
    Ok((input, Statement::Violation(message, block)))
}

fn statement(input: &str) -> PResult<'_, Statement> {
    alt((
        default_allow,
        message,
        map(preceded(keyword("allow"), block), Statement::Allow),
        map(preceded(keyword("skip"), block), Statement::Skip),
        violation,
    ))(input)
}

impl Policy {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut policy = Policy::default();
        let mut input = source;
        loop {
            let (rest, ()) = grammar::finish(source, sp(input))?;
            if rest.is_empty() {
                return Ok(policy);
            }
            let start = grammar::offset(source, rest);
            let (rest, parsed) = grammar::finish(source, statement(rest))?;
            match parsed {
                Statement::DefaultAllow(value) => {
                    if policy.default_allow.replace(value).is_some() {
                        return Err(grammar::syntax(start, "duplicate `default allow`"));
                    }
                }
                Statement::Message(message) => policy.message = Some(message),
                Statement::Allow(block) => policy.allow.push(block),
                Statement::Skip(block) => policy.skip.push(block),
                Statement::Violation(message, block) => policy.violations.push((message, block)),
            }
            input = rest;
        }
    }
}

fn holds(block: &Block, root: &Value) -> bool {
    block.iter().all(|expr| match expr.eval_bool(root) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "policy expression is undefined");
            false
        }
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PolicyConfig {
    #[serde(default, alias = "policy")]
    def: String,
}

#[derive(Debug)]
pub struct PolicyEvaluator {
    mode: PolicyMode,
    policy: Policy,
}

impl PolicyEvaluator {
    /// Reads the policy text from the evaluator section (`def`) or a top-level `policy` key.
    pub fn new(spec: &EvalSpec, mode: PolicyMode) -> Result<Self, EngineError> {
        let component = match mode {
            PolicyMode::DenyByDefault => "deny-by-default evaluator",
            PolicyMode::Constraints => "constraints evaluator",
        };
        let config: PolicyConfig = section_config(spec, component)?;
        let source = if config.def.trim().is_empty() {
            spec.get("policy")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        } else {
            config.def
        };
        if source.trim().is_empty() {
            return Err(EngineError::config(component, "policy cannot be empty"));
        }

        let policy =
            Policy::parse(&source).map_err(|err| EngineError::config(component, err.to_string()))?;
        match mode {
            PolicyMode::DenyByDefault if !policy.violations.is_empty() => Err(EngineError::config(
                component,
                "violation blocks need the constraints evaluator",
            )),
            PolicyMode::Constraints
                if !policy.allow.is_empty()
                    || policy.default_allow.is_some()
                    || policy.message.is_some() =>
            {
                Err(EngineError::config(
                    component,
                    "allow rules need the deny-by-default evaluator",
                ))
            }
            PolicyMode::DenyByDefault if policy.allow.is_empty() && policy.default_allow.is_none() => {
                Err(EngineError::config(component, "policy never allows"))
            }
            _ => Ok(Self { mode, policy }),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }
}

#[async_trait]
impl Evaluator for PolicyEvaluator {
    fn kind(&self) -> &str {
        self.mode.tag()
    }

    async fn eval(&self, input: &EvalInput<'_>) -> Result<EvalOutput, EvalError> {
        let root = json!({ "input": input.document() });

        if self.policy.skip.iter().any(|block| holds(block, &root)) {
            return Err(EvalError::Skipped("skip condition matched".into()));
        }

        match self.mode {
            PolicyMode::DenyByDefault => {
                let allowed = self.policy.allow.iter().any(|block| holds(block, &root))
                    || self.policy.default_allow.unwrap_or(false);
                if allowed {
                    Ok(EvalOutput::default())
                } else {
                    Err(EvalError::Failed {
                        message: self
                            .policy
                            .message
                            .clone()
                            .unwrap_or_else(|| "denied by policy".into()),
                        details: Value::Null,
                    })
                }
            }
            PolicyMode::Constraints => {
                let violations: Vec<&str> = self
                    .policy
                    .violations
                    .iter()
                    .filter(|(_, block)| holds(block, &root))
                    .map(|(message, _)| message.as_str())
                    .collect();
                if violations.is_empty() {
                    return Ok(EvalOutput::default());
                }
                Err(EvalError::Failed {
                    message: format!(
                        "{} violation(s): {}",
                        violations.len(),
                        violations.join("; ")
                    ),
                    details: json!({ "violations": violations }),
                })
            }
        }
    }
}
