use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Shape or schema violation found while validating a profile, rule type or rule definition.
///
/// The rule type that triggered the failure is carried alongside the message so callers
/// can point users at the offending rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule_type: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            rule_type: None,
            message: message.into(),
        }
    }

    pub fn for_rule_type(rule_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_type: Some(rule_type.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rule_type {
            Some(rule_type) => write!(f, "validation failed for rule type {rule_type}: {}", self.message),
            None => write!(f, "validation failed: {}", self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Errors returned while reading profiles and rule types from their text formats.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read document")]
    Read(#[from] std::io::Error),
    #[error("failed to read document from {path}")]
    ReadPath {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(String),
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("failed to serialize document: {0}")]
    Serialize(String),
    #[error("unexpected document type {found:?}, expected {expected}")]
    UnexpectedKind { expected: &'static str, found: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors surfaced to rule type and profile create/update callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleTypeError {
    #[error("rule type {name} is invalid: {reason}")]
    RuleTypeInvalid { name: String, reason: String },
    #[error("rule type not found: {0}")]
    RuleNotFound(String),
    #[error("rule type already exists: {0}")]
    RuleAlreadyExists(String),
    #[error("cannot create a rule type or profile with a namespace through the API")]
    NamespacedWithoutSubscription,
    #[error("rule types and profiles from subscriptions must be namespaced: {0}")]
    MissingNamespace(String),
    #[error("namespace of {old} cannot change to {new}")]
    NamespaceChanged { old: String, new: String },
    #[error("cannot modify {0}: it is managed by a subscription")]
    ManagedBySubscription(String),
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("labels may only be attached to profiles from a subscription")]
    LabelsNotAllowed,
    #[error("labels cannot change after creation")]
    LabelsImmutable,
}

impl RuleTypeError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        RuleTypeError::RuleTypeInvalid {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome errors of a single rule evaluation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    /// The rule said "no".
    #[error("evaluation failure: {message}")]
    Failed { message: String, details: Value },
    /// The rule abstained.
    #[error("evaluation skipped: {0}")]
    Skipped(String),
    /// The rule abstained and nothing should be recorded.
    #[error("evaluation skipped silently")]
    SkipSilently,
    /// Infrastructure failure while ingesting or evaluating.
    #[error("evaluation error: {0}")]
    Error(String),
}

impl EvalError {
    pub fn failed(message: impl Into<String>) -> Self {
        EvalError::Failed {
            message: message.into(),
            details: Value::Null,
        }
    }
}

impl From<IngestError> for EvalError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Skipped(reason) => EvalError::Skipped(reason),
            other => EvalError::Error(other.to_string()),
        }
    }
}

/// Outcome errors of remediation and alert actions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("action failed: {0}")]
    Failed(String),
    #[error("action skipped: {0}")]
    Skipped(String),
    #[error("action not available: {0}")]
    NotAvailable(String),
    #[error("remediation skipped")]
    RemediationSkipped,
    #[error("action error: {0}")]
    Error(String),
}

/// Errors raised by ingesters. Cloneable so one failed build can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("invalid ingester configuration: {0}")]
    Config(String),
    #[error("provider does not support {0}")]
    Unsupported(&'static str),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("upstream resource not found: {0}")]
    NotFound(String),
    #[error("failed to parse ingested data: {0}")]
    Parse(String),
    #[error("failed to render template: {0}")]
    Template(String),
    #[error("ingest skipped: {0}")]
    Skipped(String),
}

/// Errors raised by a provider client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("entity not found upstream: {0}")]
    NotFound(String),
    #[error("operation not supported by provider: {0}")]
    Unsupported(String),
    #[error("missing property {0}")]
    MissingProperty(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl From<ProviderError> for IngestError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(what) => IngestError::NotFound(what),
            other => IngestError::Upstream(other.to_string()),
        }
    }
}

/// Errors raised while building a rule-type engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("rule type {rule_type}: invalid {which} schema: {reason}")]
    Schema {
        rule_type: String,
        which: &'static str,
        reason: String,
    },
    #[error("unknown ingester type {0:?}")]
    UnknownIngester(String),
    #[error("unknown evaluator type {0:?}")]
    UnknownEvaluator(String),
    #[error("unknown action type {0:?}")]
    UnknownAction(String),
    #[error("invalid {component} configuration: {reason}")]
    InvalidConfig {
        component: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl EngineError {
    pub fn config(component: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidConfig {
            component,
            reason: reason.into(),
        }
    }
}

/// Errors raised while compiling or evaluating an expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("type error: {0}")]
    Type(String),
    #[error("unknown function {0}")]
    UnknownFunction(String),
}
