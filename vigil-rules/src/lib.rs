//! Profile and rule-type domain plus the rule-type engine.
//!
//! Rule types describe how to fetch data for an entity (an *ingester*), how to judge it
//! (an *evaluator*) and what to do about a failure (remediation and alerting). Profiles
//! are ordered lists of rule invocations per entity type. Documents are read from YAML
//! or JSON, validated, and checked for backward compatibility on update.

pub mod actions;
pub mod compat;
mod engine;
mod error;
pub mod eval;
mod expr;
mod grammar;
pub mod ingest;
mod merge;
pub mod namespace;
mod outcome;
mod parse;
mod profile;
pub mod provider;
mod rule_type;
pub mod schema;
mod selectors;
pub mod template;

pub use actions::{ActionContext, ActionEngine, Alerter, Remediator};
pub use compat::{check_schema_compat, validate_rule_type_update};
pub use engine::{EngineRegistry, RuleTypeEngine};
pub use error::{
    ActionError, EngineError, EvalError, ExprError, IngestError, ParseError, ProviderError,
    RuleTypeError, ValidationError,
};
pub use eval::{EvalInput, EvalOutput, Evaluator, EvaluatorRegistry};
pub use expr::{CompareOp, Expr, Step};
pub use ingest::{fingerprint, IngestCache, IngestResult, Ingester, IngesterRegistry};
pub use merge::{merge_profile_rows, ProfileRow};
pub use outcome::{
    ActionOutput, ActionsOutcome, AlertOutput, AlertStatus, EvalOutcome, EvalStatus,
    PreviousEvaluation, RemediationStatus,
};
pub use parse::{
    load_documents, parse_profile, parse_profile_unscoped, parse_rule_type, profile_to_yaml,
    rule_type_to_yaml, Document, Format,
};
pub use profile::{ActionState, Profile, ProfileSelector, RuleInvocation, PROFILE_KIND};
pub use provider::{ClonedRepo, GitClient, Provider, RestClient, RestRequest, RestResponse};
pub use rule_type::{
    ActionSpec, Context, EvalSpec, IngestSpec, PluginSpec, ReleasePhase, RuleType, RuleTypeDef,
    Severity, SeveritySpec, DOCUMENT_VERSION, RULE_TYPE_KIND,
};
pub use selectors::{Selected, Selection};
