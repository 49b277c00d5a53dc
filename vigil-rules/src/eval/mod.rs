//! Evaluators decide whether ingested data satisfies a rule definition.

mod jq;
mod policy;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use vigil_protocol::EntityWithProperties;

use crate::error::{EngineError, EvalError};
use crate::ingest::IngestResult;
use crate::rule_type::EvalSpec;

pub use jq::JqEvaluator;
pub use policy::{Policy, PolicyEvaluator, PolicyMode};

pub const JQ: &str = "jq";
pub const DENY_BY_DEFAULT: &str = "deny-by-default";
pub const CONSTRAINTS: &str = "constraints";

/// Everything an evaluator may look at for one rule invocation.
#[derive(Debug, Clone, Copy)]
pub struct EvalInput<'a> {
    pub entity: &'a EntityWithProperties,
    pub def: &'a Value,
    pub params: &'a Value,
    pub ingested: &'a IngestResult,
}

impl EvalInput<'_> {
    /// JSON document exposed to policies as `input`.
    pub fn document(&self) -> Value {
        json!({
            "ingested": self.ingested.object,
            "profile": self.def,
            "params": self.params,
            "properties": self.entity.properties.to_plain_json(),
            "entity": self.entity.to_document(),
        })
    }
}

/// Successful evaluation result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalOutput {
    pub details: Value,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    fn kind(&self) -> &str;

    async fn eval(&self, input: &EvalInput<'_>) -> Result<EvalOutput, EvalError>;
}

pub type EvaluatorConstructor =
    Arc<dyn Fn(&EvalSpec) -> Result<Arc<dyn Evaluator>, EngineError> + Send + Sync>;

/// Tag to constructor table for evaluators.
#[derive(Clone)]
pub struct EvaluatorRegistry {
    constructors: HashMap<String, EvaluatorConstructor>,
}

impl fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.constructors.keys().collect();
        tags.sort();
        f.debug_struct("EvaluatorRegistry").field("tags", &tags).finish()
    }
}

impl EvaluatorRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(JQ, |spec| Ok(Arc::new(JqEvaluator::new(spec)?)));
        registry.register(DENY_BY_DEFAULT, |spec| {
            Ok(Arc::new(PolicyEvaluator::new(spec, PolicyMode::DenyByDefault)?))
        });
        registry.register(CONSTRAINTS, |spec| {
            Ok(Arc::new(PolicyEvaluator::new(spec, PolicyMode::Constraints)?))
        });
        registry
    }

    pub fn register<F>(&mut self, tag: impl Into<String>, constructor: F)
    where
        F: Fn(&EvalSpec) -> Result<Arc<dyn Evaluator>, EngineError> + Send + Sync + 'static,
    {
        self.constructors.insert(tag.into(), Arc::new(constructor));
    }

    pub fn build(&self, spec: &EvalSpec) -> Result<Arc<dyn Evaluator>, EngineError> {
        let constructor = self
            .constructors
            .get(&spec.kind)
            .ok_or_else(|| EngineError::UnknownEvaluator(spec.kind.clone()))?;
        constructor(spec)
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::repository;

    #[test]
    fn document_exposes_all_inputs() {
        let entity = repository();
        let ingested = IngestResult::object(json!({"enabled": true}));
        let input = EvalInput {
            entity: &entity,
            def: &json!({"enabled": true}),
            params: &json!({"branch": "main"}),
            ingested: &ingested,
        };
        let doc = input.document();
        assert_eq!(doc["ingested"]["enabled"], true);
        assert_eq!(doc["profile"]["enabled"], true);
        assert_eq!(doc["params"]["branch"], "main");
        assert_eq!(doc["properties"]["owner"], "foo");
        assert_eq!(doc["entity"]["name"], "foo/test");
    }

    #[test]
    fn unknown_evaluator_is_rejected() {
        let err = EvaluatorRegistry::with_builtins()
            .build(&EvalSpec::new("vulncheck"))
            .err()
            .unwrap();
        assert_eq!(err, EngineError::UnknownEvaluator("vulncheck".into()));
    }
}
