use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;
use vigil_protocol::EntityWithProperties;

use crate::actions::{ActionContext, ActionEngine};
use crate::error::{EngineError, EvalError, ValidationError};
use crate::eval::{EvalInput, Evaluator, EvaluatorRegistry};
use crate::ingest::{fingerprint, IngestCache, Ingester, IngesterRegistry};
use crate::outcome::{ActionsOutcome, EvalOutcome};
use crate::profile::ActionState;
use crate::provider::Provider;
use crate::rule_type::RuleType;
use crate::schema::{is_empty_schema, SchemaValidator};

/// Ingester and evaluator constructors available to rule-type engines.
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    pub ingesters: IngesterRegistry,
    pub evaluators: EvaluatorRegistry,
}

/// A rule type bound to one provider and one evaluation's ingest cache.
pub struct RuleTypeEngine {
    rule_type: RuleType,
    rule_validator: SchemaValidator,
    param_validator: Option<SchemaValidator>,
    ingester: Arc<dyn Ingester>,
    evaluator: Arc<dyn Evaluator>,
    actions: ActionEngine,
    provider_id: Uuid,
    cache: IngestCache,
}

impl fmt::Debug for RuleTypeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleTypeEngine")
            .field("rule_type", &self.rule_type.name)
            .field("ingest", &self.ingester.kind())
            .field("eval", &self.evaluator.kind())
            .field("actions", &self.actions)
            .field("provider_id", &self.provider_id)
            .finish()
    }
}

impl RuleTypeEngine {
    pub fn new(
        rule_type: RuleType,
        provider: Arc<dyn Provider>,
        provider_id: Uuid,
        cache: IngestCache,
    ) -> Result<Self, EngineError> {
        Self::with_registry(rule_type, provider, provider_id, cache, &EngineRegistry::default())
    }

    pub fn with_registry(
        rule_type: RuleType,
        provider: Arc<dyn Provider>,
        provider_id: Uuid,
        cache: IngestCache,
        registry: &EngineRegistry,
    ) -> Result<Self, EngineError> {
        rule_type.validate()?;

        let schema_error = |which: &'static str, reason: String| EngineError::Schema {
            rule_type: rule_type.name.clone(),
            which,
            reason,
        };
        let rule_validator = SchemaValidator::compile(&rule_type.def.rule_schema)
            .map_err(|reason| schema_error("rule", reason))?;
        let param_validator = match rule_type.def.param_schema.as_ref() {
            schema if is_empty_schema(schema) => None,
            Some(schema) => Some(
                SchemaValidator::compile(schema).map_err(|reason| schema_error("param", reason))?,
            ),
            None => None,
        };

        let ingester = registry
            .ingesters
            .build(&rule_type.def.ingest, provider.clone())?;
        let evaluator = registry.evaluators.build(&rule_type.def.eval)?;
        let actions = ActionEngine::new(&rule_type, provider)?;

        Ok(Self {
            rule_type,
            rule_validator,
            param_validator,
            ingester,
            evaluator,
            actions,
            provider_id,
            cache,
        })
    }

    pub fn rule_type(&self) -> &RuleType {
        &self.rule_type
    }

    /// Checks a rule definition against the rule schema.
    pub fn validate_definition(&self, def: &Value) -> Result<(), ValidationError> {
        self.rule_validator.validate(def).map_err(|errors| {
            ValidationError::for_rule_type(
                &self.rule_type.name,
                format!("invalid rule definition: {}", errors.join("; ")),
            )
        })
    }

    /// Checks rule parameters. Absent and empty parameters are always accepted.
    pub fn validate_params(&self, params: &Value) -> Result<(), ValidationError> {
        let keys = match params {
            Value::Null => return Ok(()),
            Value::Object(map) if map.is_empty() => return Ok(()),
            Value::Object(map) => map,
            other => {
                return Err(ValidationError::for_rule_type(
                    &self.rule_type.name,
                    format!("parameters must be an object, got {other}"),
                ))
            }
        };
        match &self.param_validator {
            Some(validator) => validator.validate(params).map_err(|errors| {
                ValidationError::for_rule_type(
                    &self.rule_type.name,
                    format!("invalid parameters: {}", errors.join("; ")),
                )
            }),
            None => {
                let unknown: Vec<&str> = keys.keys().map(String::as_str).collect();
                Err(ValidationError::for_rule_type(
                    &self.rule_type.name,
                    format!("unknown parameters: {}", unknown.join(", ")),
                ))
            }
        }
    }

    /// Validates, ingests (through the cache) and evaluates one rule invocation.
    #[instrument(skip_all, fields(rule_type = %self.rule_type.name, entity_id = %entity.id()))]
    pub async fn eval(
        &self,
        entity: &EntityWithProperties,
        def: &Value,
        params: &Value,
    ) -> EvalOutcome {
        if let Err(err) = self
            .validate_definition(def)
            .and_then(|_| self.validate_params(params))
        {
            return EvalOutcome::error(err.to_string());
        }

        let key = fingerprint(
            &self.rule_type.cache_key(),
            entity.id(),
            params,
            self.provider_id,
        );
        let ingested = match self
            .cache
            .get_or_ingest(&key, || self.ingester.ingest(entity, params))
            .await
        {
            Ok(ingested) => ingested,
            Err(err) => {
                debug!(error = %err, "ingest failed");
                return EvalOutcome::new(Err(EvalError::from(err)));
            }
        };

        let result = self
            .evaluator
            .eval(&EvalInput {
                entity,
                def,
                params,
                ingested: &ingested,
            })
            .await;
        EvalOutcome {
            result,
            ingested: Some(ingested),
        }
    }

    pub async fn actions(
        &self,
        remediate_state: ActionState,
        alert_state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> ActionsOutcome {
        self.actions.run(remediate_state, alert_state, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::{repository, FakeProvider};
    use crate::ingest::IngestResult;
    use crate::outcome::EvalStatus;
    use crate::rule_type::{EvalSpec, IngestSpec, RuleTypeDef};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vigil_protocol::EntityType;

    fn rule_type(param_schema: Option<Value>, policy: &str) -> RuleType {
        RuleType::new(
            "branch_protection",
            RuleTypeDef {
                in_entity: EntityType::Repository,
                rule_schema: json!({
                    "type": "object",
                    "properties": {"enabled": {"type": "boolean"}},
                    "required": ["enabled"]
                }),
                param_schema,
                ingest: IngestSpec::new("counting"),
                eval: EvalSpec::new("deny-by-default").with("policy", json!(policy)),
                remediate: None,
                alert: None,
            },
        )
    }

    struct CountingIngester {
        spec: IngestSpec,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Ingester for CountingIngester {
        fn kind(&self) -> &str {
            "counting"
        }

        fn config(&self) -> &IngestSpec {
            &self.spec
        }

        async fn ingest(
            &self,
            _entity: &EntityWithProperties,
            _params: &Value,
        ) -> Result<IngestResult, crate::error::IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(IngestResult::object(json!({"enabled": true})))
        }
    }

    fn registry(calls: Arc<AtomicUsize>) -> EngineRegistry {
        let mut registry = EngineRegistry::default();
        registry.ingesters.register("counting", move |spec, _| {
            Ok(Arc::new(CountingIngester {
                spec: spec.clone(),
                calls: calls.clone(),
            }))
        });
        registry
    }

    fn engine(rule_type: RuleType, cache: IngestCache, calls: Arc<AtomicUsize>) -> RuleTypeEngine {
        RuleTypeEngine::with_registry(
            rule_type,
            Arc::new(FakeProvider::default()),
            Uuid::new_v4(),
            cache,
            &registry(calls),
        )
        .unwrap()
    }

    const ALLOW_ENABLED: &str =
        "default allow = false\nallow { input.ingested.enabled == input.profile.enabled }";

    #[tokio::test]
    async fn evaluates_against_ingested_data() {
        let engine = engine(
            rule_type(None, ALLOW_ENABLED),
            IngestCache::shared(),
            Arc::default(),
        );
        let entity = repository();
        let outcome = engine.eval(&entity, &json!({"enabled": true}), &Value::Null).await;
        assert_eq!(outcome.status(), EvalStatus::Success);
        assert!(outcome.ingested.is_some());

        let outcome = engine.eval(&entity, &json!({"enabled": false}), &Value::Null).await;
        assert_eq!(outcome.status(), EvalStatus::Failure);
    }

    #[tokio::test]
    async fn invalid_definition_is_an_error() {
        let engine = engine(
            rule_type(None, ALLOW_ENABLED),
            IngestCache::shared(),
            Arc::default(),
        );
        let outcome = engine
            .eval(&repository(), &json!({"enabled": "yes"}), &Value::Null)
            .await;
        assert_eq!(outcome.status(), EvalStatus::Error);
        assert!(outcome.details().contains("branch_protection"));
        assert!(outcome.details().contains("/enabled"));
    }

    #[test]
    fn params_without_schema_reject_unknown_keys() {
        let engine = engine(
            rule_type(None, ALLOW_ENABLED),
            IngestCache::shared(),
            Arc::default(),
        );
        engine.validate_params(&Value::Null).unwrap();
        engine.validate_params(&json!({})).unwrap();
        let err = engine.validate_params(&json!({"branch": "main"})).unwrap_err();
        assert!(err.to_string().contains("unknown parameters: branch"));
    }

    #[test]
    fn params_are_checked_against_schema() {
        let engine = engine(
            rule_type(
                Some(json!({"type": "object", "properties": {"branch": {"type": "string"}}})),
                ALLOW_ENABLED,
            ),
            IngestCache::shared(),
            Arc::default(),
        );
        engine.validate_params(&json!({"branch": "main"})).unwrap();
        assert!(engine.validate_params(&json!({"branch": 1})).is_err());
    }

    #[tokio::test]
    async fn shared_cache_ingests_once_per_fingerprint() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(rule_type(None, ALLOW_ENABLED), IngestCache::shared(), calls.clone());
        let entity = repository();
        let def = json!({"enabled": true});
        let empty = json!({});
        let (first, second) = tokio::join!(
            engine.eval(&entity, &def, &Value::Null),
            engine.eval(&entity, &def, &empty),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(
            first.ingested.as_ref().unwrap(),
            second.ingested.as_ref().unwrap()
        ));
    }

    #[tokio::test]
    async fn noop_cache_ingests_every_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(rule_type(None, ALLOW_ENABLED), IngestCache::noop(), calls.clone());
        let entity = repository();
        for _ in 0..2 {
            engine.eval(&entity, &json!({"enabled": true}), &Value::Null).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bad_schema_fails_construction() {
        let mut bad = rule_type(None, ALLOW_ENABLED);
        bad.def.rule_schema = json!({"type": "object", "properties": {"x": {"type": 12}}});
        let err = RuleTypeEngine::with_registry(
            bad,
            Arc::new(FakeProvider::default()),
            Uuid::new_v4(),
            IngestCache::shared(),
            &registry(Arc::default()),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Schema { which: "rule", .. }));
    }
}
