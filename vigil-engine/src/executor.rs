//! Evaluates every applicable rule for one entity event.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vigil_protocol::{EntityInfoWrapper, EntityInstance, EntityType, EntityWithProperties};
use vigil_rules::{
    ActionContext, ActionsOutcome, AlertStatus, EngineRegistry, EvalOutcome, EvalStatus,
    IngestCache, Profile, Provider, RemediationStatus, RuleInvocation, RuleTypeEngine, Selected,
    Selection,
};

use crate::bus::Publisher;
use crate::config::EngineConfig;
use crate::context::CancelToken;
use crate::error::{ExecutorError, StoreError};
use crate::lease::LeaseCoordinator;
use crate::providers::ProviderManager;
use crate::status::StatusGateway;
use crate::store::{with_transaction, RuleEvaluationKey, Store};

/// Outcome of one rule invocation, as reported in the evaluation telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSummary {
    pub profile: String,
    pub rule_type: String,
    pub rule_name: String,
    pub eval: EvalStatus,
    pub remediation: RemediationStatus,
    pub alert: AlertStatus,
}

impl RuleSummary {
    fn new(
        profile: &Profile,
        rule_type: String,
        rule_name: String,
        eval: &EvalOutcome,
        actions: &ActionsOutcome,
    ) -> Self {
        Self {
            profile: profile.name.clone(),
            rule_type,
            rule_name,
            eval: eval.status(),
            remediation: actions.remediate_status(),
            alert: actions.alert_status(),
        }
    }
}

impl fmt::Display for RuleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: eval={} remediate={} alert={}",
            self.profile, self.rule_name, self.eval, self.remediation, self.alert
        )
    }
}

/// Telemetry record of one entity evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvaluationSummary {
    pub rules: Vec<RuleSummary>,
    pub duration: Duration,
}

type EngineSlot = Result<Arc<RuleTypeEngine>, String>;

/// Rule-type engines of one evaluation, built on first use.
struct EngineCache {
    provider: Arc<dyn Provider>,
    provider_id: Uuid,
    ingest: IngestCache,
    engines: HashMap<Uuid, EngineSlot>,
}

impl EngineCache {
    fn get_or_build(
        &mut self,
        rule_type: vigil_rules::RuleType,
        rule_type_id: Uuid,
        registry: &EngineRegistry,
    ) -> EngineSlot {
        if let Some(slot) = self.engines.get(&rule_type_id) {
            return slot.clone();
        }
        let slot = RuleTypeEngine::with_registry(
            rule_type,
            self.provider.clone(),
            self.provider_id,
            self.ingest.clone(),
            registry,
        )
        .map(Arc::new)
        .map_err(|err| err.to_string());
        self.engines.insert(rule_type_id, slot.clone());
        slot
    }
}

pub struct Executor {
    store: Arc<dyn Store>,
    providers: Arc<dyn ProviderManager>,
    publisher: Arc<dyn Publisher>,
    registry: EngineRegistry,
    status: StatusGateway,
    leases: LeaseCoordinator,
    flush_topic: String,
}

impl Executor {
    pub fn new(
        store: Arc<dyn Store>,
        providers: Arc<dyn ProviderManager>,
        publisher: Arc<dyn Publisher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            status: StatusGateway::new(store.clone()),
            leases: LeaseCoordinator::new(store.clone()),
            store,
            providers,
            publisher,
            registry: EngineRegistry::default(),
            flush_topic: config.flush_topic.clone(),
        }
    }

    /// Replaces the ingester and evaluator constructors available to rule types.
    pub fn with_registry(mut self, registry: EngineRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Evaluates the entity, then releases its lease and publishes a flush message.
    ///
    /// The flush is published whatever the outcome, including cancellation.
    #[instrument(skip_all, fields(entity_id = %wrapper.entity_id, project_id = %wrapper.project_id))]
    pub async fn eval_entity_event(
        &self,
        wrapper: &EntityInfoWrapper,
        cancel: &CancelToken,
    ) -> Result<EvaluationSummary, ExecutorError> {
        let execution_id = wrapper
            .execution_id
            .ok_or(ExecutorError::MissingExecutionId)?;
        let started = Instant::now();
        let mut resolved = None;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
            result = self.evaluate(wrapper, execution_id, &mut resolved) => result,
        };

        self.leases.release(wrapper.entity_id, execution_id).await;
        self.flush(wrapper, resolved.as_ref(), execution_id).await;

        let duration = started.elapsed();
        match &result {
            Ok(rules) => {
                let rendered: Vec<String> = rules.iter().map(ToString::to_string).collect();
                info!(
                    execution_id = %execution_id,
                    entity_type = %wrapper.entity_type,
                    evaluated = rules.len(),
                    duration_ms = duration.as_millis() as u64,
                    rules = ?rendered,
                    "entity evaluation finished"
                );
            }
            Err(err) => {
                warn!(
                    execution_id = %execution_id,
                    duration_ms = duration.as_millis() as u64,
                    error = %err,
                    "entity evaluation aborted"
                );
            }
        }
        result.map(|rules| EvaluationSummary { rules, duration })
    }

    async fn flush(
        &self,
        wrapper: &EntityInfoWrapper,
        entity: Option<&EntityWithProperties>,
        execution_id: Uuid,
    ) {
        let payload = entity
            .map(EntityInfoWrapper::from_entity)
            .unwrap_or_else(|| wrapper.clone())
            .with_execution_id(execution_id);
        let message = match payload.to_message() {
            Ok(message) => message,
            Err(err) => {
                warn!(execution_id = %execution_id, error = %err, "failed to encode flush message");
                return;
            }
        };
        if let Err(err) = self.publisher.publish(&self.flush_topic, message).await {
            warn!(execution_id = %execution_id, error = %err, "failed to publish flush message");
        }
    }

    async fn evaluate(
        &self,
        wrapper: &EntityInfoWrapper,
        execution_id: Uuid,
        resolved: &mut Option<EntityWithProperties>,
    ) -> Result<Vec<RuleSummary>, ExecutorError> {
        let provider = self
            .providers
            .instantiate_from_id(wrapper.provider_id)
            .await
            .map_err(|source| ExecutorError::Provider {
                provider_id: wrapper.provider_id,
                source,
            })?;
        let entity = self.resolve_entity(wrapper, provider.as_ref()).await?;
        *resolved = Some(entity.clone());

        let mut engines = EngineCache {
            provider,
            provider_id: wrapper.provider_id,
            ingest: match wrapper.entity_type {
                EntityType::Artifact => IngestCache::noop(),
                _ => IngestCache::shared(),
            },
            engines: HashMap::new(),
        };

        let projects = self.store.get_parent_projects(wrapper.project_id).await?;
        let mut summaries = Vec::new();
        for (depth, project_id) in projects.iter().enumerate() {
            let hierarchy = &projects[depth..];
            for profile in self.store.list_profiles_by_project_id(*project_id).await? {
                self.evaluate_profile(
                    &profile,
                    hierarchy,
                    &entity,
                    execution_id,
                    &mut engines,
                    &mut summaries,
                )
                .await?;
            }
        }
        Ok(summaries)
    }

    /// Loads the stored entity with the event's properties layered on top, creating it
    /// when the event is the first sighting.
    async fn resolve_entity(
        &self,
        wrapper: &EntityInfoWrapper,
        provider: &dyn Provider,
    ) -> Result<EntityWithProperties, ExecutorError> {
        match self.store.get_entity_by_id(wrapper.entity_id).await {
            Ok(stored) => {
                let properties = stored.properties.merge(&wrapper.properties);
                Ok(EntityWithProperties::new(stored.entity, properties))
            }
            Err(StoreError::NotFound(_)) => {
                let name = provider
                    .get_entity_name(wrapper.entity_type, &wrapper.properties)
                    .map_err(|source| ExecutorError::Provider {
                        provider_id: wrapper.provider_id,
                        source,
                    })?;
                let entity = EntityWithProperties::new(
                    EntityInstance {
                        id: wrapper.entity_id,
                        entity_type: wrapper.entity_type,
                        name,
                        project_id: wrapper.project_id,
                        provider_id: wrapper.provider_id,
                        originated_from: wrapper.originating_entity_id,
                    },
                    wrapper.properties.clone(),
                );
                let to_store = entity.clone();
                with_transaction(self.store.as_ref(), move |tx| {
                    Box::pin(async move {
                        tx.create_or_ensure_entity_by_id(&to_store.entity).await?;
                        tx.save_properties(to_store.entity.id, &to_store.properties)
                            .await?;
                        Ok::<_, StoreError>(())
                    })
                })
                .await?;
                debug!(entity_id = %entity.id(), name = %entity.entity.name, "registered entity from event");
                Ok(entity)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn evaluate_profile(
        &self,
        profile: &Profile,
        hierarchy: &[Uuid],
        entity: &EntityWithProperties,
        execution_id: Uuid,
        engines: &mut EngineCache,
        summaries: &mut Vec<RuleSummary>,
    ) -> Result<(), ExecutorError> {
        let rules = profile.rules_for(entity.entity_type());
        if rules.is_empty() {
            return Ok(());
        }
        let Some(profile_id) = profile.id else {
            warn!(profile = %profile.name, "skipping profile without id");
            return Ok(());
        };
        if !selected(profile, entity) {
            return Ok(());
        }

        // Once a rule type cannot be resolved or built, the rest of the profile is
        // recorded as errors instead of evaluated.
        let mut aborted = None;
        for rule in rules {
            let summary = self
                .evaluate_rule(
                    profile,
                    profile_id,
                    rule,
                    hierarchy,
                    entity,
                    execution_id,
                    engines,
                    &mut aborted,
                )
                .await?;
            summaries.push(summary);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(profile = %profile.name, rule_type = %rule.rule_type))]
    async fn evaluate_rule(
        &self,
        profile: &Profile,
        profile_id: Uuid,
        rule: &RuleInvocation,
        hierarchy: &[Uuid],
        entity: &EntityWithProperties,
        execution_id: Uuid,
        engines: &mut EngineCache,
        aborted: &mut Option<String>,
    ) -> Result<RuleSummary, ExecutorError> {
        let rule_type = match self
            .store
            .get_rule_type_by_name(hierarchy, &rule.rule_type)
            .await
        {
            Ok(rule_type) => rule_type.id.map(|id| (id, rule_type)).ok_or_else(|| {
                format!("stored rule type {} has no id", rule.rule_type)
            }),
            Err(StoreError::NotFound(_)) => Err(format!("rule type {} not found", rule.rule_type)),
            Err(err) => return Err(err.into()),
        };
        let (rule_type_id, rule_type) = match rule_type {
            Ok(found) => found,
            Err(reason) => {
                // Evaluation rows reference a stored rule type, so only telemetry sees this.
                warn!(reason = %reason, "aborting profile");
                let (eval, actions) = failed(reason.clone());
                aborted.get_or_insert(reason);
                return Ok(RuleSummary::new(
                    profile,
                    rule.rule_type.clone(),
                    rule.display_name().to_string(),
                    &eval,
                    &actions,
                ));
            }
        };
        let rule_type_name = rule_type.name.clone();
        let key = RuleEvaluationKey {
            profile_id,
            rule_type_id,
            entity_id: entity.id(),
            entity_type: entity.entity_type(),
            rule_name: rule.display_name().to_string(),
        };

        let (eval, actions) = match aborted.clone() {
            Some(reason) => failed(format!("profile evaluation aborted: {reason}")),
            None => match engines.get_or_build(rule_type, rule_type_id, &self.registry) {
                Ok(engine) => {
                    let params = rule.params.clone().unwrap_or(Value::Null);
                    let eval = engine.eval(entity, &rule.def, &params).await;
                    let previous = self
                        .store
                        .get_rule_evaluation(&key)
                        .await?
                        .map(|record| record.previous())
                        .unwrap_or_default();
                    let ctx = ActionContext {
                        entity,
                        def: &rule.def,
                        params: &params,
                        eval: &eval,
                        previous: &previous,
                    };
                    let actions = engine
                        .actions(
                            profile.remediate_state(engine.rule_type()),
                            profile.alert_state(engine.rule_type()),
                            &ctx,
                        )
                        .await;
                    (eval, actions)
                }
                Err(reason) => {
                    warn!(error = %reason, "failed to build rule type engine, aborting profile");
                    let reason = format!("failed to build rule type engine: {reason}");
                    let outcome = failed(reason.clone());
                    *aborted = Some(reason);
                    outcome
                }
            },
        };

        self.leases.refresh(entity.id(), execution_id).await;
        self.status.record(&key, &eval, &actions).await?;

        Ok(RuleSummary::new(
            profile,
            rule_type_name,
            key.rule_name,
            &eval,
            &actions,
        ))
    }
}

fn failed(reason: String) -> (EvalOutcome, ActionsOutcome) {
    (
        EvalOutcome::error(reason),
        ActionsOutcome::skipped("rule evaluation aborted"),
    )
}

fn selected(profile: &Profile, entity: &EntityWithProperties) -> bool {
    let selection = match Selection::compile(&profile.selection) {
        Ok(selection) => selection,
        Err(err) => {
            warn!(profile = %profile.name, error = %err, "invalid profile selector, skipping profile");
            return false;
        }
    };
    match selection.select(entity) {
        Ok(Selected::Yes) => true,
        Ok(Selected::No {
            selector,
            description,
        }) => {
            debug!(profile = %profile.name, selector = %selector, description = %description, "entity not selected");
            false
        }
        Err(err) => {
            warn!(profile = %profile.name, error = %err, "selector evaluation failed, skipping profile");
            false
        }
    }
}
