//! Shared fixtures for the engine's unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;
use vigil_protocol::{EntityInstance, EntityType, EntityWithProperties, Properties};
use vigil_rules::{
    Context, EngineRegistry, EvalSpec, IngestError, IngestResult, IngestSpec, Ingester,
    Profile, Provider, ProviderError, RuleInvocation, RuleType, RuleTypeDef,
};

use crate::bus::ChannelBus;
use crate::config::EngineConfig;
use crate::executor::Executor;
use crate::providers::StaticProviderManager;
use crate::store::{MemoryStore, Project, ProviderRecord};

/// Provider whose entity names come from the `name` property and whose upstream
/// properties are keyed by `upstream_id`.
#[derive(Default)]
pub struct TestProvider {
    pub upstream: Mutex<Vec<Properties>>,
    pub lookups: AtomicUsize,
}

#[async_trait]
impl Provider for TestProvider {
    fn name(&self) -> &str {
        "test"
    }

    fn get_entity_name(
        &self,
        _entity_type: EntityType,
        properties: &Properties,
    ) -> Result<String, ProviderError> {
        properties
            .get("name")
            .map(|_| properties.get_string("name"))
            .ok_or_else(|| ProviderError::MissingProperty("name".into()))
    }

    fn properties_to_wire(
        &self,
        _entity_type: EntityType,
        _properties: &Properties,
    ) -> Result<Value, ProviderError> {
        Err(ProviderError::Unsupported("wire".into()))
    }

    async fn retrieve_all_properties(
        &self,
        _project_id: Uuid,
        _provider_id: Uuid,
        lookup: &Properties,
        _entity_type: EntityType,
    ) -> Result<Properties, ProviderError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let wanted = lookup.get_string("upstream_id");
        self.upstream
            .lock()
            .iter()
            .find(|props| props.get_string("upstream_id") == wanted)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("upstream {wanted}")))
    }
}

struct CountingIngester {
    spec: IngestSpec,
    calls: Arc<AtomicUsize>,
    object: Value,
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
    ) -> Result<IngestResult, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(IngestResult::object(self.object.clone()))
    }
}

struct HangingIngester {
    spec: IngestSpec,
}

#[async_trait]
impl Ingester for HangingIngester {
    fn kind(&self) -> &str {
        "hanging"
    }

    fn config(&self) -> &IngestSpec {
        &self.spec
    }

    async fn ingest(
        &self,
        _entity: &EntityWithProperties,
        _params: &Value,
    ) -> Result<IngestResult, IngestError> {
        futures::future::pending().await
    }
}

/// Registry in which the `counting` ingester never completes.
pub fn hanging_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::default();
    registry.ingesters.register("counting", |spec, _| {
        Ok(Arc::new(HangingIngester { spec: spec.clone() }))
    });
    registry
}

/// Registry whose `counting` ingester returns `object` and counts its calls.
pub fn counting_registry(calls: Arc<AtomicUsize>, object: Value) -> EngineRegistry {
    let mut registry = EngineRegistry::default();
    registry.ingesters.register("counting", move |spec, _| {
        Ok(Arc::new(CountingIngester {
            spec: spec.clone(),
            calls: calls.clone(),
            object: object.clone(),
        }))
    });
    registry
}

/// Rule type comparing the ingested `enabled` flag with the rule definition's.
pub fn enabled_rule_type(name: &str, project_id: Uuid) -> RuleType {
    let mut rule_type = RuleType::new(
        name,
        RuleTypeDef {
            in_entity: EntityType::Repository,
            rule_schema: json!({
                "type": "object",
                "properties": {"enabled": {"type": "boolean"}}
            }),
            param_schema: None,
            ingest: IngestSpec::new("counting"),
            eval: EvalSpec::new("jq").with(
                "jq",
                json!([{"ingested": {"def": ".enabled"}, "profile": {"def": ".enabled"}}]),
            ),
            remediate: None,
            alert: None,
        },
    );
    rule_type.context = Some(Context::for_project(project_id));
    rule_type
}

pub fn profile(name: &str, project_id: Uuid, rules: Vec<RuleInvocation>) -> Profile {
    let mut profile = Profile::new(name);
    profile.context = Some(Context::for_project(project_id));
    for rule in rules {
        profile = profile.with_rule(EntityType::Repository, rule);
    }
    profile
}

pub struct Fixture {
    pub store: MemoryStore,
    pub bus: Arc<ChannelBus>,
    pub provider: Arc<TestProvider>,
    pub providers: StaticProviderManager,
    pub project_id: Uuid,
    pub provider_id: Uuid,
    pub config: EngineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let project_id = Uuid::new_v4();
        let provider_id = Uuid::new_v4();
        store.insert_project(Project {
            id: project_id,
            name: "acme".into(),
            parent_id: None,
        });
        store.insert_provider(ProviderRecord {
            id: provider_id,
            name: "test".into(),
            class: "test".into(),
            project_id,
        });
        let provider = Arc::new(TestProvider::default());
        let providers = StaticProviderManager::new();
        providers.register(provider_id, provider.clone());
        Self {
            store,
            bus: Arc::new(ChannelBus::new()),
            provider,
            providers,
            project_id,
            provider_id,
            config: EngineConfig::default(),
        }
    }

    pub fn repository(&self, name: &str) -> EntityWithProperties {
        self.entity(name, EntityType::Repository)
    }

    pub fn entity(&self, name: &str, entity_type: EntityType) -> EntityWithProperties {
        let entity = EntityWithProperties::new(
            EntityInstance {
                id: Uuid::new_v4(),
                entity_type,
                name: name.into(),
                project_id: self.project_id,
                provider_id: self.provider_id,
                originated_from: None,
            },
            Properties::new([("name", name), ("upstream_id", "1")]).unwrap(),
        );
        self.store.insert_entity(entity.clone());
        entity
    }

    /// Stores `branch_protection` and a profile applying it once to repositories.
    pub fn seed_rule(&self) {
        self.store
            .insert_rule_type(enabled_rule_type("branch_protection", self.project_id));
        self.store.insert_profile(profile(
            "acme",
            self.project_id,
            vec![RuleInvocation::new("branch_protection", json!({"enabled": true}))],
        ));
    }

    pub fn executor(&self, registry: EngineRegistry) -> Executor {
        Executor::new(
            Arc::new(self.store.clone()),
            Arc::new(self.providers.clone()),
            self.bus.clone(),
            &self.config,
        )
        .with_registry(registry)
    }
}
