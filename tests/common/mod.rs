//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;
use vigil::engine::{MemoryStore, Project, ProviderManager, ProviderRecord, StaticProviderManager};
use vigil::protocol::{
    EntityInfoWrapper, EntityInstance, EntityType, EntityWithProperties, Message, Properties,
    PropertyValue,
};
use vigil::rules::{
    ActionState, Context, EngineRegistry, EvalSpec, IngestError, IngestResult, IngestSpec,
    Ingester, Profile, Provider, ProviderError, RestClient, RestRequest, RestResponse,
    RuleInvocation, RuleType, RuleTypeDef,
};

mock! {
    pub Providers {}

    #[async_trait]
    impl ProviderManager for Providers {
        async fn instantiate_from_id(
            &self,
            provider_id: Uuid,
        ) -> Result<Arc<dyn Provider>, ProviderError>;
    }
}

/// REST capability that records every request and answers with a canned response.
pub struct RecordingRest {
    pub requests: Mutex<Vec<RestRequest>>,
    response: RestResponse,
}

#[async_trait]
impl RestClient for RecordingRest {
    async fn request(&self, request: RestRequest) -> Result<RestResponse, ProviderError> {
        self.requests.lock().push(request);
        Ok(self.response.clone())
    }
}

/// GitHub-like provider: entities are named `owner/name` and upstream lookups echo
/// the requested properties back with a visibility flag.
pub struct FakeProvider {
    pub rest: RecordingRest,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::with_response(201, json!({"id": 42}))
    }
}

impl FakeProvider {
    pub fn with_response(status: u16, body: Value) -> Self {
        Self {
            rest: RecordingRest {
                requests: Mutex::new(Vec::new()),
                response: RestResponse {
                    status,
                    body: body.to_string().into_bytes(),
                },
            },
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn get_entity_name(
        &self,
        _entity_type: EntityType,
        properties: &Properties,
    ) -> Result<String, ProviderError> {
        match (properties.get("owner"), properties.get("name")) {
            (Some(_), Some(_)) => Ok(format!(
                "{}/{}",
                properties.get_string("owner"),
                properties.get_string("name")
            )),
            _ => Err(ProviderError::MissingProperty("owner/name".into())),
        }
    }

    fn properties_to_wire(
        &self,
        entity_type: EntityType,
        properties: &Properties,
    ) -> Result<Value, ProviderError> {
        Ok(json!({
            "kind": entity_type.as_str(),
            "full_name": self.get_entity_name(entity_type, properties)?,
        }))
    }

    async fn retrieve_all_properties(
        &self,
        _project_id: Uuid,
        _provider_id: Uuid,
        lookup: &Properties,
        _entity_type: EntityType,
    ) -> Result<Properties, ProviderError> {
        let extra = Properties::new([("is_private", false)])
            .map_err(|err| ProviderError::Upstream(err.to_string()))?;
        Ok(lookup.merge(&extra))
    }

    fn as_rest(&self) -> Option<&dyn RestClient> {
        Some(&self.rest)
    }
}

/// Ingester for tests: returns `{"enabled": true}` and counts its calls. Entities
/// whose name starts with `slow` never finish ingesting.
struct GatedIngester {
    spec: IngestSpec,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Ingester for GatedIngester {
    fn kind(&self) -> &str {
        "gated"
    }

    fn config(&self) -> &IngestSpec {
        &self.spec
    }

    async fn ingest(
        &self,
        entity: &EntityWithProperties,
        _params: &Value,
    ) -> Result<IngestResult, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if entity.entity.name.starts_with("slow") {
            std::future::pending::<()>().await;
        }
        Ok(IngestResult::object(json!({"enabled": true})))
    }
}

/// Default registry plus the `gated` ingester, whose calls land in `calls`.
pub fn gated_registry(calls: Arc<AtomicUsize>) -> EngineRegistry {
    let mut registry = EngineRegistry::default();
    registry.ingesters.register("gated", move |spec, _| {
        Ok(Arc::new(GatedIngester {
            spec: spec.clone(),
            calls: calls.clone(),
        }))
    });
    registry
}

fn rule_type(name: &str, project_id: Uuid, ingest: IngestSpec, eval: EvalSpec) -> RuleType {
    let mut rule_type = RuleType::new(
        name,
        RuleTypeDef {
            in_entity: EntityType::Repository,
            rule_schema: json!({"type": "object"}),
            param_schema: None,
            ingest,
            eval,
            remediate: None,
            alert: None,
        },
    );
    rule_type.context = Some(Context::for_project(project_id));
    rule_type
}

/// Builtin ingestion judged by a policy that always allows.
pub fn passthrough_rule_type(project_id: Uuid) -> RuleType {
    rule_type(
        "passthrough",
        project_id,
        IngestSpec::new("builtin"),
        EvalSpec::new("deny-by-default").with("policy", json!("default allow = true")),
    )
}

/// Builtin ingestion judged by a policy that never allows.
pub fn denying_rule_type(name: &str, project_id: Uuid) -> RuleType {
    rule_type(
        name,
        project_id,
        IngestSpec::new("builtin"),
        EvalSpec::new("deny-by-default").with("policy", json!("default allow = false")),
    )
}

/// Rule type fed by the `gated` ingester, passing when the rule asks for what was ingested.
pub fn gated_rule_type(name: &str, project_id: Uuid) -> RuleType {
    rule_type(
        name,
        project_id,
        IngestSpec::new("gated"),
        EvalSpec::new("jq").with(
            "jq",
            json!([{"ingested": {"def": ".enabled"}, "profile": {"def": ".enabled"}}]),
        ),
    )
}

pub fn profile(
    name: &str,
    project_id: Uuid,
    rules: Vec<RuleInvocation>,
    remediate: ActionState,
    alert: ActionState,
) -> Profile {
    let mut profile = Profile::new(name);
    profile.context = Some(Context::for_project(project_id));
    profile.remediate = Some(remediate);
    profile.alert = Some(alert);
    for rule in rules {
        profile = profile.with_rule(EntityType::Repository, rule);
    }
    profile
}

/// A project with one registered provider on top of an in-memory store.
pub struct World {
    pub store: MemoryStore,
    pub provider: Arc<FakeProvider>,
    pub project_id: Uuid,
    pub provider_id: Uuid,
}

impl World {
    pub fn new() -> Self {
        Self::with_provider(FakeProvider::default())
    }

    pub fn with_provider(provider: FakeProvider) -> Self {
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
            name: "github".into(),
            class: "github".into(),
            project_id,
        });
        Self {
            store,
            provider: Arc::new(provider),
            project_id,
            provider_id,
        }
    }

    pub fn providers(&self) -> StaticProviderManager {
        let providers = StaticProviderManager::new();
        providers.register(self.provider_id, self.provider.clone());
        providers
    }

    /// Stores a repository `owner/name` with upstream id 123.
    pub fn repository(&self, owner: &str, name: &str) -> EntityWithProperties {
        let entity = EntityWithProperties::new(
            EntityInstance {
                id: Uuid::new_v4(),
                entity_type: EntityType::Repository,
                name: format!("{owner}/{name}"),
                project_id: self.project_id,
                provider_id: self.provider_id,
                originated_from: None,
            },
            Properties::new([
                ("owner", PropertyValue::from(owner)),
                ("name", PropertyValue::from(name)),
                ("repo_id", PropertyValue::Int64(123)),
            ])
            .unwrap(),
        );
        self.store.insert_entity(entity.clone());
        entity
    }
}

pub fn evaluate_message(entity: &EntityWithProperties) -> Message {
    EntityInfoWrapper::from_entity(entity)
        .with_execution_id(Uuid::new_v4())
        .to_message()
        .unwrap()
}

/// Polls `condition` every few milliseconds until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
