//! Ingesters fetch the contextual data a rule evaluates.

mod builtin;
mod cache;
mod git;
mod noop;
mod rest;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use vigil_protocol::EntityWithProperties;

use crate::error::{EngineError, IngestError};
use crate::provider::{ClonedRepo, Provider};
use crate::rule_type::IngestSpec;

pub use builtin::BuiltinIngester;
pub use cache::{fingerprint, IngestCache};
pub use git::GitIngester;
pub use noop::NoopIngester;
pub use rest::RestIngester;
pub(crate) use rest::check_endpoint;

pub const BUILTIN: &str = "builtin";
pub const GIT: &str = "git";
pub const NOOP: &str = "noop";
pub const REST: &str = "rest";

/// Marker describing which upstream state an ingest result reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Checkpoint {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            commit: None,
            branch: None,
            url: None,
        }
    }
}

/// Data produced by an ingester.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestResult {
    pub object: Value,
    pub fs: Option<Arc<ClonedRepo>>,
    pub checkpoint: Option<Checkpoint>,
}

impl IngestResult {
    pub fn object(object: Value) -> Self {
        Self {
            object,
            fs: None,
            checkpoint: Some(Checkpoint::now()),
        }
    }
}

#[async_trait]
pub trait Ingester: Send + Sync {
    /// Tag this ingester was registered under.
    fn kind(&self) -> &str;

    fn config(&self) -> &IngestSpec;

    async fn ingest(
        &self,
        entity: &EntityWithProperties,
        params: &Value,
    ) -> Result<IngestResult, IngestError>;
}

pub type IngesterConstructor = Arc<
    dyn Fn(&IngestSpec, Arc<dyn Provider>) -> Result<Arc<dyn Ingester>, EngineError>
        + Send
        + Sync,
>;

/// Tag to constructor table for ingesters.
#[derive(Clone)]
pub struct IngesterRegistry {
    constructors: HashMap<String, IngesterConstructor>,
}

impl fmt::Debug for IngesterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.constructors.keys().collect();
        tags.sort();
        f.debug_struct("IngesterRegistry").field("tags", &tags).finish()
    }
}

impl IngesterRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry holding the `builtin`, `git`, `noop` and `rest` ingesters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(BUILTIN, |spec, provider| {
            Ok(Arc::new(BuiltinIngester::new(spec.clone(), provider)))
        });
        registry.register(GIT, |spec, provider| {
            Ok(Arc::new(GitIngester::new(spec.clone(), provider)?))
        });
        registry.register(NOOP, |spec, _| Ok(Arc::new(NoopIngester::new(spec.clone()))));
        registry.register(REST, |spec, provider| {
            Ok(Arc::new(RestIngester::new(spec.clone(), provider)?))
        });
        registry
    }

    pub fn register<F>(&mut self, tag: impl Into<String>, constructor: F)
    where
        F: Fn(&IngestSpec, Arc<dyn Provider>) -> Result<Arc<dyn Ingester>, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(tag.into(), Arc::new(constructor));
    }

    pub fn build(
        &self,
        spec: &IngestSpec,
        provider: Arc<dyn Provider>,
    ) -> Result<Arc<dyn Ingester>, EngineError> {
        let constructor = self
            .constructors
            .get(&spec.kind)
            .ok_or_else(|| EngineError::UnknownIngester(spec.kind.clone()))?;
        constructor(spec, provider)
    }
}

impl Default for IngesterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Typed configuration block of an ingester, read from the section named after its tag.
pub(crate) fn section_config<T: serde::de::DeserializeOwned + Default>(
    spec: &IngestSpec,
    component: &'static str,
) -> Result<T, EngineError> {
    match spec.section() {
        None | Some(Value::Null) => Ok(T::default()),
        Some(section) => serde_json::from_value(section.clone())
            .map_err(|err| EngineError::config(component, err.to_string())),
    }
}
