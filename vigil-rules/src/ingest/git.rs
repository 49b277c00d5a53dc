use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use vigil_protocol::EntityWithProperties;

use super::{section_config, Checkpoint, IngestResult, Ingester};
use crate::error::{EngineError, IngestError};
use crate::provider::Provider;
use crate::rule_type::IngestSpec;

#[derive(Debug, Clone, Default, Deserialize)]
struct GitConfig {
    #[serde(default)]
    clone_url: Option<String>,
    #[serde(default)]
    branch: Option<String>,
}

/// Clones the entity's repository and exposes its file tree.
pub struct GitIngester {
    spec: IngestSpec,
    config: GitConfig,
    provider: Arc<dyn Provider>,
}

impl GitIngester {
    pub fn new(spec: IngestSpec, provider: Arc<dyn Provider>) -> Result<Self, EngineError> {
        let config: GitConfig = section_config(&spec, "git ingester")?;
        if matches!(config.clone_url.as_deref(), Some(url) if url.trim().is_empty()) {
            return Err(EngineError::config("git ingester", "clone_url cannot be empty"));
        }
        Ok(Self {
            spec,
            config,
            provider,
        })
    }

    fn clone_url(&self, entity: &EntityWithProperties, params: &Value) -> Option<String> {
        self.config
            .clone_url
            .clone()
            .or_else(|| params.get("clone_url").and_then(Value::as_str).map(String::from))
            .or_else(|| Some(entity.properties.get_string("clone_url")).filter(|url| !url.is_empty()))
    }

    fn branch(&self, entity: &EntityWithProperties, params: &Value) -> Option<String> {
        params
            .get("branch")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| self.config.branch.clone())
            .or_else(|| {
                Some(entity.properties.get_string("default_branch")).filter(|branch| !branch.is_empty())
            })
    }
}

#[async_trait]
impl Ingester for GitIngester {
    fn kind(&self) -> &str {
        &self.spec.kind
    }

    fn config(&self) -> &IngestSpec {
        &self.spec
    }

    async fn ingest(
        &self,
        entity: &EntityWithProperties,
        params: &Value,
    ) -> Result<IngestResult, IngestError> {
        let client = self
            .provider
            .as_git()
            .ok_or(IngestError::Unsupported("git"))?;
        let url = self
            .clone_url(entity, params)
            .ok_or_else(|| IngestError::Config("no clone url for entity".into()))?;
        let branch = self.branch(entity, params);

        debug!(url = %url, branch = ?branch, "cloning repository");
        let repo = client.clone_repo(&url, branch.as_deref()).await?;
        let object = json!({
            "clone_url": url,
            "branch": repo.branch,
            "commit": repo.commit,
            "files": repo.files.keys().collect::<Vec<_>>(),
        });
        let checkpoint = Checkpoint {
            commit: Some(repo.commit.clone()),
            branch: Some(repo.branch.clone()),
            ..Checkpoint::now()
        };
        Ok(IngestResult {
            object,
            fs: Some(Arc::new(repo)),
            checkpoint: Some(checkpoint),
        })
    }
}
