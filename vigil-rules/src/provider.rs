//! Upstream provider capabilities consumed by ingesters, actions and refresh strategies.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;
use vigil_protocol::{EntityType, Properties};

use crate::error::ProviderError;

/// HTTP request issued through a provider's REST capability.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: String,
    /// Absolute URL or a path the provider resolves against its API base.
    pub url: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Working tree produced by a git clone.
#[derive(Clone, Default, PartialEq)]
pub struct ClonedRepo {
    pub commit: String,
    pub branch: String,
    pub files: BTreeMap<String, Vec<u8>>,
}

impl fmt::Debug for ClonedRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClonedRepo")
            .field("commit", &self.commit)
            .field("branch", &self.branch)
            .field("files", &self.files.len())
            .finish()
    }
}

#[async_trait]
pub trait RestClient: Send + Sync {
    async fn request(&self, request: RestRequest) -> Result<RestResponse, ProviderError>;
}

#[async_trait]
pub trait GitClient: Send + Sync {
    async fn clone_repo(&self, url: &str, branch: Option<&str>) -> Result<ClonedRepo, ProviderError>;
}

/// An instantiated upstream provider.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Canonical entity name derived from its properties (e.g. `owner/repo`).
    fn get_entity_name(
        &self,
        entity_type: EntityType,
        properties: &Properties,
    ) -> Result<String, ProviderError>;

    /// Provider-specific wire form of an entity.
    fn properties_to_wire(
        &self,
        entity_type: EntityType,
        properties: &Properties,
    ) -> Result<Value, ProviderError>;

    /// Fetches the full upstream property set for the entity identified by `lookup`.
    async fn retrieve_all_properties(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        lookup: &Properties,
        entity_type: EntityType,
    ) -> Result<Properties, ProviderError>;

    fn as_git(&self) -> Option<&dyn GitClient> {
        None
    }

    fn as_rest(&self) -> Option<&dyn RestClient> {
        None
    }
}
