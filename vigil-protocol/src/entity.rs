use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::properties::Properties;

/// Kind of upstream object the engine evaluates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Repository,
    Artifact,
    PullRequest,
    BuildEnvironment,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Repository,
        EntityType::Artifact,
        EntityType::PullRequest,
        EntityType::BuildEnvironment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Repository => "repository",
            EntityType::Artifact => "artifact",
            EntityType::PullRequest => "pull_request",
            EntityType::BuildEnvironment => "build_environment",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "repository" => Ok(EntityType::Repository),
            "artifact" => Ok(EntityType::Artifact),
            "pull_request" => Ok(EntityType::PullRequest),
            "build_environment" => Ok(EntityType::BuildEnvironment),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// A tracked upstream object. Related entities reference each other by id only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityInstance {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub name: String,
    pub project_id: Uuid,
    pub provider_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originated_from: Option<Uuid>,
}

/// An entity together with the property bag last fetched for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityWithProperties {
    pub entity: EntityInstance,
    #[serde(default)]
    pub properties: Properties,
}

impl EntityWithProperties {
    pub fn new(entity: EntityInstance, properties: Properties) -> Self {
        Self { entity, properties }
    }

    pub fn id(&self) -> Uuid {
        self.entity.id
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity.entity_type
    }

    /// JSON document describing the entity, as exposed to selectors and evaluators.
    pub fn to_document(&self) -> Value {
        json!({
            "id": self.entity.id.to_string(),
            "type": self.entity.entity_type.as_str(),
            "name": self.entity.name,
            "project_id": self.entity.project_id.to_string(),
            "provider_id": self.entity.provider_id.to_string(),
            "originated_from": self.entity.originated_from.map(|id| id.to_string()),
            "properties": self.properties.to_plain_json(),
        })
    }
}
