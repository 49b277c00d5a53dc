use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entity::{EntityType, EntityWithProperties};
use crate::properties::Properties;

/// Metadata key carrying the execution id of an entity evaluation.
pub const EXECUTION_ID_KEY: &str = "execution_id";

pub const TOPIC_ENTITY_EVALUATE: &str = "entity-evaluate";
pub const TOPIC_ENTITY_FLUSH: &str = "entity-flush";
pub const TOPIC_REFRESH_AND_EVALUATE: &str = "entity-refresh-and-evaluate";
pub const TOPIC_ADD_ORIGINATING: &str = "entity-add-originating";
pub const TOPIC_DELETE_ORIGINATING: &str = "entity-delete-originating";

/// Errors raised while encoding or decoding bus payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("failed to decode payload: {0}")]
    Decode(String),
    #[error("message metadata has no valid execution_id")]
    MissingExecutionId,
}

/// Message exchanged over the bus. The payload is opaque JSON bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub uuid: Uuid,
    pub metadata: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            metadata: HashMap::new(),
            payload,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Execution id stored in the metadata, if present and well formed.
    pub fn execution_id(&self) -> Option<Uuid> {
        self.metadata
            .get(EXECUTION_ID_KEY)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// Payload of an entity-evaluate (and entity-flush) message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityInfoWrapper {
    pub project_id: Uuid,
    pub provider_id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    #[serde(
        rename = "originated_from",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub originating_entity_id: Option<Uuid>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
}

impl EntityInfoWrapper {
    pub fn from_entity(entity: &EntityWithProperties) -> Self {
        Self {
            project_id: entity.entity.project_id,
            provider_id: entity.entity.provider_id,
            entity_id: entity.entity.id,
            entity_type: entity.entity.entity_type,
            originating_entity_id: entity.entity.originated_from,
            properties: entity.properties.clone(),
            execution_id: None,
        }
    }

    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    /// Encodes the wrapper, mirroring the execution id into the metadata.
    pub fn to_message(&self) -> Result<Message, ProtocolError> {
        let payload =
            serde_json::to_vec(self).map_err(|err| ProtocolError::Encode(err.to_string()))?;
        let mut message = Message::new(payload);
        if let Some(execution_id) = self.execution_id {
            message = message.with_metadata(EXECUTION_ID_KEY, execution_id.to_string());
        }
        Ok(message)
    }

    /// Decodes the wrapper. A metadata execution id takes precedence over the payload's.
    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let mut wrapper: EntityInfoWrapper = serde_json::from_slice(&message.payload)
            .map_err(|err| ProtocolError::Decode(err.to_string()))?;
        if let Some(execution_id) = message.execution_id() {
            wrapper.execution_id = Some(execution_id);
        }
        Ok(wrapper)
    }
}

/// Payload asking the engine to locate or mutate an entity before evaluating it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRefreshRequest {
    pub entity_type: EntityType,
    pub project_id: Uuid,
    pub provider_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_properties: Option<Properties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originating_entity_id: Option<Uuid>,
}

impl EntityRefreshRequest {
    pub fn to_message(&self) -> Result<Message, ProtocolError> {
        serde_json::to_vec(self)
            .map(Message::new)
            .map_err(|err| ProtocolError::Encode(err.to_string()))
    }

    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        serde_json::from_slice(&message.payload)
            .map_err(|err| ProtocolError::Decode(err.to_string()))
    }
}
