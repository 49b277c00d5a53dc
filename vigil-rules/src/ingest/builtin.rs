use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use vigil_protocol::EntityWithProperties;

use super::{IngestResult, Ingester};
use crate::error::{IngestError, ProviderError};
use crate::provider::Provider;
use crate::rule_type::IngestSpec;

/// Generic entity pull: exposes the entity document, its properties and the provider's
/// wire form of the entity.
pub struct BuiltinIngester {
    spec: IngestSpec,
    provider: Arc<dyn Provider>,
}

impl BuiltinIngester {
    pub fn new(spec: IngestSpec, provider: Arc<dyn Provider>) -> Self {
        Self { spec, provider }
    }
}

#[async_trait]
impl Ingester for BuiltinIngester {
    fn kind(&self) -> &str {
        &self.spec.kind
    }

    fn config(&self) -> &IngestSpec {
        &self.spec
    }

    async fn ingest(
        &self,
        entity: &EntityWithProperties,
        _params: &Value,
    ) -> Result<IngestResult, IngestError> {
        let wire = match self
            .provider
            .properties_to_wire(entity.entity_type(), &entity.properties)
        {
            Ok(wire) => wire,
            Err(ProviderError::Unsupported(_)) => Value::Null,
            Err(err) => return Err(err.into()),
        };
        Ok(IngestResult::object(json!({
            "entity": entity.to_document(),
            "properties": entity.properties.to_plain_json(),
            "wire": wire,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::{repository, FakeProvider};

    #[tokio::test]
    async fn exposes_entity_and_wire_form() {
        let ingester = BuiltinIngester::new(IngestSpec::new("builtin"), Arc::new(FakeProvider::default()));
        let result = ingester.ingest(&repository(), &Value::Null).await.unwrap();
        assert_eq!(result.object["entity"]["name"], "foo/test");
        assert_eq!(result.object["properties"]["repo_id"], 123);
        assert_eq!(result.object["wire"]["kind"], "repository");
        assert!(result.checkpoint.is_some());
    }
}
