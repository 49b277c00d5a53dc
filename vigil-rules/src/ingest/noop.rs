use async_trait::async_trait;
use serde_json::{json, Value};
use vigil_protocol::EntityWithProperties;

use super::{IngestResult, Ingester};
use crate::error::IngestError;
use crate::rule_type::IngestSpec;

/// Ingester for rules that need nothing beyond the entity itself.
#[derive(Debug, Clone)]
pub struct NoopIngester {
    spec: IngestSpec,
}

impl NoopIngester {
    pub fn new(spec: IngestSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Ingester for NoopIngester {
    fn kind(&self) -> &str {
        &self.spec.kind
    }

    fn config(&self) -> &IngestSpec {
        &self.spec
    }

    async fn ingest(
        &self,
        _entity: &EntityWithProperties,
        _params: &Value,
    ) -> Result<IngestResult, IngestError> {
        Ok(IngestResult::object(json!({})))
    }
}
