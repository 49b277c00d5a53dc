use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;
use vigil_rules::{Provider, ProviderError};

/// Builds provider clients from stored provider records.
#[async_trait]
pub trait ProviderManager: Send + Sync {
    async fn instantiate_from_id(&self, provider_id: Uuid)
        -> Result<Arc<dyn Provider>, ProviderError>;
}

/// Provider manager over a fixed set of ready-made clients.
#[derive(Default, Clone)]
pub struct StaticProviderManager {
    providers: Arc<RwLock<HashMap<Uuid, Arc<dyn Provider>>>>,
}

impl StaticProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider_id: Uuid, provider: Arc<dyn Provider>) {
        self.providers.write().insert(provider_id, provider);
    }
}

#[async_trait]
impl ProviderManager for StaticProviderManager {
    async fn instantiate_from_id(
        &self,
        provider_id: Uuid,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .read()
            .get(&provider_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("provider {provider_id}")))
    }
}
