use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::Store;

/// Refreshes and releases per-entity leases. Failures are logged, never propagated.
#[derive(Clone)]
pub struct LeaseCoordinator {
    store: Arc<dyn Store>,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns whether the lease is still held by `execution_id`.
    pub async fn refresh(&self, entity_id: Uuid, execution_id: Uuid) -> bool {
        match self.store.update_lease(entity_id, execution_id).await {
            Ok(()) => true,
            Err(StoreError::Conflict(reason)) => {
                warn!(entity_id = %entity_id, execution_id = %execution_id, reason = %reason, "lease conflict, continuing evaluation");
                false
            }
            Err(err) => {
                warn!(entity_id = %entity_id, execution_id = %execution_id, error = %err, "failed to refresh lease");
                false
            }
        }
    }

    pub async fn release(&self, entity_id: Uuid, execution_id: Uuid) -> bool {
        match self.store.release_lock(entity_id, execution_id).await {
            Ok(()) => {
                debug!(entity_id = %entity_id, execution_id = %execution_id, "lease released");
                true
            }
            Err(err) => {
                warn!(entity_id = %entity_id, execution_id = %execution_id, error = %err, "failed to release lease");
                false
            }
        }
    }
}
