//! Persistence interface of the evaluation pipeline.
//!
//! Reads go straight through [`Store`]. Writes that must land together go through a
//! [`StoreTx`] obtained from [`Store::begin`]; nothing is visible until `commit`, and
//! dropping an uncommitted transaction discards it.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use vigil_protocol::{EntityInstance, EntityType, EntityWithProperties, Properties, PropertyValue};
use vigil_rules::{
    AlertStatus, EvalStatus, PreviousEvaluation, Profile, RemediationStatus, RuleType,
};

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: Uuid,
    pub name: String,
    /// Implementation class, e.g. `github-app`.
    pub class: String,
    pub project_id: Uuid,
}

/// Identity of one evaluation record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleEvaluationKey {
    pub profile_id: Uuid,
    pub rule_type_id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    /// Invocation name; distinguishes two uses of one rule type in a profile.
    pub rule_name: String,
}

/// Evaluation record together with its three detail rows.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    pub id: Uuid,
    pub key: RuleEvaluationKey,
    pub eval_status: EvalStatus,
    pub eval_details: String,
    pub remediation_status: RemediationStatus,
    pub remediation_details: Value,
    pub remediation_metadata: Value,
    pub alert_status: AlertStatus,
    pub alert_details: Value,
    pub alert_metadata: Value,
    pub last_updated: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn new(id: Uuid, key: RuleEvaluationKey) -> Self {
        Self {
            id,
            key,
            eval_status: EvalStatus::Pending,
            eval_details: String::new(),
            remediation_status: RemediationStatus::Pending,
            remediation_details: Value::Null,
            remediation_metadata: Value::Null,
            alert_status: AlertStatus::Off,
            alert_details: Value::Null,
            alert_metadata: Value::Null,
            last_updated: Utc::now(),
        }
    }

    /// Statuses the action engine compares the new outcome against.
    pub fn previous(&self) -> PreviousEvaluation {
        PreviousEvaluation {
            eval_status: Some(self.eval_status),
            remediation_status: Some(self.remediation_status),
            alert_status: Some(self.alert_status),
            remediation_metadata: self.remediation_metadata.clone(),
            alert_metadata: self.alert_metadata.clone(),
        }
    }
}

/// Marker pinning an entity to the execution currently evaluating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub entity_id: Uuid,
    pub locked_by: Uuid,
    pub locked_at: DateTime<Utc>,
}

/// Read side of the store plus leasing.
#[async_trait]
pub trait Store: Send + Sync {
    /// The project and its ancestors, leaf first.
    async fn get_parent_projects(&self, project_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    async fn get_project(&self, project_id: Uuid) -> Result<Project, StoreError>;

    /// Profiles defined directly in the project, ordered by name.
    async fn list_profiles_by_project_id(&self, project_id: Uuid)
        -> Result<Vec<Profile>, StoreError>;

    async fn get_profile_by_name(&self, project_id: Uuid, name: &str)
        -> Result<Profile, StoreError>;

    /// First rule type named `name` in `projects`, searched in order.
    async fn get_rule_type_by_name(
        &self,
        projects: &[Uuid],
        name: &str,
    ) -> Result<RuleType, StoreError>;

    async fn list_rule_types(&self, project_id: Uuid) -> Result<Vec<RuleType>, StoreError>;

    async fn get_rule_evaluation(
        &self,
        key: &RuleEvaluationKey,
    ) -> Result<Option<EvaluationRecord>, StoreError>;

    async fn list_rule_evaluations(
        &self,
        entity_id: Uuid,
    ) -> Result<Vec<EvaluationRecord>, StoreError>;

    async fn get_entity_by_id(&self, entity_id: Uuid) -> Result<EntityWithProperties, StoreError>;

    async fn get_entity_by_name(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        name: &str,
    ) -> Result<EntityWithProperties, StoreError>;

    async fn get_entities_by_property(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        key: &str,
        value: &PropertyValue,
    ) -> Result<Vec<EntityWithProperties>, StoreError>;

    async fn get_properties(&self, entity_id: Uuid) -> Result<Properties, StoreError>;

    async fn get_provider_by_id(&self, provider_id: Uuid) -> Result<ProviderRecord, StoreError>;

    /// Refreshes the lease timestamp. `Conflict` when the lease is absent or held by
    /// another execution.
    async fn update_lease(&self, entity_id: Uuid, execution_id: Uuid) -> Result<(), StoreError>;

    /// Clears the lease if `execution_id` holds it. `Conflict` when another execution does.
    async fn release_lock(&self, entity_id: Uuid, execution_id: Uuid) -> Result<(), StoreError>;

    /// Takes the lease unless another execution refreshed it within `threshold`.
    async fn lock_if_threshold_not_exceeded(
        &self,
        entity_id: Uuid,
        execution_id: Uuid,
        threshold: Duration,
    ) -> Result<Lease, StoreError>;

    async fn get_lease(&self, entity_id: Uuid) -> Result<Option<Lease>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// Transactional writes.
#[async_trait]
pub trait StoreTx: Send {
    /// Inserts or touches the evaluation record and returns its id.
    async fn upsert_rule_evaluation(&mut self, key: &RuleEvaluationKey)
        -> Result<Uuid, StoreError>;

    async fn upsert_eval_detail(
        &mut self,
        rule_eval_id: Uuid,
        status: EvalStatus,
        details: &str,
    ) -> Result<(), StoreError>;

    async fn upsert_remediation_detail(
        &mut self,
        rule_eval_id: Uuid,
        status: RemediationStatus,
        details: &Value,
        metadata: &Value,
    ) -> Result<(), StoreError>;

    async fn upsert_alert_detail(
        &mut self,
        rule_eval_id: Uuid,
        status: AlertStatus,
        details: &Value,
        metadata: &Value,
    ) -> Result<(), StoreError>;

    /// Creates the entity row, or returns the stored one when the id already exists.
    async fn create_or_ensure_entity_by_id(
        &mut self,
        entity: &EntityInstance,
    ) -> Result<EntityInstance, StoreError>;

    /// Creates the entity, or returns the stored one with the same project, provider,
    /// type and name. Callers keep the returned id.
    async fn upsert_entity_by_name(
        &mut self,
        entity: &EntityInstance,
    ) -> Result<EntityInstance, StoreError>;

    async fn get_entity_by_id(&mut self, entity_id: Uuid)
        -> Result<EntityWithProperties, StoreError>;

    async fn get_entity_by_name(
        &mut self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        name: &str,
    ) -> Result<EntityWithProperties, StoreError>;

    /// Replaces the entity's whole property bag.
    async fn save_properties(
        &mut self,
        entity_id: Uuid,
        properties: &Properties,
    ) -> Result<(), StoreError>;

    /// Deletes the entity, its properties, evaluations and lease.
    async fn delete_entity(&mut self, entity_id: Uuid) -> Result<(), StoreError>;

    async fn create_rule_type(&mut self, rule_type: &RuleType) -> Result<RuleType, StoreError>;

    async fn update_rule_type(&mut self, rule_type: &RuleType) -> Result<RuleType, StoreError>;

    async fn create_profile(&mut self, profile: &Profile) -> Result<Profile, StoreError>;

    async fn update_profile(&mut self, profile: &Profile) -> Result<Profile, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Runs `f` inside a transaction, committing only when it succeeds.
pub async fn with_transaction<T, E, F>(store: &dyn Store, f: F) -> Result<T, E>
where
    E: From<StoreError>,
    F: for<'a> FnOnce(&'a mut dyn StoreTx) -> BoxFuture<'a, Result<T, E>>,
{
    let mut tx = store.begin().await?;
    let value = f(tx.as_mut()).await?;
    tx.commit().await?;
    Ok(value)
}

fn not_found(what: &str, id: impl std::fmt::Display) -> StoreError {
    StoreError::NotFound(format!("{what} {id}"))
}
