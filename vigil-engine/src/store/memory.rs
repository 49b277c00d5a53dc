use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;
use vigil_protocol::{EntityInstance, EntityType, EntityWithProperties, Properties, PropertyValue};
use vigil_rules::{AlertStatus, EvalStatus, Profile, RemediationStatus, RuleType};

use super::{
    not_found, EvaluationRecord, Lease, Project, ProviderRecord, RuleEvaluationKey, Store,
    StoreTx,
};
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
struct State {
    projects: HashMap<Uuid, Project>,
    providers: HashMap<Uuid, ProviderRecord>,
    entities: HashMap<Uuid, EntityInstance>,
    properties: HashMap<Uuid, Properties>,
    rule_types: HashMap<Uuid, RuleType>,
    profiles: HashMap<Uuid, Profile>,
    evaluations: HashMap<RuleEvaluationKey, EvaluationRecord>,
    leases: HashMap<Uuid, Lease>,
}

impl State {
    fn entity_by_name(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        name: &str,
    ) -> Result<EntityWithProperties, StoreError> {
        let id = self
            .entities
            .values()
            .find(|entity| {
                entity.project_id == project_id
                    && entity.provider_id == provider_id
                    && entity.entity_type == entity_type
                    && entity.name == name
            })
            .map(|entity| entity.id)
            .ok_or_else(|| not_found(entity_type.as_str(), name))?;
        self.entity(id)
    }

    fn entity(&self, entity_id: Uuid) -> Result<EntityWithProperties, StoreError> {
        let entity = self
            .entities
            .get(&entity_id)
            .ok_or_else(|| not_found("entity", entity_id))?;
        Ok(EntityWithProperties::new(
            entity.clone(),
            self.properties.get(&entity_id).cloned().unwrap_or_default(),
        ))
    }

    fn evaluation_mut(&mut self, id: Uuid) -> Result<&mut EvaluationRecord, StoreError> {
        self.evaluations
            .values_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| not_found("rule evaluation", id))
    }

    fn rule_type_named(&self, project_id: Option<Uuid>, name: &str) -> Option<&RuleType> {
        self.rule_types
            .values()
            .find(|rule_type| rule_type.project_id() == project_id && rule_type.name == name)
    }

    fn profile_named(&self, project_id: Option<Uuid>, name: &str) -> Option<&Profile> {
        self.profiles
            .values()
            .find(|profile| profile.project_id() == project_id && profile.name == name)
    }

    fn delete_entity(&mut self, entity_id: Uuid) {
        let mut pending = vec![entity_id];
        while let Some(id) = pending.pop() {
            if self.entities.remove(&id).is_none() {
                continue;
            }
            self.properties.remove(&id);
            self.leases.remove(&id);
            self.evaluations.retain(|key, _| key.entity_id != id);
            pending.extend(
                self.entities
                    .values()
                    .filter(|child| child.originated_from == Some(id))
                    .map(|child| child.id),
            );
        }
    }

    fn apply(&mut self, op: Op, remap: &mut HashMap<Uuid, Uuid>) -> Result<(), StoreError> {
        let resolve = |remap: &HashMap<Uuid, Uuid>, id: Uuid| remap.get(&id).copied().unwrap_or(id);
        match op {
            Op::UpsertEvaluation { id, key } => {
                if !self.entities.contains_key(&key.entity_id) {
                    return Err(not_found("entity", key.entity_id));
                }
                match self.evaluations.get_mut(&key) {
                    Some(existing) => {
                        existing.last_updated = Utc::now();
                        remap.insert(id, existing.id);
                    }
                    None => {
                        self.evaluations
                            .insert(key.clone(), EvaluationRecord::new(id, key));
                    }
                }
            }
            Op::EvalDetail {
                id,
                status,
                details,
            } => {
                let record = self.evaluation_mut(resolve(remap, id))?;
                record.eval_status = status;
                record.eval_details = details;
                record.last_updated = Utc::now();
            }
            Op::RemediationDetail {
                id,
                status,
                details,
                metadata,
            } => {
                let record = self.evaluation_mut(resolve(remap, id))?;
                record.remediation_status = status;
                record.remediation_details = details;
                record.remediation_metadata = metadata;
            }
            Op::AlertDetail {
                id,
                status,
                details,
                metadata,
            } => {
                let record = self.evaluation_mut(resolve(remap, id))?;
                record.alert_status = status;
                record.alert_details = details;
                record.alert_metadata = metadata;
            }
            Op::EnsureEntity(entity) => {
                if self.entities.contains_key(&entity.id) {
                    return Ok(());
                }
                let duplicate = self.entities.values().any(|existing| {
                    existing.project_id == entity.project_id
                        && existing.provider_id == entity.provider_id
                        && existing.entity_type == entity.entity_type
                        && existing.name == entity.name
                });
                if duplicate {
                    return Err(StoreError::AlreadyExists(format!(
                        "{} {}",
                        entity.entity_type, entity.name
                    )));
                }
                if let Some(parent) = entity.originated_from {
                    if !self.entities.contains_key(&parent) {
                        return Err(not_found("originating entity", parent));
                    }
                }
                self.entities.insert(entity.id, entity);
            }
            Op::SaveProperties(entity_id, properties) => {
                if !self.entities.contains_key(&entity_id) {
                    return Err(not_found("entity", entity_id));
                }
                self.properties.insert(entity_id, properties);
            }
            Op::DeleteEntity(entity_id) => {
                if !self.entities.contains_key(&entity_id) {
                    return Err(not_found("entity", entity_id));
                }
                self.delete_entity(entity_id);
            }
            Op::CreateRuleType(id, rule_type) => {
                if self
                    .rule_type_named(rule_type.project_id(), &rule_type.name)
                    .is_some()
                {
                    return Err(StoreError::AlreadyExists(format!(
                        "rule type {}",
                        rule_type.name
                    )));
                }
                self.rule_types.insert(id, rule_type);
            }
            Op::UpdateRuleType(id, rule_type) => {
                let slot = self
                    .rule_types
                    .get_mut(&id)
                    .ok_or_else(|| not_found("rule type", id))?;
                *slot = rule_type;
            }
            Op::CreateProfile(id, profile) => {
                if self
                    .profile_named(profile.project_id(), &profile.name)
                    .is_some()
                {
                    return Err(StoreError::AlreadyExists(format!("profile {}", profile.name)));
                }
                self.profiles.insert(id, profile);
            }
            Op::UpdateProfile(id, profile) => {
                let slot = self
                    .profiles
                    .get_mut(&id)
                    .ok_or_else(|| not_found("profile", id))?;
                *slot = profile;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Op {
    UpsertEvaluation {
        id: Uuid,
        key: RuleEvaluationKey,
    },
    EvalDetail {
        id: Uuid,
        status: EvalStatus,
        details: String,
    },
    RemediationDetail {
        id: Uuid,
        status: RemediationStatus,
        details: Value,
        metadata: Value,
    },
    AlertDetail {
        id: Uuid,
        status: AlertStatus,
        details: Value,
        metadata: Value,
    },
    EnsureEntity(EntityInstance),
    SaveProperties(Uuid, Properties),
    DeleteEntity(Uuid),
    CreateRuleType(Uuid, RuleType),
    UpdateRuleType(Uuid, RuleType),
    CreateProfile(Uuid, Profile),
    UpdateProfile(Uuid, Profile),
}

/// Arena-style store keyed by UUID. Used by tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project: Project) {
        self.state.write().projects.insert(project.id, project);
    }

    pub fn insert_provider(&self, provider: ProviderRecord) {
        self.state.write().providers.insert(provider.id, provider);
    }

    pub fn insert_entity(&self, entity: EntityWithProperties) {
        let mut state = self.state.write();
        state
            .properties
            .insert(entity.entity.id, entity.properties);
        state.entities.insert(entity.entity.id, entity.entity);
    }

    /// Stores a rule type, assigning an id when it has none.
    pub fn insert_rule_type(&self, mut rule_type: RuleType) -> RuleType {
        let id = *rule_type.id.get_or_insert_with(Uuid::new_v4);
        self.state.write().rule_types.insert(id, rule_type.clone());
        rule_type
    }

    /// Stores a profile, assigning an id when it has none.
    pub fn insert_profile(&self, mut profile: Profile) -> Profile {
        let id = *profile.id.get_or_insert_with(Uuid::new_v4);
        self.state.write().profiles.insert(id, profile.clone());
        profile
    }

    pub fn insert_lease(&self, lease: Lease) {
        self.state.write().leases.insert(lease.entity_id, lease);
    }

    /// Every evaluation record, in no particular order.
    pub fn evaluations(&self) -> Vec<EvaluationRecord> {
        self.state.read().evaluations.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_parent_projects(&self, project_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.read();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(project_id);
        while let Some(id) = current {
            if !seen.insert(id) {
                break;
            }
            let project = state
                .projects
                .get(&id)
                .ok_or_else(|| not_found("project", id))?;
            chain.push(id);
            current = project.parent_id;
        }
        Ok(chain)
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Project, StoreError> {
        self.state
            .read()
            .projects
            .get(&project_id)
            .cloned()
            .ok_or_else(|| not_found("project", project_id))
    }

    async fn list_profiles_by_project_id(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<Profile>, StoreError> {
        let mut profiles: Vec<Profile> = self
            .state
            .read()
            .profiles
            .values()
            .filter(|profile| profile.project_id() == Some(project_id))
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    async fn get_profile_by_name(
        &self,
        project_id: Uuid,
        name: &str,
    ) -> Result<Profile, StoreError> {
        self.state
            .read()
            .profile_named(Some(project_id), name)
            .cloned()
            .ok_or_else(|| not_found("profile", name))
    }

    async fn get_rule_type_by_name(
        &self,
        projects: &[Uuid],
        name: &str,
    ) -> Result<RuleType, StoreError> {
        let state = self.state.read();
        projects
            .iter()
            .find_map(|project| state.rule_type_named(Some(*project), name))
            .cloned()
            .ok_or_else(|| not_found("rule type", name))
    }

    async fn list_rule_types(&self, project_id: Uuid) -> Result<Vec<RuleType>, StoreError> {
        let mut rule_types: Vec<RuleType> = self
            .state
            .read()
            .rule_types
            .values()
            .filter(|rule_type| rule_type.project_id() == Some(project_id))
            .cloned()
            .collect();
        rule_types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rule_types)
    }

    async fn get_rule_evaluation(
        &self,
        key: &RuleEvaluationKey,
    ) -> Result<Option<EvaluationRecord>, StoreError> {
        Ok(self.state.read().evaluations.get(key).cloned())
    }

    async fn list_rule_evaluations(
        &self,
        entity_id: Uuid,
    ) -> Result<Vec<EvaluationRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .evaluations
            .values()
            .filter(|record| record.key.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn get_entity_by_id(&self, entity_id: Uuid) -> Result<EntityWithProperties, StoreError> {
        self.state.read().entity(entity_id)
    }

    async fn get_entity_by_name(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        name: &str,
    ) -> Result<EntityWithProperties, StoreError> {
        self.state
            .read()
            .entity_by_name(project_id, provider_id, entity_type, name)
    }

    async fn get_entities_by_property(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        key: &str,
        value: &PropertyValue,
    ) -> Result<Vec<EntityWithProperties>, StoreError> {
        let state = self.state.read();
        state
            .entities
            .values()
            .filter(|entity| {
                entity.project_id == project_id
                    && entity.provider_id == provider_id
                    && entity.entity_type == entity_type
            })
            .filter(|entity| {
                state
                    .properties
                    .get(&entity.id)
                    .and_then(|props| props.get(key))
                    .map_or(false, |prop| prop.value() == value)
            })
            .map(|entity| state.entity(entity.id))
            .collect()
    }

    async fn get_properties(&self, entity_id: Uuid) -> Result<Properties, StoreError> {
        let state = self.state.read();
        if !state.entities.contains_key(&entity_id) {
            return Err(not_found("entity", entity_id));
        }
        Ok(state.properties.get(&entity_id).cloned().unwrap_or_default())
    }

    async fn get_provider_by_id(&self, provider_id: Uuid) -> Result<ProviderRecord, StoreError> {
        self.state
            .read()
            .providers
            .get(&provider_id)
            .cloned()
            .ok_or_else(|| not_found("provider", provider_id))
    }

    async fn update_lease(&self, entity_id: Uuid, execution_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        match state.leases.get_mut(&entity_id) {
            Some(lease) if lease.locked_by == execution_id => {
                lease.locked_at = Utc::now();
                Ok(())
            }
            Some(lease) => Err(StoreError::Conflict(format!(
                "entity {entity_id} is leased by {}",
                lease.locked_by
            ))),
            None => Err(StoreError::Conflict(format!("entity {entity_id} is not leased"))),
        }
    }

    async fn release_lock(&self, entity_id: Uuid, execution_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        match state.leases.get(&entity_id) {
            None => Ok(()),
            Some(lease) if lease.locked_by == execution_id => {
                state.leases.remove(&entity_id);
                Ok(())
            }
            Some(lease) => Err(StoreError::Conflict(format!(
                "entity {entity_id} is leased by {}",
                lease.locked_by
            ))),
        }
    }

    async fn lock_if_threshold_not_exceeded(
        &self,
        entity_id: Uuid,
        execution_id: Uuid,
        threshold: Duration,
    ) -> Result<Lease, StoreError> {
        let mut state = self.state.write();
        if !state.entities.contains_key(&entity_id) {
            return Err(not_found("entity", entity_id));
        }
        let now = Utc::now();
        if let Some(lease) = state.leases.get(&entity_id) {
            let age = (now - lease.locked_at).to_std().unwrap_or_default();
            if lease.locked_by != execution_id && age < threshold {
                return Err(StoreError::Conflict(format!(
                    "entity {entity_id} is leased by {}",
                    lease.locked_by
                )));
            }
        }
        let lease = Lease {
            entity_id,
            locked_by: execution_id,
            locked_at: now,
        };
        state.leases.insert(entity_id, lease.clone());
        Ok(lease)
    }

    async fn get_lease(&self, entity_id: Uuid) -> Result<Option<Lease>, StoreError> {
        Ok(self.state.read().leases.get(&entity_id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            ops: Vec::new(),
        }))
    }
}

/// Buffers writes and applies them atomically on commit.
struct MemoryTx {
    state: Arc<RwLock<State>>,
    ops: Vec<Op>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn upsert_rule_evaluation(
        &mut self,
        key: &RuleEvaluationKey,
    ) -> Result<Uuid, StoreError> {
        let id = self
            .state
            .read()
            .evaluations
            .get(key)
            .map(|record| record.id)
            .unwrap_or_else(Uuid::new_v4);
        self.ops.push(Op::UpsertEvaluation {
            id,
            key: key.clone(),
        });
        Ok(id)
    }

    async fn upsert_eval_detail(
        &mut self,
        rule_eval_id: Uuid,
        status: EvalStatus,
        details: &str,
    ) -> Result<(), StoreError> {
        self.ops.push(Op::EvalDetail {
            id: rule_eval_id,
            status,
            details: details.to_string(),
        });
        Ok(())
    }

    async fn upsert_remediation_detail(
        &mut self,
        rule_eval_id: Uuid,
        status: RemediationStatus,
        details: &Value,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        self.ops.push(Op::RemediationDetail {
            id: rule_eval_id,
            status,
            details: details.clone(),
            metadata: metadata.clone(),
        });
        Ok(())
    }

    async fn upsert_alert_detail(
        &mut self,
        rule_eval_id: Uuid,
        status: AlertStatus,
        details: &Value,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        self.ops.push(Op::AlertDetail {
            id: rule_eval_id,
            status,
            details: details.clone(),
            metadata: metadata.clone(),
        });
        Ok(())
    }

    async fn create_or_ensure_entity_by_id(
        &mut self,
        entity: &EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        if let Some(existing) = self.state.read().entities.get(&entity.id) {
            return Ok(existing.clone());
        }
        self.ops.push(Op::EnsureEntity(entity.clone()));
        Ok(entity.clone())
    }

    async fn get_entity_by_id(
        &mut self,
        entity_id: Uuid,
    ) -> Result<EntityWithProperties, StoreError> {
        self.state.read().entity(entity_id)
    }

    async fn get_entity_by_name(
        &mut self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        name: &str,
    ) -> Result<EntityWithProperties, StoreError> {
        self.state
            .read()
            .entity_by_name(project_id, provider_id, entity_type, name)
    }

    async fn upsert_entity_by_name(
        &mut self,
        entity: &EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        let existing = self.state.read().entity_by_name(
            entity.project_id,
            entity.provider_id,
            entity.entity_type,
            &entity.name,
        );
        match existing {
            Ok(existing) => Ok(existing.entity),
            Err(StoreError::NotFound(_)) => {
                // A concurrent writer of the same name fails this commit with AlreadyExists.
                self.ops.push(Op::EnsureEntity(entity.clone()));
                Ok(entity.clone())
            }
            Err(err) => Err(err),
        }
    }

    async fn save_properties(
        &mut self,
        entity_id: Uuid,
        properties: &Properties,
    ) -> Result<(), StoreError> {
        self.ops
            .push(Op::SaveProperties(entity_id, properties.clone()));
        Ok(())
    }

    async fn delete_entity(&mut self, entity_id: Uuid) -> Result<(), StoreError> {
        self.ops.push(Op::DeleteEntity(entity_id));
        Ok(())
    }

    async fn create_rule_type(&mut self, rule_type: &RuleType) -> Result<RuleType, StoreError> {
        let mut created = rule_type.clone();
        let id = *created.id.get_or_insert_with(Uuid::new_v4);
        self.ops.push(Op::CreateRuleType(id, created.clone()));
        Ok(created)
    }

    async fn update_rule_type(&mut self, rule_type: &RuleType) -> Result<RuleType, StoreError> {
        let id = rule_type
            .id
            .ok_or_else(|| StoreError::NotFound(format!("rule type {} has no id", rule_type.name)))?;
        self.ops.push(Op::UpdateRuleType(id, rule_type.clone()));
        Ok(rule_type.clone())
    }

    async fn create_profile(&mut self, profile: &Profile) -> Result<Profile, StoreError> {
        let mut created = profile.clone();
        let id = *created.id.get_or_insert_with(Uuid::new_v4);
        self.ops.push(Op::CreateProfile(id, created.clone()));
        Ok(created)
    }

    async fn update_profile(&mut self, profile: &Profile) -> Result<Profile, StoreError> {
        let id = profile
            .id
            .ok_or_else(|| StoreError::NotFound(format!("profile {} has no id", profile.name)))?;
        self.ops.push(Op::UpdateProfile(id, profile.clone()));
        Ok(profile.clone())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx { state, ops } = *self;
        let mut guard = state.write();
        let mut staged = guard.clone();
        let mut remap = HashMap::new();
        for op in ops {
            staged.apply(op, &mut remap)?;
        }
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(project_id: Uuid, provider_id: Uuid, name: &str) -> EntityWithProperties {
        EntityWithProperties::new(
            EntityInstance {
                id: Uuid::new_v4(),
                entity_type: EntityType::Repository,
                name: name.to_string(),
                project_id,
                provider_id,
                originated_from: None,
            },
            Properties::new(vec![("repo_id", 123i64)]).unwrap(),
        )
    }

    fn key(entity_id: Uuid) -> RuleEvaluationKey {
        RuleEvaluationKey {
            profile_id: Uuid::new_v4(),
            rule_type_id: Uuid::new_v4(),
            entity_id,
            entity_type: EntityType::Repository,
            rule_name: "rule".into(),
        }
    }

    #[tokio::test]
    async fn parent_projects_are_leaf_first() {
        let store = MemoryStore::new();
        let root = Uuid::new_v4();
        let child = Uuid::new_v4();
        store.insert_project(Project {
            id: root,
            name: "root".into(),
            parent_id: None,
        });
        store.insert_project(Project {
            id: child,
            name: "child".into(),
            parent_id: Some(root),
        });
        assert_eq!(store.get_parent_projects(child).await.unwrap(), vec![child, root]);
        assert!(matches!(
            store.get_parent_projects(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        let repo = entity(Uuid::new_v4(), Uuid::new_v4(), "foo/test");
        store.insert_entity(repo.clone());

        let mut tx = store.begin().await.unwrap();
        let id = tx.upsert_rule_evaluation(&key(repo.id())).await.unwrap();
        tx.upsert_eval_detail(id, EvalStatus::Success, "").await.unwrap();
        drop(tx);
        assert!(store.evaluations().is_empty());
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        let repo = entity(Uuid::new_v4(), Uuid::new_v4(), "foo/test");
        store.insert_entity(repo.clone());

        let mut tx = store.begin().await.unwrap();
        let id = tx.upsert_rule_evaluation(&key(repo.id())).await.unwrap();
        tx.upsert_eval_detail(id, EvalStatus::Success, "").await.unwrap();
        tx.save_properties(Uuid::new_v4(), &Properties::default())
            .await
            .unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::NotFound(_))));
        assert!(store.evaluations().is_empty());
    }

    #[tokio::test]
    async fn upsert_keeps_record_identity() {
        let store = MemoryStore::new();
        let repo = entity(Uuid::new_v4(), Uuid::new_v4(), "foo/test");
        store.insert_entity(repo.clone());
        let key = key(repo.id());

        let mut ids = Vec::new();
        for status in [EvalStatus::Failure, EvalStatus::Success] {
            let mut tx = store.begin().await.unwrap();
            let id = tx.upsert_rule_evaluation(&key).await.unwrap();
            tx.upsert_eval_detail(id, status, "").await.unwrap();
            tx.upsert_alert_detail(id, AlertStatus::On, &json!({}), &json!({"alert_id": 1}))
                .await
                .unwrap();
            tx.commit().await.unwrap();
            ids.push(id);
        }
        assert_eq!(ids[0], ids[1]);
        let record = store.get_rule_evaluation(&key).await.unwrap().unwrap();
        assert_eq!(record.eval_status, EvalStatus::Success);
        assert_eq!(record.previous().alert_metadata, json!({"alert_id": 1}));
    }

    #[tokio::test]
    async fn fresh_lease_blocks_other_executions() {
        let store = MemoryStore::new();
        let repo = entity(Uuid::new_v4(), Uuid::new_v4(), "foo/test");
        store.insert_entity(repo.clone());
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let threshold = Duration::from_secs(600);

        store
            .lock_if_threshold_not_exceeded(repo.id(), first, threshold)
            .await
            .unwrap();
        assert!(matches!(
            store
                .lock_if_threshold_not_exceeded(repo.id(), second, threshold)
                .await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.update_lease(repo.id(), second).await,
            Err(StoreError::Conflict(_))
        ));
        store.update_lease(repo.id(), first).await.unwrap();

        // A zero threshold treats every lease as stale.
        let lease = store
            .lock_if_threshold_not_exceeded(repo.id(), second, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(lease.locked_by, second);
        assert!(store.release_lock(repo.id(), first).await.is_err());
        store.release_lock(repo.id(), second).await.unwrap();
        assert_eq!(store.get_lease(repo.id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn deleting_an_entity_cascades_to_children() {
        let store = MemoryStore::new();
        let (project, provider) = (Uuid::new_v4(), Uuid::new_v4());
        let repo = entity(project, provider, "foo/test");
        store.insert_entity(repo.clone());
        let mut pr = entity(project, provider, "foo/test#1");
        pr.entity.entity_type = EntityType::PullRequest;
        pr.entity.originated_from = Some(repo.id());

        let mut tx = store.begin().await.unwrap();
        tx.create_or_ensure_entity_by_id(&pr.entity).await.unwrap();
        tx.save_properties(pr.id(), &pr.properties).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.get_properties(pr.id()).await.unwrap(), pr.properties);

        let mut tx = store.begin().await.unwrap();
        tx.delete_entity(repo.id()).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.get_entity_by_id(pr.id()).await.is_err());
    }

    #[tokio::test]
    async fn racing_name_upserts_keep_the_first_entity() {
        let store = MemoryStore::new();
        let (project, provider) = (Uuid::new_v4(), Uuid::new_v4());
        let first = entity(project, provider, "foo/test");
        let second = entity(project, provider, "foo/test");

        let mut first_tx = store.begin().await.unwrap();
        let mut second_tx = store.begin().await.unwrap();
        assert_eq!(
            first_tx.upsert_entity_by_name(&first.entity).await.unwrap().id,
            first.id()
        );
        assert_eq!(
            second_tx.upsert_entity_by_name(&second.entity).await.unwrap().id,
            second.id()
        );
        first_tx.commit().await.unwrap();
        assert!(matches!(
            second_tx.commit().await,
            Err(StoreError::AlreadyExists(_))
        ));

        let mut retry = store.begin().await.unwrap();
        let stored = retry.upsert_entity_by_name(&second.entity).await.unwrap();
        assert_eq!(stored.id, first.id());
        let read = retry
            .get_entity_by_name(project, provider, EntityType::Repository, "foo/test")
            .await
            .unwrap();
        assert_eq!(read.id(), first.id());
        retry.commit().await.unwrap();
        assert!(store.get_entity_by_id(second.id()).await.is_err());
    }

    #[tokio::test]
    async fn entities_are_found_by_property() {
        let store = MemoryStore::new();
        let (project, provider) = (Uuid::new_v4(), Uuid::new_v4());
        let repo = entity(project, provider, "foo/test");
        store.insert_entity(repo.clone());
        store.insert_entity(entity(project, provider, "foo/other"));

        let found = store
            .get_entities_by_property(
                project,
                provider,
                EntityType::Repository,
                "repo_id",
                &PropertyValue::from(123i64),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        let by_name = store
            .get_entity_by_name(project, provider, EntityType::Repository, "foo/test")
            .await
            .unwrap();
        assert_eq!(by_name.id(), repo.id());
    }

    #[tokio::test]
    async fn duplicate_rule_type_names_conflict() {
        let store = MemoryStore::new();
        let project = Uuid::new_v4();
        let rule_type: RuleType = serde_json::from_value(json!({
            "name": "secret_scanning",
            "context": {"project": project.to_string()},
            "def": {
                "in_entity": "repository",
                "rule_schema": {"type": "object"},
                "ingest": {"type": "builtin"},
                "eval": {"type": "jq", "jq": []}
            }
        }))
        .unwrap();
        store.insert_rule_type(rule_type.clone());

        let mut tx = store.begin().await.unwrap();
        tx.create_rule_type(&rule_type).await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.list_rule_types(project).await.unwrap().len(), 1);
    }
}
