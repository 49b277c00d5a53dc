//! Create and update flows for rule types and profiles.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;
use vigil_rules::namespace::{
    validate_labels, validate_namespace_for_create, validate_namespace_for_update,
};
use vigil_rules::schema::SchemaValidator;
use vigil_rules::{validate_rule_type_update, Context, Profile, RuleType, RuleTypeError, ValidationError};

use crate::error::{ServiceError, StoreError};
use crate::store::{with_transaction, Store};

#[derive(Clone)]
pub struct RuleTypeService {
    store: Arc<dyn Store>,
}

impl RuleTypeService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create_rule_type(
        &self,
        project_id: Uuid,
        mut rule_type: RuleType,
        subscription_id: Option<Uuid>,
    ) -> Result<RuleType, ServiceError> {
        validate_namespace_for_create(&rule_type.name, subscription_id)?;
        rule_type
            .validate()
            .map_err(|err| RuleTypeError::invalid(&rule_type.name, err.message))?;

        match self
            .store
            .get_rule_type_by_name(&[project_id], &rule_type.name)
            .await
        {
            Ok(_) => return Err(RuleTypeError::RuleAlreadyExists(rule_type.name).into()),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        rule_type.id = None;
        rule_type.context = Some(Context::for_project(project_id));
        rule_type.subscription_id = subscription_id;
        let name = rule_type.name.clone();
        let created = with_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.create_rule_type(&rule_type).await })
        })
        .await
        .map_err(|err| match err {
            StoreError::AlreadyExists(_) => ServiceError::from(RuleTypeError::RuleAlreadyExists(name)),
            other => other.into(),
        })?;
        info!(project_id = %project_id, rule_type = %created.name, "rule type created");
        Ok(created)
    }

    /// Replaces a stored rule type. The new rule schema must accept every definition
    /// the old one accepted.
    pub async fn update_rule_type(
        &self,
        project_id: Uuid,
        mut rule_type: RuleType,
        subscription_id: Option<Uuid>,
    ) -> Result<RuleType, ServiceError> {
        let existing = match self
            .store
            .get_rule_type_by_name(&[project_id], &rule_type.name)
            .await
        {
            Ok(existing) => existing,
            Err(StoreError::NotFound(_)) => {
                return Err(RuleTypeError::RuleNotFound(rule_type.name).into())
            }
            Err(err) => return Err(err.into()),
        };
        validate_namespace_for_update(
            &existing.name,
            existing.subscription_id,
            &rule_type.name,
            subscription_id,
        )?;
        validate_rule_type_update(&existing, &rule_type)?;

        rule_type.id = existing.id;
        rule_type.context = Some(Context::for_project(project_id));
        rule_type.subscription_id = existing.subscription_id.or(subscription_id);
        let updated = with_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.update_rule_type(&rule_type).await })
        })
        .await?;
        info!(project_id = %project_id, rule_type = %updated.name, "rule type updated");
        Ok(updated)
    }
}

#[derive(Clone)]
pub struct ProfileService {
    store: Arc<dyn Store>,
}

impl ProfileService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create_profile(
        &self,
        project_id: Uuid,
        mut profile: Profile,
        subscription_id: Option<Uuid>,
    ) -> Result<Profile, ServiceError> {
        validate_namespace_for_create(&profile.name, subscription_id)?;
        validate_labels(&profile.labels, subscription_id, None)?;
        profile.context = Some(Context::for_project(project_id));
        profile.validate()?;
        self.check_rules(project_id, &profile).await?;

        match self.store.get_profile_by_name(project_id, &profile.name).await {
            Ok(_) => return Err(ServiceError::ProfileAlreadyExists(profile.name)),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        profile.id = None;
        profile.subscription_id = subscription_id;
        let name = profile.name.clone();
        let created = with_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.create_profile(&profile).await })
        })
        .await
        .map_err(|err| match err {
            StoreError::AlreadyExists(_) => ServiceError::ProfileAlreadyExists(name),
            other => other.into(),
        })?;
        info!(project_id = %project_id, profile = %created.name, "profile created");
        Ok(created)
    }

    /// Replaces a stored profile. Labels cannot change.
    pub async fn update_profile(
        &self,
        project_id: Uuid,
        mut profile: Profile,
        subscription_id: Option<Uuid>,
    ) -> Result<Profile, ServiceError> {
        let existing = match self.store.get_profile_by_name(project_id, &profile.name).await {
            Ok(existing) => existing,
            Err(StoreError::NotFound(_)) => return Err(ServiceError::ProfileNotFound(profile.name)),
            Err(err) => return Err(err.into()),
        };
        validate_namespace_for_update(
            &existing.name,
            existing.subscription_id,
            &profile.name,
            subscription_id,
        )?;
        validate_labels(&profile.labels, subscription_id, Some(&existing.labels))?;
        profile.context = Some(Context::for_project(project_id));
        profile.validate()?;
        self.check_rules(project_id, &profile).await?;

        profile.id = existing.id;
        profile.subscription_id = existing.subscription_id;
        let updated = with_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.update_profile(&profile).await })
        })
        .await?;
        info!(project_id = %project_id, profile = %updated.name, "profile updated");
        Ok(updated)
    }

    /// Every rule must name a visible rule type for its entity, with a definition the
    /// rule schema accepts.
    async fn check_rules(&self, project_id: Uuid, profile: &Profile) -> Result<(), ServiceError> {
        let hierarchy = self.store.get_parent_projects(project_id).await?;
        for (entity_type, rules) in &profile.rules {
            for rule in rules {
                let rule_type = match self
                    .store
                    .get_rule_type_by_name(&hierarchy, &rule.rule_type)
                    .await
                {
                    Ok(rule_type) => rule_type,
                    Err(StoreError::NotFound(_)) => {
                        return Err(ValidationError::for_rule_type(
                            &rule.rule_type,
                            "rule type does not exist",
                        )
                        .into())
                    }
                    Err(err) => return Err(err.into()),
                };
                if rule_type.def.in_entity != *entity_type {
                    return Err(ValidationError::for_rule_type(
                        &rule.rule_type,
                        format!(
                            "rule type applies to {}, not {entity_type}",
                            rule_type.def.in_entity
                        ),
                    )
                    .into());
                }
                let validator = SchemaValidator::compile(&rule_type.def.rule_schema)
                    .map_err(|reason| ValidationError::for_rule_type(&rule.rule_type, reason))?;
                validator.validate(&rule.def).map_err(|errors| {
                    ValidationError::for_rule_type(
                        &rule.rule_type,
                        format!("invalid rule definition: {}", errors.join("; ")),
                    )
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Project};
    use crate::testing::{enabled_rule_type, profile};
    use serde_json::json;
    use vigil_protocol::EntityType;
    use vigil_rules::RuleInvocation;

    struct Services {
        store: MemoryStore,
        project_id: Uuid,
        rule_types: RuleTypeService,
        profiles: ProfileService,
    }

    fn services() -> Services {
        let store = MemoryStore::new();
        let project_id = Uuid::new_v4();
        store.insert_project(Project {
            id: project_id,
            name: "acme".into(),
            parent_id: None,
        });
        Services {
            rule_types: RuleTypeService::new(Arc::new(store.clone())),
            profiles: ProfileService::new(Arc::new(store.clone())),
            store,
            project_id,
        }
    }

    #[tokio::test]
    async fn rule_type_create_then_duplicate() {
        let s = services();
        let created = s
            .rule_types
            .create_rule_type(s.project_id, enabled_rule_type("branch_protection", Uuid::nil()), None)
            .await
            .unwrap();
        assert!(created.id.is_some());
        assert_eq!(created.project_id(), Some(s.project_id));

        let err = s
            .rule_types
            .create_rule_type(s.project_id, enabled_rule_type("branch_protection", s.project_id), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RuleType(RuleTypeError::RuleAlreadyExists(_))));
    }

    #[tokio::test]
    async fn namespaced_rule_type_needs_subscription() {
        let s = services();
        let err = s
            .rule_types
            .create_rule_type(s.project_id, enabled_rule_type("stacklok/ctlog", s.project_id), None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot create a rule type or profile with a namespace through the API"
        );
    }

    #[tokio::test]
    async fn incompatible_rule_type_update_is_rejected() {
        let s = services();
        s.rule_types
            .create_rule_type(s.project_id, enabled_rule_type("branch_protection", s.project_id), None)
            .await
            .unwrap();
        let mut changed = enabled_rule_type("branch_protection", s.project_id);
        changed.def.rule_schema = json!({
            "type": "object",
            "properties": {"enabled": {"type": "string"}}
        });

        let err = s
            .rule_types
            .update_rule_type(s.project_id, changed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RuleType(RuleTypeError::RuleTypeInvalid { .. })));
    }

    #[tokio::test]
    async fn updating_a_missing_rule_type_is_not_found() {
        let s = services();
        let err = s
            .rule_types
            .update_rule_type(s.project_id, enabled_rule_type("branch_protection", s.project_id), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RuleType(RuleTypeError::RuleNotFound(_))));
    }

    #[tokio::test]
    async fn profile_rules_must_match_rule_types() {
        let s = services();
        s.store
            .insert_rule_type(enabled_rule_type("branch_protection", s.project_id));

        let unknown = profile(
            "acme",
            s.project_id,
            vec![RuleInvocation::new("secret_scanning", json!({}))],
        );
        let err = s.profiles.create_profile(s.project_id, unknown, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let mut wrong_entity = Profile::new("acme");
        wrong_entity = wrong_entity.with_rule(
            EntityType::Artifact,
            RuleInvocation::new("branch_protection", json!({"enabled": true})),
        );
        let err = s
            .profiles
            .create_profile(s.project_id, wrong_entity, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("applies to repository"));

        let bad_def = profile(
            "acme",
            s.project_id,
            vec![RuleInvocation::new("branch_protection", json!({"enabled": "yes"}))],
        );
        let err = s.profiles.create_profile(s.project_id, bad_def, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn profile_labels_are_immutable() {
        let s = services();
        s.store
            .insert_rule_type(enabled_rule_type("branch_protection", s.project_id));
        let subscription = Some(Uuid::new_v4());
        let mut acme = profile(
            "stacklok/acme",
            s.project_id,
            vec![RuleInvocation::new("branch_protection", json!({"enabled": true}))],
        );
        acme.labels = vec!["baseline".into()];
        let created = s
            .profiles
            .create_profile(s.project_id, acme.clone(), subscription)
            .await
            .unwrap();
        assert!(created.id.is_some());

        let err = s
            .profiles
            .create_profile(s.project_id, acme.clone(), subscription)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ProfileAlreadyExists(_)));

        let mut relabelled = acme.clone();
        relabelled.labels = vec!["strict".into()];
        let err = s
            .profiles
            .update_profile(s.project_id, relabelled, subscription)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RuleType(RuleTypeError::LabelsImmutable)));

        acme.remediate = Some(vigil_rules::ActionState::On);
        let updated = s
            .profiles
            .update_profile(s.project_id, acme, subscription)
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.remediate, Some(vigil_rules::ActionState::On));
    }
}
