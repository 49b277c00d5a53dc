use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;
use vigil_core::db::{DatabaseMigrator, DatabasePool};
use vigil_core::errors::{Result as CoreResult, VigilError};
use vigil_protocol::{EntityInstance, EntityType, EntityWithProperties, Properties, PropertyValue};
use vigil_rules::{
    merge_profile_rows, AlertStatus, EvalStatus, Profile, ProfileRow, ProfileSelector,
    RemediationStatus, RuleType,
};

use super::{
    not_found, EvaluationRecord, Lease, Project, ProviderRecord, RuleEvaluationKey, Store,
    StoreTx,
};
use crate::error::StoreError;

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: DatabasePool,
}

impl PgStore {
    /// Wraps the pool and brings the schema up to date.
    pub async fn from_pool(pool: DatabasePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(self.pool.inner()).await?;
        Ok(())
    }

    async fn properties_of(&self, entity_id: Uuid) -> Result<Properties, StoreError> {
        let mut conn = self.pool.inner().acquire().await?;
        load_properties(&mut conn, entity_id).await
    }

    async fn with_properties(&self, row: EntityRow) -> Result<EntityWithProperties, StoreError> {
        let entity = EntityInstance::try_from(row)?;
        let properties = self.properties_of(entity.id).await?;
        Ok(EntityWithProperties::new(entity, properties))
    }

    async fn profiles(
        &self,
        project_id: Uuid,
        name: Option<&str>,
    ) -> Result<Vec<Profile>, StoreError> {
        let rows = sqlx::query_as::<_, ProfileJoinRow>(
            r#"
            SELECT p.id, p.name, p.display_name, p.project_id, p.remediate, p.alert,
                   p.labels, p.subscription_id, p.selectors,
                   ep.entity_type, ep.contextual_rules::text AS contextual_rules
            FROM profiles p
            LEFT JOIN entity_profiles ep ON ep.profile_id = p.id
            WHERE p.project_id = $1 AND ($2::text IS NULL OR p.name = $2)
            ORDER BY p.name, ep.entity_type
            "#,
        )
        .bind(project_id)
        .bind(name)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(merge_profile_rows(rows.into_iter().map(ProfileRow::from)))
    }
}

#[async_trait]
impl DatabaseMigrator for PgStore {
    async fn run_migrations(&self, pool: &DatabasePool) -> CoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(pool.inner())
            .await
            .map_err(VigilError::from)
    }
}

#[derive(Debug, FromRow)]
struct ProjectRow {
    id: Uuid,
    name: String,
    parent_id: Option<Uuid>,
}

#[derive(Debug, FromRow)]
struct ProviderRow {
    id: Uuid,
    name: String,
    class: String,
    project_id: Uuid,
}

#[derive(Debug, FromRow)]
struct EntityRow {
    id: Uuid,
    entity_type: String,
    name: String,
    project_id: Uuid,
    provider_id: Uuid,
    originated_from: Option<Uuid>,
}

impl TryFrom<EntityRow> for EntityInstance {
    type Error = StoreError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        Ok(EntityInstance {
            id: row.id,
            entity_type: row.entity_type.parse().map_err(StoreError::Decode)?,
            name: row.name,
            project_id: row.project_id,
            provider_id: row.provider_id,
            originated_from: row.originated_from,
        })
    }
}

#[derive(Debug, FromRow)]
struct PropertyRow {
    key: String,
    value: Json<Value>,
}

#[derive(Debug, FromRow)]
struct RuleTypeRow {
    id: Uuid,
    document: Json<RuleType>,
}

impl From<RuleTypeRow> for RuleType {
    fn from(row: RuleTypeRow) -> Self {
        let mut rule_type = row.document.0;
        rule_type.id = Some(row.id);
        rule_type
    }
}

#[derive(Debug, FromRow)]
struct ProfileJoinRow {
    id: Uuid,
    name: String,
    display_name: String,
    project_id: Uuid,
    remediate: Option<String>,
    alert: Option<String>,
    labels: Vec<String>,
    subscription_id: Option<Uuid>,
    selectors: Json<Vec<ProfileSelector>>,
    entity_type: Option<String>,
    contextual_rules: Option<String>,
}

impl From<ProfileJoinRow> for ProfileRow {
    fn from(row: ProfileJoinRow) -> Self {
        ProfileRow {
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            project_id: row.project_id,
            remediate: row.remediate,
            alert: row.alert,
            labels: row.labels,
            subscription_id: row.subscription_id,
            selectors: row.selectors.0,
            entity_type: row.entity_type,
            contextual_rules: row.contextual_rules.map(String::into_bytes),
        }
    }
}

#[derive(Debug, FromRow)]
struct EvaluationRow {
    id: Uuid,
    profile_id: Uuid,
    rule_type_id: Uuid,
    entity_id: Uuid,
    entity_type: String,
    rule_name: String,
    eval_status: String,
    eval_details: String,
    remediation_status: String,
    remediation_details: Json<Value>,
    remediation_metadata: Json<Value>,
    alert_status: String,
    alert_details: Json<Value>,
    alert_metadata: Json<Value>,
    last_updated: DateTime<Utc>,
}

impl TryFrom<EvaluationRow> for EvaluationRecord {
    type Error = StoreError;

    fn try_from(row: EvaluationRow) -> Result<Self, Self::Error> {
        Ok(EvaluationRecord {
            id: row.id,
            key: RuleEvaluationKey {
                profile_id: row.profile_id,
                rule_type_id: row.rule_type_id,
                entity_id: row.entity_id,
                entity_type: row.entity_type.parse().map_err(StoreError::Decode)?,
                rule_name: row.rule_name,
            },
            eval_status: row.eval_status.parse().map_err(StoreError::Decode)?,
            eval_details: row.eval_details,
            remediation_status: row.remediation_status.parse().map_err(StoreError::Decode)?,
            remediation_details: row.remediation_details.0,
            remediation_metadata: row.remediation_metadata.0,
            alert_status: row.alert_status.parse().map_err(StoreError::Decode)?,
            alert_details: row.alert_details.0,
            alert_metadata: row.alert_metadata.0,
            last_updated: row.last_updated,
        })
    }
}

#[derive(Debug, FromRow)]
struct LeaseRow {
    entity_id: Uuid,
    locked_by: Uuid,
    last_lock_time: DateTime<Utc>,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Lease {
            entity_id: row.entity_id,
            locked_by: row.locked_by,
            locked_at: row.last_lock_time,
        }
    }
}

const ENTITY_COLUMNS: &str = "id, entity_type, name, project_id, provider_id, originated_from";

const EVALUATION_SELECT: &str = r#"
    SELECT re.id, re.profile_id, re.rule_type_id, re.entity_id, re.entity_type, re.rule_name,
           COALESCE(de.status, 'pending') AS eval_status,
           COALESCE(de.details, '') AS eval_details,
           COALESCE(dr.status, 'pending') AS remediation_status,
           COALESCE(dr.details, 'null'::jsonb) AS remediation_details,
           COALESCE(dr.metadata, 'null'::jsonb) AS remediation_metadata,
           COALESCE(da.status, 'off') AS alert_status,
           COALESCE(da.details, 'null'::jsonb) AS alert_details,
           COALESCE(da.metadata, 'null'::jsonb) AS alert_metadata,
           COALESCE(de.last_updated, re.updated_at) AS last_updated
    FROM rule_evaluations re
    LEFT JOIN rule_details_eval de ON de.rule_eval_id = re.id
    LEFT JOIN rule_details_remediate dr ON dr.rule_eval_id = re.id
    LEFT JOIN rule_details_alert da ON da.rule_eval_id = re.id
"#;

async fn load_properties(conn: &mut PgConnection, entity_id: Uuid) -> Result<Properties, StoreError> {
    let rows = sqlx::query_as::<_, PropertyRow>(
        "SELECT key, value FROM properties WHERE entity_id = $1 ORDER BY key",
    )
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await?;
    let wire: Map<String, Value> = rows.into_iter().map(|row| (row.key, row.value.0)).collect();
    Ok(Properties::from_wire(&wire)?)
}

async fn fetch_entity(conn: &mut PgConnection, entity_id: Uuid) -> Result<EntityInstance, StoreError> {
    let row = sqlx::query_as::<_, EntityRow>(&format!(
        "SELECT {ENTITY_COLUMNS} FROM entity_instances WHERE id = $1"
    ))
    .bind(entity_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| not_found("entity", entity_id))?;
    EntityInstance::try_from(row)
}

async fn fetch_entity_by_name(
    conn: &mut PgConnection,
    project_id: Uuid,
    provider_id: Uuid,
    entity_type: EntityType,
    name: &str,
) -> Result<EntityWithProperties, StoreError> {
    let row = sqlx::query_as::<_, EntityRow>(&format!(
        "SELECT {ENTITY_COLUMNS} FROM entity_instances \
         WHERE project_id = $1 AND provider_id = $2 AND entity_type = $3 AND name = $4"
    ))
    .bind(project_id)
    .bind(provider_id)
    .bind(entity_type.as_str())
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| not_found(entity_type.as_str(), name))?;
    let entity = EntityInstance::try_from(row)?;
    let properties = load_properties(conn, entity.id).await?;
    Ok(EntityWithProperties::new(entity, properties))
}

#[async_trait]
impl Store for PgStore {
    async fn get_parent_projects(&self, project_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE chain AS (
                SELECT id, parent_id, 0 AS depth FROM projects WHERE id = $1
                UNION ALL
                SELECT p.id, p.parent_id, c.depth + 1
                FROM projects p JOIN chain c ON p.id = c.parent_id
            )
            SELECT id FROM chain ORDER BY depth
            "#,
        )
        .bind(project_id)
        .fetch_all(self.pool.inner())
        .await?;
        if ids.is_empty() {
            return Err(not_found("project", project_id));
        }
        Ok(ids)
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Project, StoreError> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, parent_id FROM projects WHERE id = $1",
        )
        .bind(project_id)
        .fetch_optional(self.pool.inner())
        .await?
        .ok_or_else(|| not_found("project", project_id))?;
        Ok(Project {
            id: row.id,
            name: row.name,
            parent_id: row.parent_id,
        })
    }

    async fn list_profiles_by_project_id(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<Profile>, StoreError> {
        self.profiles(project_id, None).await
    }

    async fn get_profile_by_name(
        &self,
        project_id: Uuid,
        name: &str,
    ) -> Result<Profile, StoreError> {
        self.profiles(project_id, Some(name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| not_found("profile", name))
    }

    async fn get_rule_type_by_name(
        &self,
        projects: &[Uuid],
        name: &str,
    ) -> Result<RuleType, StoreError> {
        let row = sqlx::query_as::<_, RuleTypeRow>(
            r#"
            SELECT id, document FROM rule_types
            WHERE name = $2 AND project_id = ANY($1::uuid[])
            ORDER BY array_position($1::uuid[], project_id)
            LIMIT 1
            "#,
        )
        .bind(projects)
        .bind(name)
        .fetch_optional(self.pool.inner())
        .await?
        .ok_or_else(|| not_found("rule type", name))?;
        Ok(row.into())
    }

    async fn list_rule_types(&self, project_id: Uuid) -> Result<Vec<RuleType>, StoreError> {
        let rows = sqlx::query_as::<_, RuleTypeRow>(
            "SELECT id, document FROM rule_types WHERE project_id = $1 ORDER BY name",
        )
        .bind(project_id)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(rows.into_iter().map(RuleType::from).collect())
    }

    async fn get_rule_evaluation(
        &self,
        key: &RuleEvaluationKey,
    ) -> Result<Option<EvaluationRecord>, StoreError> {
        let row = sqlx::query_as::<_, EvaluationRow>(&format!(
            "{EVALUATION_SELECT} WHERE re.profile_id = $1 AND re.rule_type_id = $2 \
             AND re.entity_id = $3 AND re.rule_name = $4"
        ))
        .bind(key.profile_id)
        .bind(key.rule_type_id)
        .bind(key.entity_id)
        .bind(&key.rule_name)
        .fetch_optional(self.pool.inner())
        .await?;
        row.map(EvaluationRecord::try_from).transpose()
    }

    async fn list_rule_evaluations(
        &self,
        entity_id: Uuid,
    ) -> Result<Vec<EvaluationRecord>, StoreError> {
        sqlx::query_as::<_, EvaluationRow>(&format!(
            "{EVALUATION_SELECT} WHERE re.entity_id = $1 ORDER BY re.profile_id, re.rule_name"
        ))
        .bind(entity_id)
        .fetch_all(self.pool.inner())
        .await?
        .into_iter()
        .map(EvaluationRecord::try_from)
        .collect()
    }

    async fn get_entity_by_id(&self, entity_id: Uuid) -> Result<EntityWithProperties, StoreError> {
        let mut conn = self.pool.inner().acquire().await?;
        let entity = fetch_entity(&mut conn, entity_id).await?;
        let properties = load_properties(&mut conn, entity_id).await?;
        Ok(EntityWithProperties::new(entity, properties))
    }

    async fn get_entity_by_name(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        name: &str,
    ) -> Result<EntityWithProperties, StoreError> {
        let mut conn = self.pool.inner().acquire().await?;
        fetch_entity_by_name(&mut conn, project_id, provider_id, entity_type, name).await
    }

    async fn get_entities_by_property(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        key: &str,
        value: &PropertyValue,
    ) -> Result<Vec<EntityWithProperties>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT e.id, e.entity_type, e.name, e.project_id, e.provider_id, e.originated_from
            FROM entity_instances e
            JOIN properties p ON p.entity_id = e.id
            WHERE e.project_id = $1 AND e.provider_id = $2 AND e.entity_type = $3
              AND p.key = $4 AND p.value = $5
            "#,
        )
        .bind(project_id)
        .bind(provider_id)
        .bind(entity_type.as_str())
        .bind(key)
        .bind(Json(value.to_wire()))
        .fetch_all(self.pool.inner())
        .await?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            entities.push(self.with_properties(row).await?);
        }
        Ok(entities)
    }

    async fn get_properties(&self, entity_id: Uuid) -> Result<Properties, StoreError> {
        let mut conn = self.pool.inner().acquire().await?;
        fetch_entity(&mut conn, entity_id).await?;
        load_properties(&mut conn, entity_id).await
    }

    async fn get_provider_by_id(&self, provider_id: Uuid) -> Result<ProviderRecord, StoreError> {
        let row = sqlx::query_as::<_, ProviderRow>(
            "SELECT id, name, class, project_id FROM providers WHERE id = $1",
        )
        .bind(provider_id)
        .fetch_optional(self.pool.inner())
        .await?
        .ok_or_else(|| not_found("provider", provider_id))?;
        Ok(ProviderRecord {
            id: row.id,
            name: row.name,
            class: row.class,
            project_id: row.project_id,
        })
    }

    async fn update_lease(&self, entity_id: Uuid, execution_id: Uuid) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE entity_execution_lock SET last_lock_time = NOW()
            WHERE entity_id = $1 AND locked_by = $2
            "#,
        )
        .bind(entity_id)
        .bind(execution_id)
        .execute(self.pool.inner())
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::Conflict(format!(
                "entity {entity_id} is not leased by {execution_id}"
            )));
        }
        Ok(())
    }

    async fn release_lock(&self, entity_id: Uuid, execution_id: Uuid) -> Result<(), StoreError> {
        let deleted = sqlx::query(
            "DELETE FROM entity_execution_lock WHERE entity_id = $1 AND locked_by = $2",
        )
        .bind(entity_id)
        .bind(execution_id)
        .execute(self.pool.inner())
        .await?
        .rows_affected();
        if deleted > 0 {
            return Ok(());
        }
        match self.get_lease(entity_id).await? {
            Some(lease) => Err(StoreError::Conflict(format!(
                "entity {entity_id} is leased by {}",
                lease.locked_by
            ))),
            None => Ok(()),
        }
    }

    async fn lock_if_threshold_not_exceeded(
        &self,
        entity_id: Uuid,
        execution_id: Uuid,
        threshold: Duration,
    ) -> Result<Lease, StoreError> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            INSERT INTO entity_execution_lock (entity_id, locked_by, last_lock_time)
            VALUES ($1, $2, NOW())
            ON CONFLICT (entity_id) DO UPDATE
            SET locked_by = EXCLUDED.locked_by, last_lock_time = NOW()
            WHERE entity_execution_lock.locked_by = EXCLUDED.locked_by
               OR entity_execution_lock.last_lock_time < NOW() - make_interval(secs => $3)
            RETURNING entity_id, locked_by, last_lock_time
            "#,
        )
        .bind(entity_id)
        .bind(execution_id)
        .bind(threshold.as_secs_f64())
        .fetch_optional(self.pool.inner())
        .await?;
        row.map(Lease::from).ok_or_else(|| {
            StoreError::Conflict(format!("entity {entity_id} is leased by another execution"))
        })
    }

    async fn get_lease(&self, entity_id: Uuid) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query_as::<_, LeaseRow>(
            "SELECT entity_id, locked_by, last_lock_time FROM entity_execution_lock WHERE entity_id = $1",
        )
        .bind(entity_id)
        .fetch_optional(self.pool.inner())
        .await?;
        Ok(row.map(Lease::from))
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.inner().begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn replace_rulesets(&mut self, profile_id: Uuid, profile: &Profile) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM entity_profiles WHERE profile_id = $1")
            .bind(profile_id)
            .execute(&mut *self.tx)
            .await?;
        for (entity_type, rules) in &profile.rules {
            sqlx::query(
                "INSERT INTO entity_profiles (profile_id, entity_type, contextual_rules) VALUES ($1, $2, $3)",
            )
            .bind(profile_id)
            .bind(entity_type.as_str())
            .bind(Json(rules))
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }
}

fn profile_project(profile: &Profile) -> Result<Uuid, StoreError> {
    profile
        .project_id()
        .ok_or_else(|| StoreError::Decode(format!("profile {} has no project", profile.name)))
}

fn rule_type_project(rule_type: &RuleType) -> Result<Uuid, StoreError> {
    rule_type
        .project_id()
        .ok_or_else(|| StoreError::Decode(format!("rule type {} has no project", rule_type.name)))
}

#[async_trait]
impl StoreTx for PgTx {
    async fn upsert_rule_evaluation(
        &mut self,
        key: &RuleEvaluationKey,
    ) -> Result<Uuid, StoreError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO rule_evaluations (id, profile_id, rule_type_id, entity_id, entity_type, rule_name)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (profile_id, rule_type_id, entity_id, rule_name)
            DO UPDATE SET updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.profile_id)
        .bind(key.rule_type_id)
        .bind(key.entity_id)
        .bind(key.entity_type.as_str())
        .bind(&key.rule_name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn upsert_eval_detail(
        &mut self,
        rule_eval_id: Uuid,
        status: EvalStatus,
        details: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rule_details_eval (rule_eval_id, status, details, last_updated)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (rule_eval_id)
            DO UPDATE SET status = EXCLUDED.status, details = EXCLUDED.details, last_updated = NOW()
            "#,
        )
        .bind(rule_eval_id)
        .bind(status.as_str())
        .bind(details)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_remediation_detail(
        &mut self,
        rule_eval_id: Uuid,
        status: RemediationStatus,
        details: &Value,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rule_details_remediate (rule_eval_id, status, details, metadata, last_updated)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (rule_eval_id)
            DO UPDATE SET status = EXCLUDED.status, details = EXCLUDED.details,
                          metadata = EXCLUDED.metadata, last_updated = NOW()
            "#,
        )
        .bind(rule_eval_id)
        .bind(status.as_str())
        .bind(Json(details))
        .bind(Json(metadata))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_alert_detail(
        &mut self,
        rule_eval_id: Uuid,
        status: AlertStatus,
        details: &Value,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rule_details_alert (rule_eval_id, status, details, metadata, last_updated)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (rule_eval_id)
            DO UPDATE SET status = EXCLUDED.status, details = EXCLUDED.details,
                          metadata = EXCLUDED.metadata, last_updated = NOW()
            "#,
        )
        .bind(rule_eval_id)
        .bind(status.as_str())
        .bind(Json(details))
        .bind(Json(metadata))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn create_or_ensure_entity_by_id(
        &mut self,
        entity: &EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO entity_instances (id, entity_type, name, project_id, provider_id, originated_from)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(entity.id)
        .bind(entity.entity_type.as_str())
        .bind(&entity.name)
        .bind(entity.project_id)
        .bind(entity.provider_id)
        .bind(entity.originated_from)
        .execute(&mut *self.tx)
        .await?;
        fetch_entity(&mut *self.tx, entity.id).await
    }

    async fn upsert_entity_by_name(
        &mut self,
        entity: &EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        // The no-op update makes RETURNING yield the row that won the name.
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            INSERT INTO entity_instances (id, entity_type, name, project_id, provider_id, originated_from)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (project_id, provider_id, entity_type, name)
            DO UPDATE SET name = EXCLUDED.name
            RETURNING {ENTITY_COLUMNS}
            "#
        ))
        .bind(entity.id)
        .bind(entity.entity_type.as_str())
        .bind(&entity.name)
        .bind(entity.project_id)
        .bind(entity.provider_id)
        .bind(entity.originated_from)
        .fetch_one(&mut *self.tx)
        .await?;
        EntityInstance::try_from(row)
    }

    async fn get_entity_by_id(
        &mut self,
        entity_id: Uuid,
    ) -> Result<EntityWithProperties, StoreError> {
        let entity = fetch_entity(&mut *self.tx, entity_id).await?;
        let properties = load_properties(&mut *self.tx, entity_id).await?;
        Ok(EntityWithProperties::new(entity, properties))
    }

    async fn get_entity_by_name(
        &mut self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        name: &str,
    ) -> Result<EntityWithProperties, StoreError> {
        fetch_entity_by_name(&mut *self.tx, project_id, provider_id, entity_type, name).await
    }

    async fn save_properties(
        &mut self,
        entity_id: Uuid,
        properties: &Properties,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM properties WHERE entity_id = $1")
            .bind(entity_id)
            .execute(&mut *self.tx)
            .await?;
        for (key, value) in properties.to_wire() {
            sqlx::query(
                "INSERT INTO properties (entity_id, key, value, updated_at) VALUES ($1, $2, $3, NOW())",
            )
            .bind(entity_id)
            .bind(&key)
            .bind(Json(value))
            .execute(&mut *self.tx)
            .await?;
        }
        debug!(entity_id = %entity_id, count = properties.len(), "saved properties");
        Ok(())
    }

    async fn delete_entity(&mut self, entity_id: Uuid) -> Result<(), StoreError> {
        let deleted = sqlx::query("DELETE FROM entity_instances WHERE id = $1")
            .bind(entity_id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(not_found("entity", entity_id));
        }
        Ok(())
    }

    async fn create_rule_type(&mut self, rule_type: &RuleType) -> Result<RuleType, StoreError> {
        let mut created = rule_type.clone();
        let id = *created.id.get_or_insert_with(Uuid::new_v4);
        sqlx::query(
            r#"
            INSERT INTO rule_types (id, name, project_id, subscription_id, document)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&created.name)
        .bind(rule_type_project(&created)?)
        .bind(created.subscription_id)
        .bind(Json(&created))
        .execute(&mut *self.tx)
        .await?;
        Ok(created)
    }

    async fn update_rule_type(&mut self, rule_type: &RuleType) -> Result<RuleType, StoreError> {
        let id = rule_type
            .id
            .ok_or_else(|| StoreError::NotFound(format!("rule type {} has no id", rule_type.name)))?;
        let updated = sqlx::query(
            r#"
            UPDATE rule_types SET name = $2, subscription_id = $3, document = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&rule_type.name)
        .bind(rule_type.subscription_id)
        .bind(Json(rule_type))
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(not_found("rule type", id));
        }
        Ok(rule_type.clone())
    }

    async fn create_profile(&mut self, profile: &Profile) -> Result<Profile, StoreError> {
        let mut created = profile.clone();
        let id = *created.id.get_or_insert_with(Uuid::new_v4);
        sqlx::query(
            r#"
            INSERT INTO profiles (id, name, display_name, project_id, remediate, alert, labels,
                                  subscription_id, selectors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(&created.name)
        .bind(&created.display_name)
        .bind(profile_project(&created)?)
        .bind(created.remediate.map(|state| state.as_str()))
        .bind(created.alert.map(|state| state.as_str()))
        .bind(&created.labels)
        .bind(created.subscription_id)
        .bind(Json(&created.selection))
        .execute(&mut *self.tx)
        .await?;
        self.replace_rulesets(id, &created).await?;
        Ok(created)
    }

    async fn update_profile(&mut self, profile: &Profile) -> Result<Profile, StoreError> {
        let id = profile
            .id
            .ok_or_else(|| StoreError::NotFound(format!("profile {} has no id", profile.name)))?;
        let updated = sqlx::query(
            r#"
            UPDATE profiles
            SET name = $2, display_name = $3, remediate = $4, alert = $5, selectors = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&profile.name)
        .bind(&profile.display_name)
        .bind(profile.remediate.map(|state| state.as_str()))
        .bind(profile.alert.map(|state| state.as_str()))
        .bind(Json(&profile.selection))
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(not_found("profile", id));
        }
        self.replace_rulesets(id, profile).await?;
        Ok(profile.clone())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
