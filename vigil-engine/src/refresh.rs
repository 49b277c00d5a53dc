//! Entity refresh strategies and the handler that evaluates refreshed entities.
//!
//! A strategy locates or mutates one entity from a refresh request: by its upstream
//! properties, by its id, or as the child of an originating entity. The handler then
//! takes the entity's lease and publishes an entity-evaluate message for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_protocol::{
    EntityInfoWrapper, EntityInstance, EntityRefreshRequest, EntityType, EntityWithProperties,
    Message, Properties,
};
use vigil_rules::{Provider, ProviderError};

use crate::bus::{MessageHandler, Publisher};
use crate::config::EngineConfig;
use crate::error::{HandlerError, StoreError, StrategyError};
use crate::providers::ProviderManager;
use crate::store::{with_transaction, Store};

#[async_trait]
pub trait RefreshStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// The entity to evaluate next, or `None` when there is nothing left to evaluate.
    async fn refresh(
        &self,
        request: &EntityRefreshRequest,
    ) -> Result<Option<EntityWithProperties>, StrategyError>;
}

/// Store and provider access shared by the strategies.
#[derive(Clone)]
pub struct EntityRefresher {
    store: Arc<dyn Store>,
    providers: Arc<dyn ProviderManager>,
}

impl EntityRefresher {
    pub fn new(store: Arc<dyn Store>, providers: Arc<dyn ProviderManager>) -> Self {
        Self { store, providers }
    }

    async fn provider(&self, provider_id: Uuid) -> Result<Arc<dyn Provider>, StrategyError> {
        Ok(self.providers.instantiate_from_id(provider_id).await?)
    }

    /// Fetches the full upstream property set and stores it under the entity's name,
    /// reusing the stored id when an entity of that name already exists.
    async fn upsert_from_upstream(
        &self,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        lookup: &Properties,
        originated_from: Option<Uuid>,
    ) -> Result<EntityWithProperties, StrategyError> {
        let provider = self.provider(provider_id).await?;
        let fetched = provider
            .retrieve_all_properties(project_id, provider_id, lookup, entity_type)
            .await?;
        let name = provider.get_entity_name(entity_type, &fetched)?;
        let candidate = EntityInstance {
            id: Uuid::new_v4(),
            entity_type,
            name,
            project_id,
            provider_id,
            originated_from,
        };

        match self.store_by_name(candidate.clone(), fetched.clone()).await {
            Err(StrategyError::Store(StoreError::AlreadyExists(reason))) => {
                debug!(name = %candidate.name, reason = %reason, "entity created concurrently, re-reading");
                self.store_by_name(candidate, fetched).await
            }
            other => other,
        }
    }

    /// Looks the entity up by name, merges the fetched properties into it and saves
    /// both in one transaction.
    async fn store_by_name(
        &self,
        candidate: EntityInstance,
        fetched: Properties,
    ) -> Result<EntityWithProperties, StrategyError> {
        with_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                if let Some(parent_id) = candidate.originated_from {
                    tx.get_entity_by_id(parent_id).await?;
                }
                let properties = match tx
                    .get_entity_by_name(
                        candidate.project_id,
                        candidate.provider_id,
                        candidate.entity_type,
                        &candidate.name,
                    )
                    .await
                {
                    Ok(existing) => existing.properties.merge(&fetched),
                    Err(StoreError::NotFound(_)) => fetched,
                    Err(err) => return Err(err.into()),
                };
                let stored = tx.upsert_entity_by_name(&candidate).await?;
                tx.save_properties(stored.id, &properties).await?;
                Ok::<_, StrategyError>(EntityWithProperties::new(stored, properties))
            })
        })
        .await
    }
}

/// Locates an entity from upstream identifying properties, creating it on first sight.
pub struct RefreshByUpstreamId(pub EntityRefresher);

#[async_trait]
impl RefreshStrategy for RefreshByUpstreamId {
    fn name(&self) -> &'static str {
        "refresh-by-upstream-id"
    }

    async fn refresh(
        &self,
        request: &EntityRefreshRequest,
    ) -> Result<Option<EntityWithProperties>, StrategyError> {
        let lookup = request
            .upstream_properties
            .as_ref()
            .ok_or(StrategyError::MissingField("upstream_properties"))?;
        let entity = self
            .0
            .upsert_from_upstream(
                request.project_id,
                request.provider_id,
                request.entity_type,
                lookup,
                request.originating_entity_id,
            )
            .await?;
        Ok(Some(entity))
    }
}

/// Re-fetches the upstream properties of a stored entity.
pub struct RefreshById(pub EntityRefresher);

#[async_trait]
impl RefreshStrategy for RefreshById {
    fn name(&self) -> &'static str {
        "refresh-by-id"
    }

    async fn refresh(
        &self,
        request: &EntityRefreshRequest,
    ) -> Result<Option<EntityWithProperties>, StrategyError> {
        let entity_id = request
            .entity_id
            .ok_or(StrategyError::MissingField("entity_id"))?;
        let stored = self.0.store.get_entity_by_id(entity_id).await?;
        let provider = self.0.provider(stored.entity.provider_id).await?;
        let fetched = provider
            .retrieve_all_properties(
                stored.entity.project_id,
                stored.entity.provider_id,
                &stored.properties,
                stored.entity.entity_type,
            )
            .await?;
        let refreshed = with_transaction(self.0.store.as_ref(), move |tx| {
            Box::pin(async move {
                let current = tx.get_entity_by_id(entity_id).await?;
                let properties = current.properties.merge(&fetched);
                tx.save_properties(entity_id, &properties).await?;
                Ok::<_, StrategyError>(EntityWithProperties::new(current.entity, properties))
            })
        })
        .await?;
        Ok(Some(refreshed))
    }
}

/// Registers a child entity (e.g. a pull request) under its originating entity.
pub struct AddOriginatingEntity(pub EntityRefresher);

#[async_trait]
impl RefreshStrategy for AddOriginatingEntity {
    fn name(&self) -> &'static str {
        "add-originating-entity"
    }

    async fn refresh(
        &self,
        request: &EntityRefreshRequest,
    ) -> Result<Option<EntityWithProperties>, StrategyError> {
        let parent_id = request
            .originating_entity_id
            .ok_or(StrategyError::MissingField("originating_entity_id"))?;
        let lookup = request
            .upstream_properties
            .as_ref()
            .ok_or(StrategyError::MissingField("upstream_properties"))?;
        let parent = self.0.store.get_entity_by_id(parent_id).await?;
        let child = self
            .0
            .upsert_from_upstream(
                parent.entity.project_id,
                parent.entity.provider_id,
                request.entity_type,
                lookup,
                Some(parent.id()),
            )
            .await?;
        debug!(parent_id = %parent.id(), entity_id = %child.id(), "originating entity linked");
        Ok(Some(child))
    }
}

/// Removes a child entity of an originating entity. Nothing is evaluated afterwards.
pub struct DeleteOriginatingEntity(pub EntityRefresher);

#[async_trait]
impl RefreshStrategy for DeleteOriginatingEntity {
    fn name(&self) -> &'static str {
        "delete-originating-entity"
    }

    async fn refresh(
        &self,
        request: &EntityRefreshRequest,
    ) -> Result<Option<EntityWithProperties>, StrategyError> {
        let parent_id = request
            .originating_entity_id
            .ok_or(StrategyError::MissingField("originating_entity_id"))?;
        let lookup = request
            .upstream_properties
            .as_ref()
            .ok_or(StrategyError::MissingField("upstream_properties"))?;
        let parent = self.0.store.get_entity_by_id(parent_id).await?;
        let provider = self.0.provider(parent.entity.provider_id).await?;
        let name = provider.get_entity_name(request.entity_type, lookup)?;

        let (project_id, provider_id) = (parent.entity.project_id, parent.entity.provider_id);
        let entity_type = request.entity_type;
        let deleted = with_transaction(self.0.store.as_ref(), move |tx| {
            Box::pin(async move {
                let child = match tx
                    .get_entity_by_name(project_id, provider_id, entity_type, &name)
                    .await
                {
                    Ok(child) => child,
                    Err(StoreError::NotFound(_)) => {
                        debug!(parent_id = %parent_id, name = %name, "child entity already gone");
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                };
                if child.entity.originated_from != Some(parent_id) {
                    warn!(parent_id = %parent_id, entity_id = %child.id(), "entity does not originate from the given parent, not deleting");
                    return Ok(None);
                }
                tx.delete_entity(child.id()).await?;
                Ok::<_, StrategyError>(Some(child.id()))
            })
        })
        .await?;
        let Some(child_id) = deleted else {
            return Ok(None);
        };
        info!(parent_id = %parent_id, entity_id = %child_id, "originating entity deleted");
        Ok(None)
    }
}

/// Picks a strategy from the shape of the request: an entity id refreshes by id, an
/// originating entity adds a child, upstream properties alone refresh by upstream id.
pub struct RefreshEntity {
    by_id: RefreshById,
    by_upstream_id: RefreshByUpstreamId,
    add_originating: AddOriginatingEntity,
}

impl RefreshEntity {
    pub fn new(refresher: EntityRefresher) -> Self {
        Self {
            by_id: RefreshById(refresher.clone()),
            by_upstream_id: RefreshByUpstreamId(refresher.clone()),
            add_originating: AddOriginatingEntity(refresher),
        }
    }
}

#[async_trait]
impl RefreshStrategy for RefreshEntity {
    fn name(&self) -> &'static str {
        "refresh-entity"
    }

    async fn refresh(
        &self,
        request: &EntityRefreshRequest,
    ) -> Result<Option<EntityWithProperties>, StrategyError> {
        if request.entity_id.is_some() {
            self.by_id.refresh(request).await
        } else if request.originating_entity_id.is_some() {
            self.add_originating.refresh(request).await
        } else if request.upstream_properties.is_some() {
            self.by_upstream_id.refresh(request).await
        } else {
            Err(StrategyError::Unsupported)
        }
    }
}

/// Runs a refresh strategy, leases the resulting entity and queues its evaluation.
pub struct RefreshEntityAndEvaluateHandler {
    strategy: Arc<dyn RefreshStrategy>,
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    evaluate_topic: String,
    lease_threshold: Duration,
}

impl RefreshEntityAndEvaluateHandler {
    pub fn new(
        strategy: Arc<dyn RefreshStrategy>,
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            strategy,
            store,
            publisher,
            evaluate_topic: config.evaluate_topic.clone(),
            lease_threshold: config.lease_threshold,
        }
    }
}

#[async_trait]
impl MessageHandler for RefreshEntityAndEvaluateHandler {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let request = EntityRefreshRequest::from_message(&message)?;
        let strategy = self.strategy.name();

        let entity = match self.strategy.refresh(&request).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                debug!(strategy, "nothing to evaluate after refresh");
                return Ok(());
            }
            Err(StrategyError::Provider(ProviderError::NotFound(what))) => {
                warn!(strategy, what = %what, "entity not found upstream, dropping refresh");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let execution_id = Uuid::new_v4();
        match self
            .store
            .lock_if_threshold_not_exceeded(entity.id(), execution_id, self.lease_threshold)
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict(reason)) => {
                info!(strategy, entity_id = %entity.id(), reason = %reason, "entity is being evaluated by another execution, skipping");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let evaluate = EntityInfoWrapper::from_entity(&entity)
            .with_execution_id(execution_id)
            .to_message()?;
        self.publisher.publish(&self.evaluate_topic, evaluate).await?;
        debug!(strategy, entity_id = %entity.id(), execution_id = %execution_id, "entity queued for evaluation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use test_case::test_case;

    fn refresher(fixture: &Fixture) -> EntityRefresher {
        EntityRefresher::new(
            Arc::new(fixture.store.clone()),
            Arc::new(fixture.providers.clone()),
        )
    }

    fn upstream(fixture: &Fixture, upstream_id: &str, name: &str, extra: (&str, i64)) {
        fixture.provider.upstream.lock().push(
            Properties::new([
                ("upstream_id", upstream_id.into()),
                ("name", name.into()),
                (extra.0, vigil_protocol::PropertyValue::from(extra.1)),
            ])
            .unwrap(),
        );
    }

    fn lookup(upstream_id: &str) -> Properties {
        Properties::new([("upstream_id", upstream_id)]).unwrap()
    }

    fn request(fixture: &Fixture, entity_type: EntityType) -> EntityRefreshRequest {
        EntityRefreshRequest {
            entity_type,
            project_id: fixture.project_id,
            provider_id: fixture.provider_id,
            entity_id: None,
            upstream_properties: None,
            originating_entity_id: None,
        }
    }

    #[tokio::test]
    async fn upstream_refresh_creates_then_updates() {
        let fixture = Fixture::new();
        upstream(&fixture, "42", "foo/bar", ("stars", 1));
        let strategy = RefreshByUpstreamId(refresher(&fixture));
        let mut req = request(&fixture, EntityType::Repository);
        req.upstream_properties = Some(lookup("42"));

        let created = strategy.refresh(&req).await.unwrap().unwrap();
        assert_eq!(created.entity.name, "foo/bar");
        fixture.provider.upstream.lock().clear();
        upstream(&fixture, "42", "foo/bar", ("stars", 2));
        let updated = strategy.refresh(&req).await.unwrap().unwrap();

        assert_eq!(updated.id(), created.id());
        let stored = fixture.store.get_properties(created.id()).await.unwrap();
        assert_eq!(stored.get_int64("stars"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_sightings_share_one_entity() {
        let fixture = Fixture::new();
        upstream(&fixture, "42", "foo/test", ("stars", 1));
        let mut req = request(&fixture, EntityType::Repository);
        req.upstream_properties = Some(lookup("42"));

        let refreshes = (0..8).map(|_| {
            let strategy = RefreshByUpstreamId(refresher(&fixture));
            let req = req.clone();
            tokio::spawn(async move { strategy.refresh(&req).await })
        });
        let mut ids = Vec::new();
        for handle in refreshes.collect::<Vec<_>>() {
            ids.push(handle.await.unwrap().unwrap().unwrap().id());
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        let stored = fixture
            .store
            .get_entity_by_name(
                fixture.project_id,
                fixture.provider_id,
                EntityType::Repository,
                "foo/test",
            )
            .await
            .unwrap();
        assert_eq!(stored.id(), ids[0]);
        assert_eq!(stored.properties.get_int64("stars"), 1);
    }

    #[tokio::test]
    async fn refresh_by_id_merges_upstream_properties() {
        let fixture = Fixture::new();
        let entity = fixture.repository("foo/test");
        upstream(&fixture, "1", "foo/test", ("stars", 9));
        let mut req = request(&fixture, EntityType::Repository);
        req.entity_id = Some(entity.id());

        let refreshed = RefreshById(refresher(&fixture))
            .refresh(&req)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.properties.get_int64("stars"), 9);
        assert_eq!(refreshed.properties.get_string("upstream_id"), "1");
    }

    #[tokio::test]
    async fn originating_entities_are_linked_and_removed() {
        let fixture = Fixture::new();
        let repo = fixture.repository("foo/test");
        upstream(&fixture, "pr-7", "foo/test/7", ("number", 7));
        let mut req = request(&fixture, EntityType::PullRequest);
        req.originating_entity_id = Some(repo.id());
        req.upstream_properties = Some(lookup("pr-7"));

        let pr = AddOriginatingEntity(refresher(&fixture))
            .refresh(&req)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pr.entity.originated_from, Some(repo.id()));
        assert_eq!(pr.entity.project_id, fixture.project_id);

        req.upstream_properties = Some(Properties::new([("name", "foo/test/7")]).unwrap());
        let deleter = DeleteOriginatingEntity(refresher(&fixture));
        assert!(deleter.refresh(&req).await.unwrap().is_none());
        assert!(matches!(
            fixture.store.get_entity_by_id(pr.id()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(deleter.refresh(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_parent_is_not_found() {
        let fixture = Fixture::new();
        let mut req = request(&fixture, EntityType::PullRequest);
        req.originating_entity_id = Some(Uuid::new_v4());
        req.upstream_properties = Some(lookup("pr-7"));
        let err = AddOriginatingEntity(refresher(&fixture))
            .refresh(&req)
            .await
            .unwrap_err();
        assert!(matches!(err, StrategyError::Store(StoreError::NotFound(_))));
    }

    #[test_case(false, false, false, "unsupported" ; "empty request")]
    #[test_case(true, false, false, "by-id" ; "entity id wins")]
    #[test_case(false, true, true, "add-originating" ; "originating entity")]
    #[test_case(false, false, true, "by-upstream-id" ; "upstream properties")]
    #[tokio::test]
    async fn composite_dispatches_on_request_shape(
        with_id: bool,
        with_parent: bool,
        with_upstream: bool,
        expected: &str,
    ) {
        let fixture = Fixture::new();
        let repo = fixture.repository("foo/test");
        upstream(&fixture, "1", "foo/test", ("stars", 3));
        upstream(&fixture, "pr-1", "foo/test/1", ("number", 1));
        let mut req = request(&fixture, EntityType::Repository);
        if with_id {
            req.entity_id = Some(repo.id());
        }
        if with_parent {
            req.entity_type = EntityType::PullRequest;
            req.originating_entity_id = Some(repo.id());
        }
        if with_upstream {
            req.upstream_properties = Some(lookup(if with_parent { "pr-1" } else { "1" }));
        }

        let outcome = match RefreshEntity::new(refresher(&fixture)).refresh(&req).await {
            Err(StrategyError::Unsupported) => "unsupported",
            Ok(Some(entity)) if entity.entity.originated_from.is_some() => "add-originating",
            Ok(Some(entity)) if with_id && entity.id() == repo.id() => "by-id",
            Ok(Some(_)) => "by-upstream-id",
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(outcome, expected);
    }

    #[tokio::test]
    async fn handler_leases_and_queues_evaluation() {
        let fixture = Fixture::new();
        let entity = fixture.repository("foo/test");
        upstream(&fixture, "1", "foo/test", ("stars", 3));
        let store: Arc<dyn Store> = Arc::new(fixture.store.clone());
        let handler = RefreshEntityAndEvaluateHandler::new(
            Arc::new(RefreshEntity::new(refresher(&fixture))),
            store,
            fixture.bus.clone(),
            &fixture.config,
        );
        let mut req = request(&fixture, EntityType::Repository);
        req.entity_id = Some(entity.id());

        handler.handle(req.to_message().unwrap()).await.unwrap();
        let queued = fixture.bus.published(&fixture.config.evaluate_topic);
        assert_eq!(queued.len(), 1);
        let wrapper = EntityInfoWrapper::from_message(&queued[0]).unwrap();
        let lease = fixture.store.get_lease(entity.id()).await.unwrap().unwrap();
        assert_eq!(wrapper.execution_id, Some(lease.locked_by));
        assert_eq!(wrapper.properties.get_int64("stars"), 3);

        handler.handle(req.to_message().unwrap()).await.unwrap();
        assert_eq!(fixture.bus.published(&fixture.config.evaluate_topic).len(), 1);
    }

    #[tokio::test]
    async fn handler_drops_entities_missing_upstream() {
        let fixture = Fixture::new();
        let handler = RefreshEntityAndEvaluateHandler::new(
            Arc::new(RefreshByUpstreamId(refresher(&fixture))),
            Arc::new(fixture.store.clone()),
            fixture.bus.clone(),
            &fixture.config,
        );
        let mut req = request(&fixture, EntityType::Repository);
        req.upstream_properties = Some(lookup("404"));

        handler.handle(req.to_message().unwrap()).await.unwrap();
        assert!(fixture.bus.published(&fixture.config.evaluate_topic).is_empty());
    }
}
