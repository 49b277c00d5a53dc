//! Vigil: continuous policy evaluation for software supply-chain entities.
//!
//! Profiles group rules; rule types describe how to ingest and judge an entity.
//! Whenever an entity changes, [`Engine`] re-evaluates every applicable rule, records
//! the result and runs the configured remediation and alert actions.
//!
//! The member crates are re-exported:
//!
//! * [`core`]: configuration, errors, tracing setup and the Postgres pool
//! * [`protocol`]: entities, property bags and bus payloads
//! * [`rules`]: profiles, rule types and the rule-type engine
//! * [`engine`]: stores, executor, handlers, refresh strategies and services

use std::sync::Arc;

use tracing::info;

pub use vigil_core as core;
pub use vigil_engine as engine;
pub use vigil_protocol as protocol;
pub use vigil_rules as rules;

use vigil_core::config::CoreConfig;
use vigil_core::db::DatabasePool;
use vigil_core::VigilError;
use vigil_engine::{
    AddOriginatingEntity, BusError, CancelToken, ChannelBus, DeleteOriginatingEntity,
    EngineConfig, EntityEvaluateHandler, EntityRefresher, Executor, PgStore, ProviderManager,
    RefreshEntity, RefreshEntityAndEvaluateHandler, RefreshStrategy, Store,
};
use vigil_rules::EngineRegistry;

/// Connects to Postgres and applies pending migrations.
pub async fn connect_postgres(config: &CoreConfig) -> Result<PgStore, VigilError> {
    let pool = DatabasePool::connect(config).await?;
    PgStore::from_pool(pool)
        .await
        .map_err(|err| VigilError::Database(err.to_string()))
}

/// A wired evaluation pipeline on an in-process bus.
///
/// Subscribes the evaluate handler and the refresh handlers to their topics. Call
/// [`Engine::run`] to route messages and [`Engine::shutdown`] to stop routing, cancel
/// in-flight evaluations and wait for them to exit.
pub struct Engine {
    bus: Arc<ChannelBus>,
    evaluate: Arc<EntityEvaluateHandler>,
    shutdown: CancelToken,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        providers: Arc<dyn ProviderManager>,
        config: EngineConfig,
    ) -> Self {
        Self::with_registry(store, providers, config, EngineRegistry::default())
    }

    pub fn with_registry(
        store: Arc<dyn Store>,
        providers: Arc<dyn ProviderManager>,
        config: EngineConfig,
        registry: EngineRegistry,
    ) -> Self {
        let bus = Arc::new(ChannelBus::new());
        let shutdown = CancelToken::new();
        let executor = Executor::new(store.clone(), providers.clone(), bus.clone(), &config)
            .with_registry(registry);
        let evaluate = Arc::new(EntityEvaluateHandler::new(
            Arc::new(executor),
            &config,
            shutdown.clone(),
        ));
        bus.subscribe(config.evaluate_topic.clone(), evaluate.clone());

        let refresher = EntityRefresher::new(store.clone(), providers);
        let refresh: Arc<dyn RefreshStrategy> = Arc::new(RefreshEntity::new(refresher.clone()));
        let add_originating: Arc<dyn RefreshStrategy> =
            Arc::new(AddOriginatingEntity(refresher.clone()));
        let delete_originating: Arc<dyn RefreshStrategy> =
            Arc::new(DeleteOriginatingEntity(refresher));
        let refresh_routes = [
            (config.refresh_topic.as_str(), refresh),
            (config.add_originating_topic.as_str(), add_originating),
            (config.delete_originating_topic.as_str(), delete_originating),
        ];
        for (topic, strategy) in refresh_routes {
            bus.subscribe(
                topic,
                Arc::new(RefreshEntityAndEvaluateHandler::new(
                    strategy,
                    store.clone(),
                    bus.clone(),
                    &config,
                )),
            );
        }

        Self {
            bus,
            evaluate,
            shutdown,
            config,
        }
    }

    pub fn bus(&self) -> &Arc<ChannelBus> {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Routes bus messages until [`Engine::shutdown`] is called.
    pub async fn run(&self) -> Result<(), BusError> {
        self.bus.run(self.shutdown.clone()).await
    }

    /// Stops routing and cancels in-flight evaluations, then waits for them to exit.
    pub async fn shutdown(&self) {
        info!(in_flight = self.evaluate.in_flight(), "shutting down evaluation engine");
        self.shutdown.cancel();
        self.evaluate.wait().await;
    }

    pub fn in_flight(&self) -> usize {
        self.evaluate.in_flight()
    }

    /// Waits until no evaluation is in flight.
    pub async fn drain(&self) {
        self.evaluate.wait().await;
    }
}
