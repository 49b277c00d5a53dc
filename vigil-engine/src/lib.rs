//! Vigil engine: turns entity events into recorded rule evaluations.
//!
//! Messages arrive on the bus, the handlers dispatch them to the [`Executor`], which
//! walks the project hierarchy, evaluates every applicable rule through the rule-type
//! engines and persists the outcome through the [`Store`].

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod handler;
pub mod lease;
pub mod providers;
pub mod refresh;
pub mod service;
pub mod status;
pub mod store;

#[cfg(test)]
mod testing;

pub use bus::{ChannelBus, MessageHandler, Publisher};
pub use config::EngineConfig;
pub use context::{CancelToken, WaitGroup, WaitGuard};
pub use error::{BusError, ExecutorError, HandlerError, ServiceError, StoreError, StrategyError};
pub use executor::{EvaluationSummary, Executor, RuleSummary};
pub use handler::EntityEvaluateHandler;
pub use lease::LeaseCoordinator;
pub use providers::{ProviderManager, StaticProviderManager};
pub use refresh::{
    AddOriginatingEntity, DeleteOriginatingEntity, EntityRefresher, RefreshById,
    RefreshByUpstreamId, RefreshEntity, RefreshEntityAndEvaluateHandler, RefreshStrategy,
};
pub use service::{ProfileService, RuleTypeService};
pub use status::StatusGateway;
pub use store::{
    with_transaction, EvaluationRecord, Lease, MemoryStore, PgStore, Project, ProviderRecord,
    RuleEvaluationKey, Store, StoreTx,
};
