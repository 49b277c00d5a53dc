use thiserror::Error;
use uuid::Uuid;
use vigil_protocol::{PropertyError, ProtocolError};
use vigil_rules::{ProviderError, RuleTypeError, ValidationError};

/// Errors raised by the persistence layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("failed to decode stored value: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::AlreadyExists(db.message().to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

impl From<PropertyError> for StoreError {
    fn from(err: PropertyError) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// Errors raised by the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,
    #[error("no subscriber for topic {0}")]
    NoSubscriber(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors that fail a whole entity evaluation.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("message carries no execution id")]
    MissingExecutionId,
    #[error("provider {provider_id} unavailable: {source}")]
    Provider {
        provider_id: Uuid,
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("evaluation cancelled")]
    Cancelled,
}

/// Errors raised while handling a bus message.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by entity refresh strategies.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("refresh request is missing {0}")]
    MissingField(&'static str),
    #[error("no strategy handles this refresh request")]
    Unsupported,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Property(#[from] PropertyError),
}

/// Errors surfaced to rule-type and profile API callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    RuleType(#[from] RuleTypeError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("profile already exists: {0}")]
    ProfileAlreadyExists(String),
}
