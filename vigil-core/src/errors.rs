use std::io;

use thiserror::Error;

/// Result type used across the Vigil core crate.
pub type Result<T> = std::result::Result<T, VigilError>;

/// Canonical error representation shared by all Vigil crates.
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("{0}")]
    General(String),
}

impl From<serde_json::Error> for VigilError {
    fn from(err: serde_json::Error) -> Self {
        VigilError::Deserialization(err.to_string())
    }
}

impl From<sqlx::Error> for VigilError {
    fn from(err: sqlx::Error) -> Self {
        VigilError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for VigilError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        VigilError::Migration(err.to_string())
    }
}

impl From<anyhow::Error> for VigilError {
    fn from(err: anyhow::Error) -> Self {
        VigilError::General(err.to_string())
    }
}

/// Dedicated configuration error used by the configuration loaders.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for environment variable {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("internal configuration error: {0}")]
    Internal(String),
}

impl From<ConfigError> for VigilError {
    fn from(value: ConfigError) -> Self {
        VigilError::Config(value.to_string())
    }
}
