use std::env;
use std::time::Duration;

use crate::errors::{ConfigError, VigilError};

/// Runtime environment used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }
}

/// Global configuration shared across the Vigil services.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub environment: Environment,
    pub node_name: String,
    pub max_db_connections: u32,
}

impl CoreConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_prefix("VIGIL_")
    }

    /// Loads configuration from env vars prefixed with the provided value (e.g. `VIGIL_`).
    ///
    /// `DATABASE_URL` without a prefix is accepted as a fallback for the
    /// database connection string.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let key = |suffix: &str| format!("{}{}", prefix, suffix);

        let db_key = key("DATABASE_URL");
        let database_url = env::var(&db_key)
            .or_else(|_| env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar(db_key.clone()))?;

        let environment = env::var(key("ENV"))
            .map(|raw| Environment::parse(&raw))
            .unwrap_or_default();

        let node_name = env::var(key("NODE_NAME")).unwrap_or_else(|_| "vigil-node".to_string());
        let max_db_connections = env_parse(&key("MAX_DB_CONNECTIONS"), 5u32)?;

        Ok(Self {
            database_url,
            environment,
            node_name,
            max_db_connections,
        })
    }

    /// Returns the Postgres URL.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Whether the service is running in production.
    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }
}

/// Helper that loads config and converts to the canonical Vigil error type.
pub fn load_core_config() -> Result<CoreConfig, VigilError> {
    Ok(CoreConfig::from_env()?)
}

/// Reads `key` from the environment, falling back to `default` when unset.
pub fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parses `key` from the environment. Unset or blank values yield `default`;
/// unparsable values are an error rather than a silent fallback.
pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                })
        }
        _ => Ok(default),
    }
}

/// Reads a duration expressed in whole seconds.
pub fn env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}
