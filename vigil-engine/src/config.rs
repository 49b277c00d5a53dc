use std::time::Duration;

use vigil_core::config::{env_duration_secs, env_string};
use vigil_core::errors::ConfigError;
use vigil_protocol::{
    TOPIC_ADD_ORIGINATING, TOPIC_DELETE_ORIGINATING, TOPIC_ENTITY_EVALUATE, TOPIC_ENTITY_FLUSH,
    TOPIC_REFRESH_AND_EVALUATE,
};

const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_ARTIFACT_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_LEASE_THRESHOLD: Duration = Duration::from_secs(600);

/// Runtime settings of the evaluation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on one entity evaluation.
    pub execution_timeout: Duration,
    /// Delay before evaluating an artifact so its signature can appear upstream.
    pub artifact_wait: Duration,
    /// Age after which another execution may take over an entity lease.
    pub lease_threshold: Duration,
    pub evaluate_topic: String,
    pub flush_topic: String,
    pub refresh_topic: String,
    pub add_originating_topic: String,
    pub delete_originating_topic: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            artifact_wait: DEFAULT_ARTIFACT_WAIT,
            lease_threshold: DEFAULT_LEASE_THRESHOLD,
            evaluate_topic: TOPIC_ENTITY_EVALUATE.to_string(),
            flush_topic: TOPIC_ENTITY_FLUSH.to_string(),
            refresh_topic: TOPIC_REFRESH_AND_EVALUATE.to_string(),
            add_originating_topic: TOPIC_ADD_ORIGINATING.to_string(),
            delete_originating_topic: TOPIC_DELETE_ORIGINATING.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(Self {
            execution_timeout: env_duration_secs(
                "VIGIL_EXECUTION_TIMEOUT_SECS",
                DEFAULT_EXECUTION_TIMEOUT,
            )?,
            artifact_wait: env_duration_secs("VIGIL_ARTIFACT_WAIT_SECS", DEFAULT_ARTIFACT_WAIT)?,
            lease_threshold: env_duration_secs(
                "VIGIL_LEASE_THRESHOLD_SECS",
                DEFAULT_LEASE_THRESHOLD,
            )?,
            evaluate_topic: env_string("VIGIL_EVAL_TOPIC", TOPIC_ENTITY_EVALUATE),
            flush_topic: env_string("VIGIL_FLUSH_TOPIC", TOPIC_ENTITY_FLUSH),
            refresh_topic: env_string("VIGIL_REFRESH_TOPIC", TOPIC_REFRESH_AND_EVALUATE),
            add_originating_topic: env_string("VIGIL_ORIGINATING_TOPIC", TOPIC_ADD_ORIGINATING),
            delete_originating_topic: env_string("VIGIL_DELETE_TOPIC", TOPIC_DELETE_ORIGINATING),
        })
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_artifact_wait(mut self, wait: Duration) -> Self {
        self.artifact_wait = wait;
        self
    }
}
