use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{action_config, dry_run, ActionContext, Remediator};
use crate::error::{ActionError, EngineError};
use crate::ingest::check_endpoint;
use crate::outcome::ActionOutput;
use crate::profile::ActionState;
use crate::provider::{Provider, RestRequest};
use crate::rule_type::ActionSpec;
use crate::template;

#[derive(Debug, Clone, Default, Deserialize)]
struct RestRemediateConfig {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    body: Option<Value>,
}

/// Fixes a failing rule by calling the provider's REST API.
pub struct RestRemediator {
    method: String,
    endpoint: String,
    body: Option<Value>,
    provider: Arc<dyn Provider>,
}

impl RestRemediator {
    pub fn new(spec: &ActionSpec, provider: Arc<dyn Provider>) -> Result<Self, EngineError> {
        let config: RestRemediateConfig = action_config(spec, "rest remediation")?;
        let method = config
            .method
            .as_deref()
            .unwrap_or("PATCH")
            .to_ascii_uppercase();
        check_endpoint("rest remediation", &method, &config.endpoint)?;
        Ok(Self {
            method,
            endpoint: config.endpoint,
            body: config.body,
            provider,
        })
    }
}

#[async_trait]
impl Remediator for RestRemediator {
    fn kind(&self) -> &str {
        super::REST
    }

    async fn remediate(
        &self,
        state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutput, ActionError> {
        let root = ctx.template_root();
        let url = template::render_str(&self.endpoint, &root).map_err(ActionError::Error)?;
        let body = self
            .body
            .as_ref()
            .map(|body| template::render_value(body, &root))
            .transpose()
            .map_err(ActionError::Error)?;

        if state == ActionState::DryRun {
            return Err(dry_run(&self.method, &url, &body));
        }
        let client = self
            .provider
            .as_rest()
            .ok_or_else(|| ActionError::NotAvailable("provider has no REST client".into()))?;

        info!(method = %self.method, url = %url, entity_id = %ctx.entity.id(), "remediating");
        let response = client
            .request(RestRequest {
                method: self.method.clone(),
                url: url.clone(),
                body,
            })
            .await
            .map_err(|err| ActionError::Error(err.to_string()))?;
        if !response.is_success() {
            return Err(ActionError::Failed(format!(
                "{} {url} returned {}",
                self.method, response.status
            )));
        }
        Ok(ActionOutput {
            details: json!({"method": self.method, "url": url, "status": response.status}),
            metadata: response.json().unwrap_or(Value::Null),
        })
    }
}
