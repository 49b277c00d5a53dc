use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{action_config, dry_run, ActionContext, Alerter};
use crate::error::{ActionError, EngineError};
use crate::ingest::check_endpoint;
use crate::outcome::{AlertOutput, AlertStatus};
use crate::profile::ActionState;
use crate::provider::{Provider, RestRequest};
use crate::rule_type::ActionSpec;
use crate::template;

#[derive(Debug, Clone, Default, Deserialize)]
struct Call {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    body: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RestAlertConfig {
    #[serde(flatten)]
    open: Call,
    #[serde(default)]
    close: Option<Call>,
}

#[derive(Debug, Clone)]
struct Request {
    method: String,
    endpoint: String,
    body: Option<Value>,
}

impl Request {
    fn from_call(call: Call, default_method: &str) -> Result<Self, EngineError> {
        let method = call
            .method
            .as_deref()
            .unwrap_or(default_method)
            .to_ascii_uppercase();
        check_endpoint("rest alert", &method, &call.endpoint)?;
        Ok(Self {
            method,
            endpoint: call.endpoint,
            body: call.body,
        })
    }
}

/// Opens an upstream alert (e.g. an issue or advisory) on failure and closes it on recovery.
pub struct RestAlerter {
    open: Request,
    close: Option<Request>,
    provider: Arc<dyn Provider>,
}

impl RestAlerter {
    pub fn new(spec: &ActionSpec, provider: Arc<dyn Provider>) -> Result<Self, EngineError> {
        let config: RestAlertConfig = action_config(spec, "rest alert")?;
        Ok(Self {
            open: Request::from_call(config.open, "POST")?,
            close: config
                .close
                .map(|call| Request::from_call(call, "PATCH"))
                .transpose()?,
            provider,
        })
    }

    async fn send(
        &self,
        request: &Request,
        state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> Result<(String, Value), ActionError> {
        let root = ctx.template_root();
        let url = template::render_str(&request.endpoint, &root).map_err(ActionError::Error)?;
        let body = request
            .body
            .as_ref()
            .map(|body| template::render_value(body, &root))
            .transpose()
            .map_err(ActionError::Error)?;
        if state == ActionState::DryRun {
            return Err(dry_run(&request.method, &url, &body));
        }
        let client = self
            .provider
            .as_rest()
            .ok_or_else(|| ActionError::NotAvailable("provider has no REST client".into()))?;

        let response = client
            .request(RestRequest {
                method: request.method.clone(),
                url: url.clone(),
                body,
            })
            .await
            .map_err(|err| ActionError::Error(err.to_string()))?;
        if !response.is_success() {
            return Err(ActionError::Failed(format!(
                "{} {url} returned {}",
                request.method, response.status
            )));
        }
        Ok((url, response.json().unwrap_or(Value::Null)))
    }
}

#[async_trait]
impl Alerter for RestAlerter {
    fn kind(&self) -> &str {
        super::REST
    }

    async fn open(
        &self,
        state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> Result<AlertOutput, ActionError> {
        let (url, response) = self.send(&self.open, state, ctx).await?;
        info!(url = %url, entity_id = %ctx.entity.id(), "alert opened");
        let metadata = match response.get("id") {
            Some(id) if !id.is_null() => json!({ "alert_id": id }),
            _ => Value::Null,
        };
        Ok(AlertOutput {
            status: AlertStatus::On,
            details: json!({ "url": url }),
            metadata,
        })
    }

    async fn close(
        &self,
        state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> Result<AlertOutput, ActionError> {
        let details = match &self.close {
            Some(request) => {
                let (url, _) = self.send(request, state, ctx).await?;
                info!(url = %url, entity_id = %ctx.entity.id(), "alert closed");
                json!({ "url": url })
            }
            None => Value::Null,
        };
        Ok(AlertOutput {
            status: AlertStatus::Off,
            details,
            metadata: Value::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::FakeProvider;

    #[test]
    fn close_call_is_optional_and_checked() {
        let provider: Arc<dyn Provider> = Arc::new(FakeProvider::default());
        let spec: ActionSpec =
            serde_json::from_value(json!({"type": "rest", "rest": {"endpoint": "/issues"}})).unwrap();
        let alerter = RestAlerter::new(&spec, provider.clone()).unwrap();
        assert!(alerter.close.is_none());
        assert_eq!(alerter.open.method, "POST");

        let spec: ActionSpec = serde_json::from_value(json!({
            "type": "rest",
            "rest": {"endpoint": "/issues", "close": {"endpoint": "", "method": "PATCH"}}
        }))
        .unwrap();
        assert!(RestAlerter::new(&spec, provider).is_err());
    }
}
