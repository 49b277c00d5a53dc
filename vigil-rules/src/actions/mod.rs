//! Remediation and alerting triggered by evaluation outcomes.

mod alert;
mod remediate;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use vigil_protocol::EntityWithProperties;

use crate::error::{ActionError, EngineError, EvalError};
use crate::outcome::{
    ActionOutput, ActionsOutcome, AlertOutput, AlertStatus, EvalOutcome, PreviousEvaluation,
};
use crate::profile::ActionState;
use crate::provider::Provider;
use crate::rule_type::{ActionSpec, RuleType};
use crate::template;

pub use alert::RestAlerter;
pub use remediate::RestRemediator;

pub const REST: &str = "rest";

/// Inputs shared by both action slots.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub entity: &'a EntityWithProperties,
    pub def: &'a Value,
    pub params: &'a Value,
    pub eval: &'a EvalOutcome,
    pub previous: &'a PreviousEvaluation,
}

impl ActionContext<'_> {
    /// Template root: the ingest context plus `eval` and the previous `alert` metadata.
    pub fn template_root(&self) -> Value {
        let mut root = template::context(self.entity, self.def, self.params);
        root.insert("eval".into(), self.eval.to_document());
        root.insert("alert".into(), self.previous.alert_metadata.clone());
        Value::Object(root)
    }
}

#[async_trait]
pub trait Remediator: Send + Sync {
    fn kind(&self) -> &str;

    async fn remediate(
        &self,
        state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutput, ActionError>;
}

#[async_trait]
pub trait Alerter: Send + Sync {
    fn kind(&self) -> &str;

    async fn open(&self, state: ActionState, ctx: &ActionContext<'_>)
        -> Result<AlertOutput, ActionError>;

    async fn close(
        &self,
        state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> Result<AlertOutput, ActionError>;
}

pub(crate) fn action_config<T: DeserializeOwned + Default>(
    spec: &ActionSpec,
    component: &'static str,
) -> Result<T, EngineError> {
    match spec.section() {
        None | Some(Value::Null) => Ok(T::default()),
        Some(section) => serde_json::from_value(section.clone())
            .map_err(|err| EngineError::config(component, err.to_string())),
    }
}

pub(crate) fn dry_run(method: &str, url: &str, body: &Option<Value>) -> ActionError {
    match body {
        Some(body) => ActionError::Skipped(format!("dry run: {method} {url} {body}")),
        None => ActionError::Skipped(format!("dry run: {method} {url}")),
    }
}

/// The remediate and alert actions configured on a rule type.
#[derive(Clone, Default)]
pub struct ActionEngine {
    remediator: Option<Arc<dyn Remediator>>,
    alerter: Option<Arc<dyn Alerter>>,
}

impl std::fmt::Debug for ActionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionEngine")
            .field("remediate", &self.remediator.as_ref().map(|r| r.kind().to_string()))
            .field("alert", &self.alerter.as_ref().map(|a| a.kind().to_string()))
            .finish()
    }
}

impl ActionEngine {
    pub fn new(rule_type: &RuleType, provider: Arc<dyn Provider>) -> Result<Self, EngineError> {
        let remediator: Option<Arc<dyn Remediator>> = match &rule_type.def.remediate {
            None => None,
            Some(spec) if spec.kind.is_empty() => None,
            Some(spec) if spec.kind == REST => {
                Some(Arc::new(RestRemediator::new(spec, provider.clone())?))
            }
            Some(spec) => return Err(EngineError::UnknownAction(spec.kind.clone())),
        };
        let alerter: Option<Arc<dyn Alerter>> = match &rule_type.def.alert {
            None => None,
            Some(spec) if spec.kind.is_empty() => None,
            Some(spec) if spec.kind == REST => Some(Arc::new(RestAlerter::new(spec, provider)?)),
            Some(spec) => return Err(EngineError::UnknownAction(spec.kind.clone())),
        };
        Ok(Self {
            remediator,
            alerter,
        })
    }

    pub fn with_actions(
        remediator: Option<Arc<dyn Remediator>>,
        alerter: Option<Arc<dyn Alerter>>,
    ) -> Self {
        Self {
            remediator,
            alerter,
        }
    }

    pub async fn run(
        &self,
        remediate_state: ActionState,
        alert_state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> ActionsOutcome {
        let remediate = self.remediate(remediate_state, ctx).await;
        let alert = self.alert(alert_state, ctx).await;
        debug!(
            remediate = %crate::outcome::RemediationStatus::from_result(&remediate),
            alert = %AlertStatus::from_result(&alert),
            "actions finished"
        );
        ActionsOutcome { remediate, alert }
    }

    async fn remediate(
        &self,
        state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutput, ActionError> {
        if state == ActionState::Off {
            return Err(ActionError::Skipped("remediation is off".into()));
        }
        let Some(remediator) = &self.remediator else {
            return Err(ActionError::NotAvailable("rule type has no remediation".into()));
        };
        if !ctx.eval.is_failure() {
            return Err(ActionError::RemediationSkipped);
        }
        remediator.remediate(state, ctx).await
    }

    async fn alert(
        &self,
        state: ActionState,
        ctx: &ActionContext<'_>,
    ) -> Result<AlertOutput, ActionError> {
        if state == ActionState::Off {
            return Err(ActionError::Skipped("alerting is off".into()));
        }
        let Some(alerter) = &self.alerter else {
            return Err(ActionError::NotAvailable("rule type has no alert".into()));
        };
        let previously_on = ctx.previous.alert_status == Some(AlertStatus::On);
        match &ctx.eval.result {
            Err(EvalError::Failed { .. }) if previously_on => Ok(AlertOutput {
                status: AlertStatus::On,
                details: Value::Null,
                metadata: ctx.previous.alert_metadata.clone(),
            }),
            Err(EvalError::Failed { .. }) => alerter.open(state, ctx).await,
            Ok(_) if previously_on => alerter.close(state, ctx).await,
            Ok(_) => Ok(AlertOutput {
                status: AlertStatus::Off,
                details: Value::Null,
                metadata: Value::Null,
            }),
            Err(err) => Err(ActionError::Skipped(err.to_string())),
        }
    }
}
