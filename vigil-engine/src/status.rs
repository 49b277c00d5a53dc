use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;
use vigil_rules::{ActionsOutcome, EvalOutcome};

use crate::error::StoreError;
use crate::store::{with_transaction, RuleEvaluationKey, Store};

/// Persists one rule evaluation: the record plus its eval, remediation and alert rows.
#[derive(Clone)]
pub struct StatusGateway {
    store: Arc<dyn Store>,
}

impl StatusGateway {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Writes the four rows in one transaction and returns the record id.
    ///
    /// A silently skipped evaluation writes nothing and returns `None`.
    pub async fn record(
        &self,
        key: &RuleEvaluationKey,
        eval: &EvalOutcome,
        actions: &ActionsOutcome,
    ) -> Result<Option<Uuid>, StoreError> {
        if eval.is_skip_silently() {
            debug!(rule_name = %key.rule_name, entity_id = %key.entity_id, "not recording silent skip");
            return Ok(None);
        }

        let key = key.clone();
        let eval_status = eval.status();
        let eval_details = eval.details();
        let remediation_status = actions.remediate_status();
        let remediation_details = actions.remediate_details();
        let remediation_metadata = actions.remediate_metadata();
        let alert_status = actions.alert_status();
        let alert_details = actions.alert_details();
        let alert_metadata = actions.alert_metadata();

        let id = with_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                let id = tx.upsert_rule_evaluation(&key).await?;
                tx.upsert_eval_detail(id, eval_status, &eval_details).await?;
                tx.upsert_remediation_detail(
                    id,
                    remediation_status,
                    &remediation_details,
                    &remediation_metadata,
                )
                .await?;
                tx.upsert_alert_detail(id, alert_status, &alert_details, &alert_metadata)
                    .await?;
                Ok::<_, StoreError>(id)
            })
        })
        .await?;
        Ok(Some(id))
    }
}
