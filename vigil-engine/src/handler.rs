//! Bridges entity-evaluate messages to the executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, info_span, warn, Instrument};
use vigil_protocol::{EntityInfoWrapper, EntityType, Message};

use crate::bus::MessageHandler;
use crate::config::EngineConfig;
use crate::context::{CancelToken, WaitGroup};
use crate::error::{ExecutorError, HandlerError};
use crate::executor::Executor;

/// Runs one evaluation task per entity-evaluate message.
///
/// Each task gets its own cancellation token derived from `shutdown`, so cancelling
/// `shutdown` cancels every evaluation still in flight. `wait` resolves once all of
/// them have exited.
pub struct EntityEvaluateHandler {
    executor: Arc<Executor>,
    shutdown: CancelToken,
    tasks: WaitGroup,
    execution_timeout: Duration,
    artifact_wait: Duration,
}

impl EntityEvaluateHandler {
    pub fn new(executor: Arc<Executor>, config: &EngineConfig, shutdown: CancelToken) -> Self {
        Self {
            executor,
            shutdown,
            tasks: WaitGroup::new(),
            execution_timeout: config.execution_timeout,
            artifact_wait: config.artifact_wait,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.in_flight()
    }

    /// Resolves once every dispatched evaluation has finished.
    pub async fn wait(&self) {
        self.tasks.wait().await;
    }
}

#[async_trait]
impl MessageHandler for EntityEvaluateHandler {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let wrapper = EntityInfoWrapper::from_message(&message)?;
        let cancel = self.shutdown.child();
        let guard = self.tasks.add();

        let span = info_span!(
            "entity_evaluation",
            message_id = %message.uuid,
            entity_id = %wrapper.entity_id,
            entity_type = %wrapper.entity_type,
            project_id = %wrapper.project_id,
            provider_id = %wrapper.provider_id,
        );
        let task = EvaluationTask {
            executor: self.executor.clone(),
            wrapper,
            cancel,
            execution_timeout: self.execution_timeout,
            artifact_wait: self.artifact_wait,
        };
        tokio::spawn(
            async move {
                task.run().await;
                drop(guard);
            }
            .instrument(span),
        );
        Ok(())
    }
}

struct EvaluationTask {
    executor: Arc<Executor>,
    wrapper: EntityInfoWrapper,
    cancel: CancelToken,
    execution_timeout: Duration,
    artifact_wait: Duration,
}

impl EvaluationTask {
    async fn run(self) {
        if self.wrapper.entity_type == EntityType::Artifact && !self.artifact_wait.is_zero() {
            debug!(wait_secs = self.artifact_wait.as_secs(), "waiting for artifact signatures");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.artifact_wait) => {}
            }
        }

        let Some(execution_id) = self.wrapper.execution_id else {
            error!("entity event carries no execution id, dropping it");
            return;
        };

        let evaluation = self.executor.eval_entity_event(&self.wrapper, &self.cancel);
        tokio::pin!(evaluation);
        let result = match tokio::time::timeout(self.execution_timeout, &mut evaluation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    execution_id = %execution_id,
                    timeout_secs = self.execution_timeout.as_secs(),
                    "entity evaluation timed out"
                );
                self.cancel.cancel();
                evaluation.await
            }
        };

        match result {
            Ok(summary) => info!(
                execution_id = %execution_id,
                evaluated = summary.rules.len(),
                "entity evaluation succeeded"
            ),
            Err(ExecutorError::Cancelled) => warn!(
                execution_id = %execution_id,
                "entity evaluation cancelled"
            ),
            Err(err) => error!(
                execution_id = %execution_id,
                error = %err,
                "entity evaluation failed"
            ),
        }
    }
}
