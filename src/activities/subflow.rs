use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::definitions::DefinitionRegistry;
use crate::engine::{InstanceStatus, WorkflowInstance};
use crate::error::WorkflowError;
use crate::position::NodePosition;
use crate::secrets::SecretStore;
use crate::tree::NodeKind;

use super::{ActivityContext, ActivityOutcome, ActivityRunner};

/// The sub-workflow activity.
///
/// With `await: true` the child instance runs to completion in-process and
/// its output becomes the task's raw output; with `await: false` the child is
/// launched on its own task and the parent passes its input through. A child
/// fault propagates as a runtime error carrying the original details.
pub struct SubWorkflowRunner {
    definitions: Arc<DefinitionRegistry>,
}

impl std::fmt::Debug for SubWorkflowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubWorkflowRunner").finish_non_exhaustive()
    }
}

impl SubWorkflowRunner {
    #[must_use]
    pub fn new(definitions: Arc<DefinitionRegistry>) -> Self {
        Self { definitions }
    }
}

#[async_trait]
impl ActivityRunner for SubWorkflowRunner {
    async fn run(&self, ctx: ActivityContext) -> Result<ActivityOutcome, WorkflowError> {
        let NodeKind::Subflow { reference, await_ } = &ctx.kind else {
            return Err(
                WorkflowError::configuration("Sub-workflow runner got a non-workflow task")
                    .at(&ctx.position),
            );
        };

        let definition = self
            .definitions
            .get(&reference.name, &reference.version)
            .await
            .ok_or_else(|| {
                WorkflowError::configuration("Unknown workflow definition")
                    .with_detail(format!("{} {}", reference.name, reference.version))
                    .at(&ctx.position)
            })?;

        let input = match &reference.input {
            Some(template) => crate::expressions::evaluate_value(&ctx.input, template, &ctx.scope)
                .map_err(|e| WorkflowError::from(e).at(&ctx.position))?,
            None => ctx.input.clone(),
        };

        let message = WorkflowInstance::initial_message(&definition, input);
        let provider = super::standard_provider(Arc::clone(&self.definitions));
        debug!(
            name = %reference.name,
            version = %reference.version,
            awaited = await_,
            "launching sub-workflow"
        );

        if *await_ {
            let output = drive(
                definition,
                message,
                ctx.secrets.clone(),
                provider,
                &ctx.position,
            )
            .await?;
            Ok(ActivityOutcome::Output(output))
        } else {
            let secrets = ctx.secrets.clone();
            let position = ctx.position.clone();
            tokio::spawn(async move {
                if let Err(error) = drive(definition, message, secrets, provider, &position).await {
                    warn!(%error, "detached sub-workflow failed");
                }
            });
            Ok(ActivityOutcome::Output(ctx.input))
        }
    }
}

/// Run a child instance to completion, sleeping through its waits and retry
/// delays in-process.
async fn drive(
    definition: Arc<crate::dsl::WorkflowDefinition>,
    message: crate::state::WorkflowMessage,
    secrets: SecretStore,
    provider: super::RunnerProvider,
    position: &NodePosition,
) -> Result<Value, WorkflowError> {
    let mut instance = WorkflowInstance::from_message(definition, &message, secrets, provider)
        .map_err(|e| {
            WorkflowError::runtime("Failed to start sub-workflow")
                .with_detail(e.to_string())
                .at(position)
        })?;

    loop {
        let status = instance
            .run()
            .await
            .map_err(|e| {
                WorkflowError::runtime("Sub-workflow execution error")
                    .with_detail(e.to_string())
                    .at(position)
            })?
            .clone();

        match status {
            InstanceStatus::Pending | InstanceStatus::Running => {}
            InstanceStatus::Waiting { delay } | InstanceStatus::Retrying { delay } => {
                tokio::time::sleep(delay).await;
            }
            InstanceStatus::Completed => {
                return Ok(instance.output().cloned().unwrap_or(Value::Null));
            }
            InstanceStatus::Faulted { error } => {
                return Err(WorkflowError::runtime("Sub-workflow faulted")
                    .with_detail(error.to_string())
                    .at(position));
            }
        }
    }
}
