//! The consumer pipeline.
//!
//! One call consumes one snapshot from `workflows-in`, advances it through
//! the engine, and routes the outcome: the next snapshot back to
//! `workflows-out`, a delayed snapshot into the wait or retry outbox, or
//! nothing for a terminal instance. Delivery is at-least-once end to end;
//! activities are expected to tolerate duplicates.

use std::sync::Arc;

use chrono::Utc;
use snafu::prelude::*;
use tracing::{error, info, warn};

use crate::activities::RunnerProvider;
use crate::definitions::DefinitionRegistry;
use crate::engine::{self, InstanceStatus, WorkflowInstance};
use crate::outbox::{self, OutboxMessage, OutboxQueue};
use crate::secrets::SecretStore;
use crate::state::WorkflowMessage;

/// Failure dispositions surfaced to the transport; the transport is expected
/// to route the triggering delivery to its dead-letter mechanism.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Malformed workflow message: {source}"))]
    MalformedMessage { source: serde_json::Error },

    #[snafu(display("Unknown workflow definition: {name} {version}"))]
    UnknownDefinition { name: String, version: String },

    #[snafu(display("Engine error: {source}"))]
    Engine { source: engine::Error },

    #[snafu(display("Snapshot serialization error: {source}"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("Outbox error: {source}"))]
    Outbox { source: outbox::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Consumer {
    definitions: Arc<DefinitionRegistry>,
    runners: RunnerProvider,
    secrets: SecretStore,
    wait_outbox: Arc<dyn OutboxQueue>,
    retry_outbox: Arc<dyn OutboxQueue>,
}

impl Consumer {
    pub fn new(
        definitions: Arc<DefinitionRegistry>,
        runners: RunnerProvider,
        secrets: SecretStore,
        wait_outbox: Arc<dyn OutboxQueue>,
        retry_outbox: Arc<dyn OutboxQueue>,
    ) -> Self {
        Self {
            definitions,
            runners,
            secrets,
            wait_outbox,
            retry_outbox,
        }
    }

    /// Process one incoming payload; returns the optional next payload for
    /// the output channel.
    ///
    /// Any failure parks the raw payload as a FAILED diagnostic row in the
    /// retry outbox (never reprocessed) before the failure is surfaced to the
    /// transport.
    pub async fn consume(&self, payload: &str) -> Result<Option<String>> {
        match self.process(payload).await {
            Ok(next) => Ok(next),
            Err(failure) => {
                error!(%failure, "message processing failed, parking diagnostic row");
                let row = OutboxMessage::failed(payload.to_string(), failure.to_string());
                if let Err(outbox_failure) = self.retry_outbox.enqueue(row).await {
                    // Surfacing the original failure matters more than the
                    // bookkeeping failure.
                    error!(%outbox_failure, "failed to persist diagnostic row");
                }
                Err(failure)
            }
        }
    }

    async fn process(&self, payload: &str) -> Result<Option<String>> {
        let message = WorkflowMessage::from_json(payload).context(MalformedMessageSnafu)?;

        let definition = self
            .definitions
            .get(&message.name, &message.version)
            .await
            .context(UnknownDefinitionSnafu {
                name: message.name.clone(),
                version: message.version.clone(),
            })?;

        let mut instance = WorkflowInstance::from_message(
            definition,
            &message,
            self.secrets.clone(),
            self.runners.clone(),
        )
        .context(EngineSnafu)?;

        let status = instance.run().await.context(EngineSnafu)?.clone();
        let workflow_id = instance.workflow_id().unwrap_or_default();

        match status {
            InstanceStatus::Completed => {
                info!(%workflow_id, name = %message.name, "workflow completed");
                Ok(None)
            }
            InstanceStatus::Running => {
                let next = instance.snapshot().to_json().context(SerializeSnafu)?;
                Ok(Some(next))
            }
            InstanceStatus::Waiting { delay } => {
                let snapshot = instance.snapshot().to_json().context(SerializeSnafu)?;
                let due = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::milliseconds(0));
                info!(%workflow_id, ?delay, "workflow waiting, parking snapshot");
                self.wait_outbox
                    .enqueue(OutboxMessage::pending(snapshot, due))
                    .await
                    .context(OutboxSnafu)?;
                Ok(None)
            }
            InstanceStatus::Retrying { delay } => {
                let snapshot = instance.snapshot().to_json().context(SerializeSnafu)?;
                let due = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::milliseconds(0));
                info!(%workflow_id, ?delay, "workflow retry pending, parking snapshot");
                self.retry_outbox
                    .enqueue(OutboxMessage::pending(snapshot, due))
                    .await
                    .context(OutboxSnafu)?;
                Ok(None)
            }
            InstanceStatus::Faulted { error } => {
                warn!(%workflow_id, %error, "workflow faulted");
                let snapshot = instance.snapshot().to_json().context(SerializeSnafu)?;
                self.retry_outbox
                    .enqueue(OutboxMessage::failed(snapshot, error.to_string()))
                    .await
                    .context(OutboxSnafu)?;
                Ok(None)
            }
            InstanceStatus::Pending => Ok(None),
        }
    }
}
