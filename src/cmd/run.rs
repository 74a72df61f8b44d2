use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use snafu::prelude::*;
use tracing::info;

use rook::activities::standard_provider;
use rook::definitions::{self, DefinitionRegistry};
use rook::engine::{self, InstanceStatus, WorkflowInstance};
use rook::secrets::SecretStore;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Definition error: {source}"))]
    Definition { source: definitions::Error },

    #[snafu(display("Engine error: {source}"))]
    Engine { source: engine::Error },

    #[snafu(display("Workflow faulted: {message}"))]
    Faulted { message: String },

    #[snafu(display("Output serialization error: {source}"))]
    Output { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Workflow document to execute
    pub workflow: PathBuf,

    /// Initial input, as JSON (a non-JSON value is taken as a string)
    #[arg(short, long)]
    pub input: Option<String>,

    /// Directory of additional definitions (for sub-workflows)
    #[arg(short, long)]
    pub registry: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

/// Execute one workflow to completion in-process, sleeping through its waits
/// and retry delays, and print the output as JSON.
pub async fn handle_run(args: RunArgs) -> Result<()> {
    let registry = Arc::new(DefinitionRegistry::new());
    if let Some(dir) = &args.registry {
        let count = registry.load_dir(dir).await.context(DefinitionSnafu)?;
        info!(count, "loaded registry definitions");
    }
    let definition = registry
        .load_file(&args.workflow)
        .await
        .context(DefinitionSnafu)?;

    let input = match &args.input {
        Some(text) => serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.clone())),
        None => serde_json::json!({}),
    };

    let message = WorkflowInstance::initial_message(&definition, input);
    let mut instance = WorkflowInstance::from_message(
        definition,
        &message,
        SecretStore::from_env(),
        standard_provider(Arc::clone(&registry)),
    )
    .context(EngineSnafu)?;

    loop {
        let status = instance.run().await.context(EngineSnafu)?.clone();
        match status {
            InstanceStatus::Pending | InstanceStatus::Running => {}
            InstanceStatus::Waiting { delay } | InstanceStatus::Retrying { delay } => {
                info!(?delay, "instance parked, sleeping in-process");
                tokio::time::sleep(delay).await;
            }
            InstanceStatus::Completed => break,
            InstanceStatus::Faulted { error } => {
                return FaultedSnafu {
                    message: error.to_string(),
                }
                .fail();
            }
        }
    }

    let output = instance.output().cloned().unwrap_or(serde_json::Value::Null);
    println!("{}", serde_json::to_string_pretty(&output).context(OutputSnafu)?);
    Ok(())
}
