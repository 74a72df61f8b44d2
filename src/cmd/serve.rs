use std::sync::Arc;

use clap::Parser;
use snafu::prelude::*;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tracing::{info, warn};

use rook::activities::standard_provider;
use rook::config::RookConfig;
use rook::consumer::Consumer;
use rook::definitions::{self, DefinitionRegistry};
use rook::outbox::{MemoryOutboxStore, OutboxProcessor, OutboxQueue, OutboxStore, PostgresOutboxStore};
use rook::secrets::SecretStore;
use rook::transport::{self, WORKFLOWS_OUT};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Definition error: {source}"))]
    Definition { source: definitions::Error },

    #[snafu(display("A definitions directory is required (consumer.definitions)"))]
    MissingDefinitions,

    #[snafu(display("Database error: {message}"))]
    Database { message: String },

    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Enable verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

/// Run the full pipeline in one process: snapshots arrive as JSON lines on
/// stdin, flow through the consumer, and circulate over the loopback channel;
/// the outbox processors drain waits and retries back into the same loop.
///
/// With `database.url` configured the outboxes are postgres tables (what a
/// real deployment uses); without it they are in-memory, which is enough to
/// exercise workflows locally.
pub async fn handle_serve(args: ServeArgs, config: RookConfig) -> Result<()> {
    let _ = args;

    let registry = Arc::new(DefinitionRegistry::new());
    let dir = config
        .consumer
        .definitions
        .as_ref()
        .context(MissingDefinitionsSnafu)?;
    let count = registry.load_dir(dir).await.context(DefinitionSnafu)?;
    info!(count, "loaded workflow definitions");

    let (emitter, mut out_rx) = transport::loopback(WORKFLOWS_OUT, config.consumer.channel_capacity);
    let emitter = Arc::new(emitter);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Outbox stores: postgres when configured, memory otherwise.
    let (wait_queue, retry_queue, handles): (
        Arc<dyn OutboxQueue>,
        Arc<dyn OutboxQueue>,
        Vec<tokio::task::JoinHandle<()>>,
    ) = match &config.database.url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(url)
                .await
                .map_err(|e| Error::Database {
                    message: e.to_string(),
                })?;
            let wait = Arc::new(
                PostgresOutboxStore::new(pool.clone(), "wait")
                    .await
                    .map_err(|e| Error::Database {
                        message: e.to_string(),
                    })?,
            );
            let retry = Arc::new(
                PostgresOutboxStore::new(pool, "retry")
                    .await
                    .map_err(|e| Error::Database {
                        message: e.to_string(),
                    })?,
            );
            let handles = spawn_processors(
                Arc::clone(&wait),
                Arc::clone(&retry),
                Arc::clone(&emitter),
                &config,
                shutdown_rx,
            );
            (
                wait as Arc<dyn OutboxQueue>,
                retry as Arc<dyn OutboxQueue>,
                handles,
            )
        }
        None => {
            info!("no database configured, using in-memory outboxes");
            let wait = Arc::new(MemoryOutboxStore::new());
            let retry = Arc::new(MemoryOutboxStore::new());
            let handles = spawn_processors(
                Arc::clone(&wait),
                Arc::clone(&retry),
                Arc::clone(&emitter),
                &config,
                shutdown_rx,
            );
            (
                wait as Arc<dyn OutboxQueue>,
                retry as Arc<dyn OutboxQueue>,
                handles,
            )
        }
    };

    let consumer = Consumer::new(
        Arc::clone(&registry),
        standard_provider(Arc::clone(&registry)),
        SecretStore::from_env(),
        wait_queue,
        retry_queue,
    );

    info!("serving; feed WorkflowMessage JSON lines on stdin (ctrl-d to stop)");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context(IoSnafu)? {
                    Some(payload) if payload.trim().is_empty() => {}
                    Some(payload) => dispatch(&consumer, &payload).await,
                    None => break,
                }
            }
            Some(payload) = out_rx.recv() => {
                dispatch(&consumer, &payload).await;
            }
        }
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Feed one payload through the consumer and recirculate any follow-up.
async fn dispatch(consumer: &Consumer, payload: &str) {
    let mut payload = payload.to_string();
    loop {
        match consumer.consume(&payload).await {
            Ok(Some(next)) => payload = next,
            Ok(None) => break,
            Err(error) => {
                // The diagnostic row is already parked; in a brokered
                // deployment this disposition would route to the DLQ.
                warn!(%error, "message rejected");
                break;
            }
        }
    }
}

fn spawn_processors<S: OutboxStore>(
    wait: Arc<S>,
    retry: Arc<S>,
    emitter: Arc<rook::transport::ChannelEmitter>,
    config: &RookConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    let wait_processor = Arc::new(OutboxProcessor::new(
        "wait",
        wait,
        emitter.clone() as Arc<dyn rook::transport::MessageEmitter>,
        config.outbox.wait.clone(),
    ));
    handles.extend(wait_processor.spawn(shutdown.clone()));

    let retry_processor = Arc::new(OutboxProcessor::new(
        "retry",
        retry,
        emitter as Arc<dyn rook::transport::MessageEmitter>,
        config.outbox.retry.clone(),
    ));
    handles.extend(retry_processor.spawn(shutdown));
    handles
}
