//! # Rook — a durable, distributed Serverless Workflow engine
//!
//! Rook executes [Serverless Workflow](https://serverlessworkflow.io/) v1.0
//! documents step by step across many worker processes. Progress is captured
//! in compact serializable snapshots ([`state::WorkflowMessage`]): a consumer
//! reads a snapshot from the input channel, advances it through the engine,
//! and either emits the next snapshot, parks a delayed snapshot in a
//! transactional outbox (waits and retries), or marks the instance terminal.
//! Scheduled outbox processors drain due rows back onto the output channel
//! with exponential backoff, `SELECT ... FOR UPDATE SKIP LOCKED` batching and
//! retention cleanup, making every step at-least-once delivered and
//! crash-safe.
//!
//! ## Core modules
//!
//! - [`engine`] — the tree-walking interpreter over per-node state records
//! - [`tree`] / [`position`] — the immutable node tree and stable addressing
//! - [`state`] — node state and the snapshot wire form
//! - [`expressions`] / [`schema`] — the jq and JSON-schema gateways
//! - [`activities`] — the activity runner registry (HTTP, process, wait,
//!   sub-workflow)
//! - [`consumer`] — the channel-facing pipeline
//! - [`outbox`] — durable delayed snapshots and their processors
//!
//! ## Example
//!
//! ```rust,no_run
//! use rook::definitions::DefinitionRegistry;
//! use rook::dsl::WorkflowDefinition;
//! use rook::engine::{InstanceStatus, WorkflowInstance};
//! use rook::secrets::SecretStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow_yaml = r#"
//! document:
//!   dsl: '1.0.0'
//!   namespace: examples
//!   name: hello-world
//!   version: '0.1.0'
//! do:
//!   - sayHello:
//!       set:
//!         message: Hello World!
//! "#;
//!
//! let registry = Arc::new(DefinitionRegistry::new());
//! let definition = registry
//!     .register(WorkflowDefinition::from_yaml(workflow_yaml)?)
//!     .await;
//!
//! let message = WorkflowInstance::initial_message(&definition, serde_json::json!({}));
//! let mut instance = WorkflowInstance::from_message(
//!     definition,
//!     &message,
//!     SecretStore::default(),
//!     rook::activities::standard_provider(registry),
//! )?;
//!
//! while !matches!(instance.run().await?, InstanceStatus::Completed) {}
//! println!("output: {:?}", instance.output());
//! # Ok(())
//! # }
//! ```

pub mod activities;
pub mod backoff;
pub mod config;
pub mod consumer;
pub mod definitions;
pub mod descriptors;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod expressions;
pub mod outbox;
pub mod position;
pub mod schema;
pub mod secrets;
pub mod state;
pub mod transport;
pub mod tree;
