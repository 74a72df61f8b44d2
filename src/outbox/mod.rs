//! The transactional outbox: durable rows of delayed snapshots.
//!
//! A snapshot lands here when its instance must pause (wait, retry) or when a
//! payload needs a diagnostic grave (parse failures, uncaught faults). Rows
//! are drained by the scheduled processors and re-emitted to the output
//! channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use uuid::Uuid;

mod memory;
mod postgres;
mod processor;

pub use memory::MemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use processor::OutboxProcessor;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Outbox database error: {message}"))]
    Database { message: String },

    #[snafu(display("Invalid outbox status '{value}'"))]
    InvalidStatus { value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(OutboxStatus::Pending),
            "SENT" => Ok(OutboxStatus::Sent),
            "FAILED" => Ok(OutboxStatus::Failed),
            _ => InvalidStatusSnafu { value }.fail(),
        }
    }
}

/// One stored row. Ids are UUIDv7 so natural sort follows insertion order.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub message: String,
    pub status: OutboxStatus,
    pub delayed_until: DateTime<Utc>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// A row awaiting redelivery at `delayed_until`.
    #[must_use]
    pub fn pending(message: String, delayed_until: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            message,
            status: OutboxStatus::Pending,
            delayed_until,
            attempt_count: 0,
            last_error: None,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// A diagnostic row that will never be redelivered.
    #[must_use]
    pub fn failed(message: String, error: String) -> Self {
        Self {
            status: OutboxStatus::Failed,
            last_error: Some(error),
            ..Self::pending(message, Utc::now())
        }
    }
}

/// The insert-only face of an outbox, object-safe for the consumer.
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    async fn enqueue(&self, message: OutboxMessage) -> Result<()>;
}

/// Full store contract used by the processors.
///
/// `find_to_process`/`find_to_delete` must lock the returned rows for the
/// duration of the transaction and skip rows locked elsewhere, so any number
/// of processors can share one table without double-processing.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    type Tx: Send;

    async fn insert(&self, message: OutboxMessage) -> Result<()>;

    async fn begin(&self) -> Result<Self::Tx>;
    async fn commit(&self, tx: Self::Tx) -> Result<()>;
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    /// Up to `limit` pending rows due now with attempts left, oldest delay
    /// first, locked for update and skipping locked rows.
    async fn find_to_process(
        &self,
        tx: &mut Self::Tx,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>>;

    /// Up to `limit` sent rows older than `cutoff`, same locking discipline.
    async fn find_to_delete(
        &self,
        tx: &mut Self::Tx,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>>;

    async fn update(&self, tx: &mut Self::Tx, messages: &[OutboxMessage]) -> Result<()>;
    async fn delete(&self, tx: &mut Self::Tx, messages: &[OutboxMessage]) -> Result<()>;
}

#[async_trait]
impl<S: OutboxStore> OutboxQueue for S {
    async fn enqueue(&self, message: OutboxMessage) -> Result<()> {
        self.insert(message).await
    }
}
