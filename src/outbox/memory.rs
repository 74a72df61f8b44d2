use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{OutboxMessage, OutboxStatus, OutboxStore, Result};

/// In-memory outbox, the test and loopback stand-in for the postgres table.
///
/// A "transaction" holds the store's single lock for its whole lifetime, so
/// claimed rows are naturally invisible to concurrent transactions (the
/// whole-table analogue of row locking; rollback does not undo mutations).
#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    rows: Arc<Mutex<Vec<OutboxMessage>>>,
}

impl MemoryOutboxStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, for assertions.
    pub async fn all(&self) -> Vec<OutboxMessage> {
        self.rows.lock().await.clone()
    }

    pub async fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|row| row.status == status)
            .count()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    type Tx = OwnedMutexGuard<Vec<OutboxMessage>>;

    async fn insert(&self, message: OutboxMessage) -> Result<()> {
        self.rows.lock().await.push(message);
        Ok(())
    }

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(Arc::clone(&self.rows).lock_owned().await)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        drop(tx);
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        drop(tx);
        Ok(())
    }

    async fn find_to_process(
        &self,
        tx: &mut Self::Tx,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>> {
        let now = Utc::now();
        let mut due: Vec<OutboxMessage> = tx
            .iter()
            .filter(|row| {
                row.status == OutboxStatus::Pending
                    && row.delayed_until <= now
                    && row.attempt_count < max_attempts
            })
            .cloned()
            .collect();
        due.sort_by_key(|row| row.delayed_until);
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn find_to_delete(
        &self,
        tx: &mut Self::Tx,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>> {
        let mut old: Vec<OutboxMessage> = tx
            .iter()
            .filter(|row| row.status == OutboxStatus::Sent && row.delayed_until < cutoff)
            .cloned()
            .collect();
        old.sort_by_key(|row| row.delayed_until);
        old.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(old)
    }

    async fn update(&self, tx: &mut Self::Tx, messages: &[OutboxMessage]) -> Result<()> {
        for message in messages {
            if let Some(row) = tx.iter_mut().find(|row| row.id == message.id) {
                *row = OutboxMessage {
                    version: row.version + 1,
                    ..message.clone()
                };
            }
        }
        Ok(())
    }

    async fn delete(&self, tx: &mut Self::Tx, messages: &[OutboxMessage]) -> Result<()> {
        tx.retain(|row| !messages.iter().any(|m| m.id == row.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claims_only_due_pending_rows() {
        let store = MemoryOutboxStore::new();
        store
            .insert(OutboxMessage::pending(
                "due".to_string(),
                Utc::now() - chrono::Duration::seconds(1),
            ))
            .await
            .unwrap();
        store
            .insert(OutboxMessage::pending(
                "later".to_string(),
                Utc::now() + chrono::Duration::hours(1),
            ))
            .await
            .unwrap();
        store
            .insert(OutboxMessage::failed("dead".to_string(), "x".to_string()))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let batch = store.find_to_process(&mut tx, 5, 10).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message, "due");
    }

    #[tokio::test]
    async fn exhausted_rows_are_not_claimed() {
        let store = MemoryOutboxStore::new();
        let mut row =
            OutboxMessage::pending("tired".to_string(), Utc::now() - chrono::Duration::seconds(1));
        row.attempt_count = 5;
        store.insert(row).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let batch = store.find_to_process(&mut tx, 5, 10).await.unwrap();
        store.commit(tx).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = MemoryOutboxStore::new();
        let row = OutboxMessage::pending("v".to_string(), Utc::now());
        store.insert(row.clone()).await.unwrap();

        let mut updated = row.clone();
        updated.status = OutboxStatus::Sent;
        let mut tx = store.begin().await.unwrap();
        store.update(&mut tx, &[updated]).await.unwrap();
        store.commit(tx).await.unwrap();

        let rows = store.all().await;
        assert_eq!(rows[0].version, 1);
        assert_eq!(rows[0].status, OutboxStatus::Sent);
    }
}
