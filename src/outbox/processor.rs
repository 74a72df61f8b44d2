use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::config::OutboxConfig;
use crate::transport::MessageEmitter;

use super::{OutboxStatus, OutboxStore, Result};

/// Scheduled drain of one outbox flavor.
///
/// Two loops run per flavor at fixed intervals with at-most-one concurrent
/// run each: the process loop redelivers due PENDING rows with exponential
/// backoff, the cleanup loop deletes SENT rows past retention. A failing
/// cycle is logged and the next tick retries; the scheduler never dies.
pub struct OutboxProcessor<S: OutboxStore> {
    flavor: String,
    store: Arc<S>,
    emitter: Arc<dyn MessageEmitter>,
    config: OutboxConfig,
}

impl<S: OutboxStore> OutboxProcessor<S> {
    pub fn new(
        flavor: impl Into<String>,
        store: Arc<S>,
        emitter: Arc<dyn MessageEmitter>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            flavor: flavor.into(),
            store,
            emitter,
            config,
        }
    }

    /// Spawn the process and cleanup schedulers. Returns no handles when the
    /// flavor is disabled.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            info!(flavor = %self.flavor, "outbox processor disabled");
            return Vec::new();
        }

        let process = {
            let processor = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(processor.config.poll_interval());
                // Skipping missed ticks keeps runs from piling up behind a
                // slow cycle: at most one cycle is in flight per flavor.
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    if let Err(error) = processor.process_cycle().await {
                        warn!(flavor = %processor.flavor, %error, "outbox process cycle failed");
                    }
                }
            })
        };

        let cleanup = {
            let processor = Arc::clone(&self);
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(processor.config.cleanup_interval());
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    if let Err(error) = processor.cleanup_cycle().await {
                        warn!(flavor = %processor.flavor, %error, "outbox cleanup cycle failed");
                    }
                }
            })
        };

        vec![process, cleanup]
    }

    /// One process cycle: claim batches of due rows, deliver each, and record
    /// SENT, a backed-off redelivery, or FAILED. The cycle ends after
    /// `max_empty_batches` consecutive empty claims.
    pub async fn process_cycle(&self) -> Result<usize> {
        let mut empty_batches = 0;
        let mut delivered = 0;

        while empty_batches < self.config.max_empty_batches {
            let mut tx = self.store.begin().await?;
            let batch = self
                .store
                .find_to_process(&mut tx, self.config.max_attempts, self.config.batch_size)
                .await?;

            if batch.is_empty() {
                self.store.commit(tx).await?;
                empty_batches += 1;
                tokio::time::sleep(empty_batch_pause()).await;
                continue;
            }
            empty_batches = 0;

            let mut processed = Vec::with_capacity(batch.len());
            for mut row in batch {
                row.attempt_count += 1;
                match self.emitter.emit(&row.message).await {
                    Ok(()) => {
                        row.status = OutboxStatus::Sent;
                        delivered += 1;
                    }
                    Err(error) => {
                        row.last_error = Some(error.to_string());
                        if row.attempt_count >= self.config.max_attempts {
                            warn!(
                                flavor = %self.flavor,
                                id = %row.id,
                                attempts = row.attempt_count,
                                "outbox row exhausted its attempts"
                            );
                            row.status = OutboxStatus::Failed;
                        } else {
                            let delay = backoff::delay_for_attempt(
                                self.config.initial_delay(),
                                u32::try_from(row.attempt_count).unwrap_or(u32::MAX),
                            );
                            row.delayed_until = Utc::now()
                                + chrono::Duration::from_std(delay)
                                    .unwrap_or_else(|_| chrono::Duration::milliseconds(100));
                        }
                    }
                }
                processed.push(row);
            }

            self.store.update(&mut tx, &processed).await?;
            self.store.commit(tx).await?;
            debug!(flavor = %self.flavor, count = processed.len(), "processed outbox batch");
        }

        Ok(delivered)
    }

    /// One cleanup cycle: delete SENT rows whose delay timestamp fell past
    /// the retention window. PENDING and FAILED rows are never touched.
    pub async fn cleanup_cycle(&self) -> Result<usize> {
        let retention = self.config.retention().map_err(|e| super::Error::Database {
            message: format!("invalid retention duration: {e}"),
        })?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(7));

        let mut empty_batches = 0;
        let mut deleted = 0;

        while empty_batches < self.config.max_empty_batches {
            let mut tx = self.store.begin().await?;
            let batch = self
                .store
                .find_to_delete(&mut tx, cutoff, self.config.batch_size)
                .await?;

            if batch.is_empty() {
                self.store.commit(tx).await?;
                empty_batches += 1;
                tokio::time::sleep(empty_batch_pause()).await;
                continue;
            }

            self.store.delete(&mut tx, &batch).await?;
            self.store.commit(tx).await?;
            deleted += batch.len();
            debug!(flavor = %self.flavor, count = batch.len(), "deleted expired outbox rows");
        }

        Ok(deleted)
    }
}

/// Short jittered pause between empty claims inside a cycle.
fn empty_batch_pause() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(10..=200))
}
