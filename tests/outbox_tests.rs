//! Outbox pipeline tests: wait redelivery end to end, concurrent processors,
//! and interleaved processing and cleanup.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rook::activities::standard_provider;
use rook::config::OutboxConfig;
use rook::consumer::Consumer;
use rook::definitions::DefinitionRegistry;
use rook::dsl::WorkflowDefinition;
use rook::engine::WorkflowInstance;
use rook::outbox::{
    MemoryOutboxStore, OutboxMessage, OutboxProcessor, OutboxQueue, OutboxStatus, OutboxStore,
};
use rook::secrets::SecretStore;
use rook::transport::{self, MessageEmitter};
use serde_json::json;
use tokio::sync::Mutex;

const SWITCH_DEMO: &str = include_str!("fixtures/switch-demo.yaml");

/// Emitter that records every delivered payload.
#[derive(Clone, Default)]
struct RecordingEmitter {
    delivered: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageEmitter for RecordingEmitter {
    async fn emit(&self, payload: &str) -> transport::Result<()> {
        self.delivered.lock().await.push(payload.to_string());
        Ok(())
    }
}

fn quick_config() -> OutboxConfig {
    OutboxConfig {
        max_empty_batches: 1,
        batch_size: 5,
        ..OutboxConfig::default()
    }
}

#[tokio::test]
async fn wait_redelivery_completes_the_workflow() {
    let registry = Arc::new(DefinitionRegistry::new());
    registry
        .register(WorkflowDefinition::from_yaml(SWITCH_DEMO).unwrap())
        .await;
    let definition = registry.get("switch-demo", "0.1.0").await.unwrap();

    let wait_outbox = Arc::new(MemoryOutboxStore::new());
    let retry_outbox = Arc::new(MemoryOutboxStore::new());
    let consumer = Consumer::new(
        Arc::clone(&registry),
        standard_provider(Arc::clone(&registry)),
        SecretStore::default(),
        Arc::clone(&wait_outbox) as Arc<dyn OutboxQueue>,
        Arc::clone(&retry_outbox) as Arc<dyn OutboxQueue>,
    );

    // Hop 1: the wait parks a snapshot.
    let payload = WorkflowInstance::initial_message(&definition, json!("wait"))
        .to_json()
        .unwrap();
    assert!(consumer.consume(&payload).await.unwrap().is_none());
    assert_eq!(wait_outbox.count_with_status(OutboxStatus::Pending).await, 1);

    // Fast-forward the row to due instead of sleeping 30 s.
    {
        let rows = wait_outbox.all().await;
        let mut row = rows[0].clone();
        row.delayed_until = Utc::now() - chrono::Duration::seconds(1);
        let mut tx = wait_outbox.begin().await.unwrap();
        wait_outbox.update(&mut tx, &[row]).await.unwrap();
        wait_outbox.commit(tx).await.unwrap();
    }

    // The processor drains the row back onto the output channel.
    let emitter = RecordingEmitter::default();
    let processor = OutboxProcessor::new(
        "wait",
        Arc::clone(&wait_outbox),
        Arc::new(emitter.clone()),
        quick_config(),
    );
    let delivered = processor.process_cycle().await.unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(wait_outbox.count_with_status(OutboxStatus::Sent).await, 1);

    // Hop 2: the redelivered snapshot resumes past the wait and completes.
    let redelivered = emitter.delivered.lock().await.first().cloned().unwrap();
    assert!(redelivered.contains("/do/3/doWait"));
    assert!(consumer.consume(&redelivered).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_processors_never_double_deliver() {
    let store = Arc::new(MemoryOutboxStore::new());
    for i in 0..20 {
        store
            .insert(OutboxMessage::pending(
                format!("payload-{i}"),
                Utc::now() - chrono::Duration::seconds(1),
            ))
            .await
            .unwrap();
    }

    let emitter_a = RecordingEmitter::default();
    let emitter_b = RecordingEmitter::default();
    let a = OutboxProcessor::new(
        "wait",
        Arc::clone(&store),
        Arc::new(emitter_a.clone()),
        quick_config(),
    );
    let b = OutboxProcessor::new(
        "wait",
        Arc::clone(&store),
        Arc::new(emitter_b.clone()),
        quick_config(),
    );

    let (ra, rb) = tokio::join!(a.process_cycle(), b.process_cycle());
    let total = ra.unwrap() + rb.unwrap();

    let seen_a = emitter_a.delivered.lock().await.clone();
    let seen_b = emitter_b.delivered.lock().await.clone();
    let disjoint: HashSet<_> = seen_a.iter().chain(seen_b.iter()).collect();

    assert_eq!(
        disjoint.len(),
        seen_a.len() + seen_b.len(),
        "a payload was delivered by both processors"
    );
    assert_eq!(total, 20);
    assert_eq!(store.count_with_status(OutboxStatus::Sent).await, 20);
}

#[tokio::test]
async fn interleaved_processing_and_cleanup_do_not_overlap() {
    let store = Arc::new(MemoryOutboxStore::new());

    // Due pending rows about to be processed.
    for i in 0..5 {
        store
            .insert(OutboxMessage::pending(
                format!("due-{i}"),
                Utc::now() - chrono::Duration::seconds(1),
            ))
            .await
            .unwrap();
    }
    // Expired sent rows about to be cleaned.
    for i in 0..5 {
        let mut row = OutboxMessage::pending(
            format!("expired-{i}"),
            Utc::now() - chrono::Duration::days(10),
        );
        row.status = OutboxStatus::Sent;
        store.insert(row).await.unwrap();
    }

    let emitter = RecordingEmitter::default();
    let processor = OutboxProcessor::new(
        "wait",
        Arc::clone(&store),
        Arc::new(emitter.clone()),
        quick_config(),
    );

    let (processed, deleted) = tokio::join!(processor.process_cycle(), processor.cleanup_cycle());
    assert_eq!(processed.unwrap(), 5);
    assert_eq!(deleted.unwrap(), 5);

    // Every processed payload was a due row; no freshly-sent row was deleted.
    let delivered = emitter.delivered.lock().await.clone();
    assert!(delivered.iter().all(|p| p.starts_with("due-")));
    assert_eq!(store.count_with_status(OutboxStatus::Sent).await, 5);
    assert_eq!(store.count_with_status(OutboxStatus::Pending).await, 0);
}

#[tokio::test]
async fn retry_redelivery_eventually_resumes_past_the_try() {
    let registry = Arc::new(DefinitionRegistry::new());
    registry
        .register(WorkflowDefinition::from_yaml(SWITCH_DEMO).unwrap())
        .await;
    let definition = registry.get("switch-demo", "0.1.0").await.unwrap();

    let wait_outbox = Arc::new(MemoryOutboxStore::new());
    let retry_outbox = Arc::new(MemoryOutboxStore::new());
    let consumer = Consumer::new(
        Arc::clone(&registry),
        standard_provider(Arc::clone(&registry)),
        SecretStore::default(),
        Arc::clone(&wait_outbox) as Arc<dyn OutboxQueue>,
        Arc::clone(&retry_outbox) as Arc<dyn OutboxQueue>,
    );

    let mut payload = WorkflowInstance::initial_message(&definition, json!("retry"))
        .to_json()
        .unwrap();

    // Two retry hops park snapshots; the third resumes the try normally.
    for hop in 0..3 {
        let next = consumer.consume(&payload).await.unwrap();
        assert!(next.is_none());

        let pending: Vec<OutboxMessage> = retry_outbox
            .all()
            .await
            .into_iter()
            .filter(|row| row.status == OutboxStatus::Pending)
            .collect();

        if hop < 2 {
            assert_eq!(pending.len(), 1, "hop {hop} must park a retry snapshot");
            payload = pending[0].message.clone();
            // Mark consumed so the next hop sees a clean queue.
            let mut row = pending[0].clone();
            row.status = OutboxStatus::Sent;
            let mut tx = retry_outbox.begin().await.unwrap();
            retry_outbox.update(&mut tx, &[row]).await.unwrap();
            retry_outbox.commit(tx).await.unwrap();
        } else {
            assert!(pending.is_empty(), "retry budget exhausted, no more rows");
        }
    }
}
