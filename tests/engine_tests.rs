//! Engine-level tests: traversal, scope, retries, snapshots.
//!
//! Waits and retries are not slept through here; the instance is
//! re-hydrated from its own snapshot instead, the way a redelivered message
//! would be, which exercises the wire round-trip on every suspension.

use std::sync::Arc;
use std::time::Duration;

use rook::activities::standard_provider;
use rook::definitions::DefinitionRegistry;
use rook::dsl::WorkflowDefinition;
use rook::engine::{InstanceStatus, WorkflowInstance};
use rook::error::ErrorKind;
use rook::position::NodePosition;
use rook::secrets::SecretStore;
use rook::state::WorkflowMessage;
use rook::tree::NodeTree;
use serde_json::{json, Value};

async fn registry_with(yaml: &str) -> (Arc<DefinitionRegistry>, Arc<WorkflowDefinition>) {
    let registry = Arc::new(DefinitionRegistry::new());
    let definition = registry
        .register(WorkflowDefinition::from_yaml(yaml).expect("fixture parses"))
        .await;
    (registry, definition)
}

fn instance_for(
    registry: &Arc<DefinitionRegistry>,
    definition: &Arc<WorkflowDefinition>,
    message: &WorkflowMessage,
) -> WorkflowInstance {
    WorkflowInstance::from_message(
        Arc::clone(definition),
        message,
        SecretStore::default(),
        standard_provider(Arc::clone(registry)),
    )
    .expect("snapshot rehydrates")
}

/// Drive to a terminal status, re-hydrating from the snapshot at every
/// suspension point.
async fn drive(yaml: &str, input: Value) -> (InstanceStatus, Option<Value>) {
    let (registry, definition) = registry_with(yaml).await;
    let mut message = WorkflowInstance::initial_message(&definition, input);

    for _ in 0..64 {
        let mut instance = instance_for(&registry, &definition, &message);
        let status = instance.run().await.expect("engine run").clone();
        match status {
            InstanceStatus::Running
            | InstanceStatus::Waiting { .. }
            | InstanceStatus::Retrying { .. } => {
                let payload = instance.snapshot().to_json().expect("snapshot serializes");
                message = WorkflowMessage::from_json(&payload).expect("snapshot parses");
            }
            InstanceStatus::Completed => {
                return (status, instance.output().cloned());
            }
            InstanceStatus::Faulted { .. } => return (status, None),
            InstanceStatus::Pending => panic!("run cannot leave an instance pending"),
        }
    }
    panic!("workflow did not terminate within 64 hops");
}

const SWITCH_DEMO: &str = include_str!("fixtures/switch-demo.yaml");
const ORDER_FLOW: &str = include_str!("fixtures/order-flow.yaml");

#[tokio::test]
async fn sequence_passes_output_to_next_task() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: seq
  version: '0.1.0'
do:
  - double:
      set: {}
      input:
        from: '${ .n * 2 }'
  - describe:
      set: {}
      output:
        as: '${ { doubled: . } }'
"#;
    let (status, output) = drive(yaml, json!({"n": 21})).await;
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(output.unwrap(), json!({"doubled": 42}));
}

#[tokio::test]
async fn wait_parks_and_snapshot_resumes() {
    let (registry, definition) = registry_with(ORDER_FLOW).await;
    let message =
        WorkflowInstance::initial_message(&definition, json!({"quantity": 3, "unitPrice": 4}));

    let mut instance = instance_for(&registry, &definition, &message);
    let status = instance.run().await.unwrap().clone();
    let InstanceStatus::Waiting { delay } = status else {
        panic!("expected waiting, got {status:?}");
    };
    assert_eq!(delay, Duration::from_secs(2));

    let snapshot = instance.snapshot();
    assert_eq!(snapshot.position.to_string(), "/do/1/hold");

    // Round-trip the snapshot the way the wire would and resume.
    let payload = snapshot.to_json().unwrap();
    let reread = WorkflowMessage::from_json(&payload).unwrap();
    assert_eq!(reread, snapshot);

    let mut resumed = instance_for(&registry, &definition, &reread);
    let status = resumed.run().await.unwrap().clone();
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(
        resumed.output().cloned().unwrap(),
        json!({"total": 12, "label": "order of 3"})
    );
}

#[tokio::test]
async fn snapshot_child_indices_stay_in_bounds() {
    let (registry, definition) = registry_with(ORDER_FLOW).await;
    let message = WorkflowInstance::initial_message(&definition, json!({"quantity": 1, "unitPrice": 1}));
    let mut instance = instance_for(&registry, &definition, &message);
    instance.run().await.unwrap();

    let tree = NodeTree::build(&definition).unwrap();
    let snapshot = instance.snapshot();
    for (position, state) in &snapshot.states {
        let node = tree
            .lookup(&NodePosition::parse(position).unwrap())
            .expect("snapshot positions exist in the tree");
        assert!(
            state.child_index >= -1 && state.child_index <= node.children.len() as i32,
            "child index {} out of bounds at {position}",
            state.child_index
        );
    }
}

#[tokio::test]
async fn for_loop_accumulates_through_context() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: summing
  version: '0.1.0'
do:
  - sum:
      for:
        each: n
        in: '${ .numbers }'
      do:
        - add:
            set: {}
            export:
              as: '${ { sum: (($context.sum // 0) + $n) } }'
output:
  as: '${ $context.sum }'
"#;
    let (status, output) = drive(yaml, json!({"numbers": [1, 2, 3, 4]})).await;
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(output.unwrap(), json!(10));
}

#[tokio::test]
async fn for_loop_while_guard_stops_iteration() {
    // The guard runs before the iteration's item variable is bound, so it
    // watches accumulated state rather than the upcoming item.
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: bounded
  version: '0.1.0'
do:
  - walk:
      for:
        each: n
        in: '${ .numbers }'
      while: '${ ($context.count // 0) < 2 }'
      do:
        - tally:
            set: {}
            export:
              as: '${ { count: (($context.count // 0) + 1) } }'
output:
  as: '${ $context.count }'
"#;
    let (_, output) = drive(yaml, json!({"numbers": [1, 2, 3, 4, 5]})).await;
    assert_eq!(output.unwrap(), json!(2), "iteration must stop at the guard");
}

#[tokio::test]
async fn switch_routes_to_named_task() {
    let (status, output) = drive(SWITCH_DEMO, json!("task")).await;
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(output.unwrap(), json!("task-done"));
}

#[tokio::test]
async fn switch_default_exits_immediately() {
    let (status, _) = drive(SWITCH_DEMO, json!("completed")).await;
    assert_eq!(status, InstanceStatus::Completed);
}

#[tokio::test]
async fn guard_false_skips_task() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: guarded
  version: '0.1.0'
do:
  - skipped:
      set: {}
      if: '${ .enabled }'
      output:
        as: '${ "should not run" }'
  - ran:
      set: {}
      output:
        as: '${ { saw: . } }'
"#;
    let (_, output) = drive(yaml, json!({"enabled": false})).await;
    // The skipped task is transparent: its sibling sees the original input.
    assert_eq!(output.unwrap(), json!({"saw": {"enabled": false}}));
}

#[tokio::test]
async fn then_end_terminates_the_workflow() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: early-exit
  version: '0.1.0'
do:
  - first:
      set: {}
      output:
        as: '${ "early" }'
      then: end
  - never:
      raise:
        error:
          type: runtime
          status: 500
          title: must not run
"#;
    let (status, output) = drive(yaml, json!({})).await;
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(output.unwrap(), json!("early"));
}

#[tokio::test]
async fn fork_collects_branch_outputs() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: forked
  version: '0.1.0'
do:
  - both:
      fork:
        branches:
          - left:
              set: {}
              output:
                as: '${ "L" }'
          - right:
              set: {}
              output:
                as: '${ "R" }'
"#;
    let (_, output) = drive(yaml, json!({})).await;
    assert_eq!(output.unwrap(), json!(["L", "R"]));
}

#[tokio::test]
async fn fork_runs_activity_branches_concurrently() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: parallel-waits
  version: '0.1.0'
do:
  - both:
      fork:
        branches:
          - left:
              wait: PT1S
              output:
                as: '${ "L" }'
          - right:
              wait: PT1S
              output:
                as: '${ "R" }'
"#;
    let started = std::time::Instant::now();
    let (status, output) = drive(yaml, json!({})).await;
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(output.unwrap(), json!(["L", "R"]));
    assert!(
        started.elapsed() < Duration::from_millis(1800),
        "two one-second branches must overlap, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn fork_compete_takes_the_first_finisher() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: racing
  version: '0.1.0'
do:
  - race:
      fork:
        compete: true
        branches:
          - slow:
              wait: PT10S
              output:
                as: '${ "slow" }'
          - fast:
              wait: PT0.1S
              output:
                as: '${ "fast" }'
"#;
    let started = std::time::Instant::now();
    let (status, output) = drive(yaml, json!({})).await;
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(output.unwrap(), json!("fast"));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "the losing branch must be cancelled, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn catch_branch_handles_matching_error() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: caught
  version: '0.1.0'
do:
  - guarded:
      try:
        - explode:
            raise:
              error:
                type: timeout
                status: 408
                title: Took too long
      catch:
        errors:
          with:
            type: timeout
        as: failure
        do:
          - recover:
              set: {}
              output:
                as: '${ { recovered: $failure.title } }'
"#;
    let (status, output) = drive(yaml, json!({})).await;
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(output.unwrap(), json!({"recovered": "Took too long"}));
}

#[tokio::test]
async fn non_matching_filter_faults_the_workflow() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: unmatched
  version: '0.1.0'
do:
  - guarded:
      try:
        - explode:
            raise:
              error:
                type: runtime
                status: 500
                title: Nope
      catch:
        errors:
          with:
            type: timeout
        do:
          - recover:
              set:
                ok: true
"#;
    let (status, _) = drive(yaml, json!({})).await;
    let InstanceStatus::Faulted { error } = status else {
        panic!("expected fault, got {status:?}");
    };
    assert_eq!(error.kind(), ErrorKind::Runtime);
    assert_eq!(
        error.instance.as_deref(),
        Some("/do/0/guarded/try/0/explode")
    );
}

#[tokio::test]
async fn retry_schedules_with_bounded_delay() {
    let (registry, definition) = registry_with(SWITCH_DEMO).await;
    let message = WorkflowInstance::initial_message(&definition, json!("retry"));
    let mut instance = instance_for(&registry, &definition, &message);

    let status = instance.run().await.unwrap().clone();
    let InstanceStatus::Retrying { delay } = status else {
        panic!("expected retrying, got {status:?}");
    };
    // PT1S with ±20% jitter, floor 100 ms.
    assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
    assert_eq!(instance.snapshot().position.to_string(), "/do/2/doRetry");
}

#[tokio::test]
async fn retry_budget_is_honored_then_try_resumes() {
    let (registry, definition) = registry_with(SWITCH_DEMO).await;
    let mut message = WorkflowInstance::initial_message(&definition, json!("retry"));

    let mut retries = 0;
    loop {
        let mut instance = instance_for(&registry, &definition, &message);
        let status = instance.run().await.unwrap().clone();
        match status {
            InstanceStatus::Retrying { .. } => {
                retries += 1;
                assert!(retries <= 2, "retry budget of 2 exceeded");
                message = instance.snapshot();
            }
            InstanceStatus::Completed => break,
            other => panic!("unexpected status {other:?}"),
        }
    }
    // limit.attempt.count = 2 and no catch branch: after two retries the try
    // resumes as if its body had completed.
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn uncaught_error_faults_at_the_raising_node() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: doomed
  version: '0.1.0'
do:
  - kaboom:
      raise:
        error:
          type: runtime
          status: 500
          title: Kaboom
          detail: '${ "input was " + (. | tostring) }'
"#;
    let (registry, definition) = registry_with(yaml).await;
    let message = WorkflowInstance::initial_message(&definition, json!("x"));
    let mut instance = instance_for(&registry, &definition, &message);

    let status = instance.run().await.unwrap().clone();
    let InstanceStatus::Faulted { error } = status else {
        panic!("expected fault");
    };
    assert_eq!(error.title, "Kaboom");
    assert_eq!(error.detail.as_deref(), Some("input was \"x\""));
    assert_eq!(instance.snapshot().position.to_string(), "/do/0/kaboom");
}

#[tokio::test]
async fn set_variables_are_visible_to_later_siblings() {
    let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: shared-vars
  version: '0.1.0'
do:
  - remember:
      set:
        greeting: '${ "hello " + .name }'
  - use-it:
      set: {}
      output:
        as: '${ $greeting }'
"#;
    let (_, output) = drive(yaml, json!({"name": "ada"})).await;
    assert_eq!(output.unwrap(), json!("hello ada"));
}

#[tokio::test]
async fn sub_workflow_awaits_child_output() {
    let child = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: child
  version: '0.1.0'
do:
  - answer:
      set: {}
      output:
        as: '${ .n + 1 }'
"#;
    let parent = r#"
document:
  dsl: '1.0.0'
  namespace: tests
  name: parent
  version: '0.1.0'
do:
  - delegate:
      run:
        workflow:
          name: child
          version: '0.1.0'
          input:
            n: '${ .n }'
"#;
    let registry = Arc::new(DefinitionRegistry::new());
    registry
        .register(WorkflowDefinition::from_yaml(child).unwrap())
        .await;
    let definition = registry
        .register(WorkflowDefinition::from_yaml(parent).unwrap())
        .await;

    let mut message = WorkflowInstance::initial_message(&definition, json!({"n": 41}));
    loop {
        let mut instance = instance_for(&registry, &definition, &message);
        match instance.run().await.unwrap().clone() {
            InstanceStatus::Running => message = instance.snapshot(),
            InstanceStatus::Completed => {
                assert_eq!(instance.output().cloned().unwrap(), json!(42));
                break;
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}
