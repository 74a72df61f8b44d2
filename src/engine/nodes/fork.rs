use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::debug;

use crate::engine::{InstanceStatus, WorkflowInstance};
use crate::error::WorkflowError;
use crate::tree::NodeId;

/// Sequential branch continuation, taken only when no branch contains an
/// activity. Branches whose subtrees perform external effects go through
/// [`execute_branches`] instead and run concurrently.
pub(crate) fn continue_node(
    instance: &mut WorkflowInstance,
    id: NodeId,
    compete: bool,
) -> Result<Option<NodeId>, WorkflowError> {
    let tree = Arc::clone(&instance.tree);
    let node = tree.node(id);

    let index = {
        let state = instance.state_mut(id);
        state.child_index += 1;
        state.child_index
    };

    let slot = usize::try_from(index).ok();
    if let Some(branch) = slot.and_then(|slot| node.children.get(slot)) {
        let input = instance.transformed_input(id)?;
        instance.state_mut(*branch).raw_input = Some(input);
        return Ok(Some(*branch));
    }

    if compete {
        let state = instance.state_mut(id);
        let winner = match &state.raw_output {
            Some(Value::Array(outputs)) => outputs.first().cloned().unwrap_or(Value::Null),
            other => other.clone().unwrap_or(Value::Null),
        };
        state.raw_output = Some(winner);
    }

    instance.then_node(id, None)
}

/// What one finished branch hands back to the owning instance.
struct BranchOutcome {
    output: Value,
    context: Map<String, Value>,
    variables: Map<String, Value>,
}

/// Run every branch concurrently, each on its own task driving a detached
/// clone of the instance, and join.
///
/// Outputs collect into the fork's raw output in declaration order regardless
/// of finish order. With `compete`, the first branch to finish wins and the
/// rest are cancelled. Context exports and fork-level variables written by a
/// branch merge back by key, in the same order as the outputs.
pub(crate) async fn execute_branches(
    instance: &mut WorkflowInstance,
    id: NodeId,
    compete: bool,
) -> Result<(), WorkflowError> {
    let tree = Arc::clone(&instance.tree);
    let node = tree.node(id);
    let input = instance.transformed_input(id)?;

    // Clean accumulator; every branch clone starts from it and pushes exactly
    // one element.
    instance.state_mut(id).raw_output = Some(Value::Array(Vec::new()));

    let mut branches = JoinSet::new();
    for (slot, branch) in node.children.iter().copied().enumerate() {
        let mut clone = instance.branch_clone(id);
        clone.state_mut(branch).raw_input = Some(input.clone());
        branches.spawn(async move { (slot, drive(clone, id, branch).await) });
    }
    debug!(position = %node.position, count = node.children.len(), compete, "forked branches");

    if compete {
        // First finisher wins; dropping the set cancels the losers.
        let winner = match branches.join_next().await {
            Some(joined) => {
                let (_slot, result) = joined.map_err(|e| {
                    WorkflowError::runtime("Branch task failed")
                        .with_detail(e.to_string())
                        .at(&node.position)
                })?;
                let outcome = result?;
                merge_scope(instance, id, &outcome);
                outcome.output
            }
            None => Value::Null,
        };
        instance.state_mut(id).raw_output = Some(winner);
        return Ok(());
    }

    let mut outcomes: Vec<(usize, BranchOutcome)> = Vec::with_capacity(node.children.len());
    while let Some(joined) = branches.join_next().await {
        let (slot, result) = joined.map_err(|e| {
            WorkflowError::runtime("Branch task failed")
                .with_detail(e.to_string())
                .at(&node.position)
        })?;
        outcomes.push((slot, result?));
    }
    outcomes.sort_by_key(|(slot, _)| *slot);

    let mut outputs = Vec::with_capacity(outcomes.len());
    for (_, outcome) in &outcomes {
        merge_scope(instance, id, outcome);
        outputs.push(outcome.output.clone());
    }
    instance.state_mut(id).raw_output = Some(Value::Array(outputs));
    Ok(())
}

type BranchFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<BranchOutcome, WorkflowError>> + Send>>;

/// Drive one branch clone to completion; waits and retry delays inside a
/// branch sleep in place, since no outbox sits between a fork and its
/// branches. A branch fault surfaces to the owning instance, which re-raises
/// it at the fork. Boxed: the branch future contains the engine's own run
/// future, and a nested fork would otherwise recurse at the type level.
fn drive(mut instance: WorkflowInstance, fork: NodeId, branch: NodeId) -> BranchFuture {
    Box::pin(async move {
        instance.cursor = branch;
        loop {
            let status = instance
                .run()
                .await
                .map_err(|e| {
                    WorkflowError::runtime("Branch execution error").with_detail(e.to_string())
                })?
                .clone();

            match status {
                InstanceStatus::Pending | InstanceStatus::Running => {}
                InstanceStatus::Waiting { delay } | InstanceStatus::Retrying { delay } => {
                    tokio::time::sleep(delay).await;
                }
                InstanceStatus::Completed => break,
                InstanceStatus::Faulted { error } => return Err(error),
            }
        }

        let output = match instance.states.get(&fork).and_then(|s| s.raw_output.clone()) {
            Some(Value::Array(mut outputs)) => outputs.pop().unwrap_or(Value::Null),
            other => other.unwrap_or(Value::Null),
        };
        let root = instance.tree.root_id();
        let context = instance
            .states
            .get(&root)
            .map(|s| s.context.clone())
            .unwrap_or_default();
        let variables = instance
            .states
            .get(&fork)
            .map(|s| s.variables.clone())
            .unwrap_or_default();

        Ok(BranchOutcome {
            output,
            context,
            variables,
        })
    })
}

fn merge_scope(instance: &mut WorkflowInstance, id: NodeId, outcome: &BranchOutcome) {
    if !outcome.context.is_empty() {
        let context = &mut instance.root_state_mut().context;
        for (key, value) in &outcome.context {
            context.insert(key.clone(), value.clone());
        }
    }
    if !outcome.variables.is_empty() {
        let variables = &mut instance.state_mut(id).variables;
        for (key, value) in &outcome.variables {
            variables.insert(key.clone(), value.clone());
        }
    }
}
