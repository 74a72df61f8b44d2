use std::sync::Arc;

use serde_json::Value;

use crate::dsl::ForClause;
use crate::engine::WorkflowInstance;
use crate::error::WorkflowError;
use crate::expressions::{self, is_truthy};
use crate::tree::NodeId;

/// Loop continuation.
///
/// The collection is evaluated lazily from the transformed input, so it is
/// stable across resumes. Each iteration overlays the item and index
/// variables on the loop node's scope and feeds the body the previous
/// iteration's output.
pub(crate) fn continue_node(
    instance: &mut WorkflowInstance,
    id: NodeId,
    clause: &ForClause,
    while_: Option<&str>,
) -> Result<Option<NodeId>, WorkflowError> {
    let tree = Arc::clone(&instance.tree);
    let node = tree.node(id);

    let input = instance.transformed_input(id)?;
    let scope = instance.scope_for(id, &input, None);
    let collection = expressions::evaluate_jq(&input, &clause.in_, &scope)
        .map_err(|e| WorkflowError::from(e).at(&node.position))?;
    let Value::Array(items) = collection else {
        return Err(
            WorkflowError::expression("Loop collection must be an array")
                .with_detail(format!("'for.in' produced {collection}"))
                .at(&node.position),
        );
    };

    let index = {
        let state = instance.state_mut(id);
        state.for_index += 1;
        state.for_index
    };

    let Some(item) = usize::try_from(index)
        .ok()
        .and_then(|slot| items.get(slot))
    else {
        return instance.then_node(id, None);
    };

    let iteration_input = instance
        .states
        .get(&id)
        .and_then(|s| s.raw_output.clone())
        .unwrap_or_else(|| input.clone());

    // The guard runs before this iteration's item and index variables are
    // bound; it sees the scope as the previous iteration left it.
    if let Some(guard) = while_ {
        let scope = instance.scope_for(id, &iteration_input, None);
        let verdict = expressions::evaluate_jq(&iteration_input, guard, &scope)
            .map_err(|e| WorkflowError::from(e).at(&node.position))?;
        if !is_truthy(&verdict) {
            return instance.then_node(id, None);
        }
    }

    {
        let state = instance.state_mut(id);
        state.variables.insert(clause.each.clone(), item.clone());
        state
            .variables
            .insert(clause.at.clone(), serde_json::json!(index));
    }

    let Some(body) = node.children.first() else {
        return instance.then_node(id, None);
    };
    instance.state_mut(*body).raw_input = Some(iteration_input);
    Ok(Some(*body))
}
