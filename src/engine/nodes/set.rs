use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::engine::WorkflowInstance;
use crate::error::WorkflowError;
use crate::expressions;
use crate::tree::NodeId;

/// Evaluate each entry and merge the results into the parent's variable
/// overlay, where following siblings (and their descendants) can see them.
/// The task itself passes its input through unchanged.
pub(crate) fn execute(
    instance: &mut WorkflowInstance,
    id: NodeId,
    values: &IndexMap<String, Value>,
    input: &Value,
) -> Result<(), WorkflowError> {
    let tree = Arc::clone(&instance.tree);
    let node = tree.node(id);
    let scope = instance.scope_for(id, input, None);

    let mut evaluated = Vec::with_capacity(values.len());
    for (key, template) in values {
        let value = expressions::evaluate_value(input, template, &scope)
            .map_err(|e| WorkflowError::from(e).at(&node.position))?;
        evaluated.push((key.clone(), value));
    }

    if let Some(parent) = node.parent {
        let variables = &mut instance.state_mut(parent).variables;
        for (key, value) in evaluated {
            variables.insert(key, value);
        }
    }

    instance.state_mut(id).raw_output = Some(input.clone());
    Ok(())
}
