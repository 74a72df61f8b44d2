use std::sync::Arc;

use serde_json::Value;

use crate::dsl::{FlowDirective, SwitchItem};
use crate::engine::WorkflowInstance;
use crate::error::WorkflowError;
use crate::expressions::{self, is_truthy};
use crate::tree::NodeId;

/// Evaluate the cases in declaration order and remember the first match's
/// directive; a case without `when` is the default. When nothing matches the
/// directive stays unset and `then()` falls back to CONTINUE.
pub(crate) fn execute(
    instance: &mut WorkflowInstance,
    id: NodeId,
    cases: &[SwitchItem],
    input: &Value,
) -> Result<(), WorkflowError> {
    let tree = Arc::clone(&instance.tree);
    let node = tree.node(id);
    let scope = instance.scope_for(id, input, None);

    for item in cases {
        let matches = match &item.case.when {
            Some(when) => {
                let verdict = expressions::evaluate_jq(input, when, &scope)
                    .map_err(|e| WorkflowError::from(e).at(&node.position))?;
                is_truthy(&verdict)
            }
            None => true,
        };
        if matches {
            let directive = item.case.then.clone().unwrap_or(FlowDirective::Continue);
            instance.directives.insert(id, directive);
            break;
        }
    }

    instance.state_mut(id).raw_output = Some(input.clone());
    Ok(())
}
