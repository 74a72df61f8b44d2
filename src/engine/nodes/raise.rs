use std::sync::Arc;

use serde_json::Value;

use crate::dsl::ErrorDefinition;
use crate::engine::WorkflowInstance;
use crate::error::{ErrorKind, WorkflowError};
use crate::expressions;
use crate::tree::NodeId;

/// Synthesize a workflow error from the declared fields (each of which may be
/// an expression) and raise it.
pub(crate) fn execute(
    instance: &mut WorkflowInstance,
    id: NodeId,
    definition: &ErrorDefinition,
    input: &Value,
) -> Result<(), WorkflowError> {
    let tree = Arc::clone(&instance.tree);
    let node = tree.node(id);
    let scope = instance.scope_for(id, input, None);

    let eval_text = |text: &str| -> Result<String, WorkflowError> {
        let value = expressions::evaluate(input, text, &scope)
            .map_err(|e| WorkflowError::from(e).at(&node.position))?;
        Ok(match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    };

    let type_text = eval_text(&definition.type_)?;
    // A bare identifier like `timeout` expands to the full error type URI.
    let error_type = ErrorKind::from_type(&type_text)
        .map(|kind| kind.uri())
        .unwrap_or(type_text);

    let status = match &definition.status {
        Value::Number(n) => n.as_u64().unwrap_or(500) as u16,
        Value::String(expr) => {
            let value = expressions::evaluate(input, expr, &scope)
                .map_err(|e| WorkflowError::from(e).at(&node.position))?;
            value.as_u64().unwrap_or(500) as u16
        }
        _ => 500,
    };

    let title = eval_text(&definition.title)?;
    let detail = definition.detail.as_deref().map(eval_text).transpose()?;

    Err(WorkflowError {
        error_type,
        status,
        title,
        detail,
        instance: Some(node.position.to_string()),
    })
}
