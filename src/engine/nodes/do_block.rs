use std::sync::Arc;

use serde_json::Value;

use crate::engine::WorkflowInstance;
use crate::error::WorkflowError;
use crate::tree::NodeId;

/// Sequence continuation, shared by `do` blocks and the root.
///
/// Advances the child cursor; the next child's raw input is the node's
/// current raw output (the previous child's result, or the transformed input
/// before any child ran). Past the last child, control falls to `then()`.
pub(crate) fn continue_node(
    instance: &mut WorkflowInstance,
    id: NodeId,
) -> Result<Option<NodeId>, WorkflowError> {
    let tree = Arc::clone(&instance.tree);
    let node = tree.node(id);

    let index = {
        let state = instance.state_mut(id);
        state.child_index += 1;
        state.child_index
    };

    let slot = usize::try_from(index).ok();
    match slot.and_then(|slot| node.children.get(slot)) {
        Some(child) => {
            let input = instance
                .states
                .get(&id)
                .and_then(|s| s.raw_output.clone())
                .unwrap_or(Value::Null);
            instance.state_mut(*child).raw_input = Some(input);
            Ok(Some(*child))
        }
        None => instance.then_node(id, None),
    }
}
