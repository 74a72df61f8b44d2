use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::backoff;
use crate::dsl::{CatchClause, RetryRef};
use crate::engine::WorkflowInstance;
use crate::error::{ErrorKind, WorkflowError};
use crate::expressions::{self, is_truthy, Scope};
use crate::tree::NodeId;

/// How a caught error is resolved.
pub(crate) enum Recovery {
    /// Re-run the body after the delay; the consumer parks the snapshot.
    Retry { delay: Duration },
    /// Enter the catch branch.
    CatchBranch { entry: NodeId },
    /// No catch branch: the try completes as if its body had succeeded.
    Resume { next: Option<NodeId> },
}

/// Normal (non-error) continuation: enter the body once, then fall through.
/// The catch branch is only ever entered through [`recover`].
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

    if index == 0 {
        let input = instance
            .states
            .get(&id)
            .and_then(|s| s.raw_output.clone())
            .unwrap_or(Value::Null);
        let Some(body) = node.children.first() else {
            return instance.then_node(id, None);
        };
        instance.state_mut(*body).raw_input = Some(input);
        Ok(Some(*body))
    } else {
        instance.then_node(id, None)
    }
}

/// Whether this try's catch filter accepts the error: the `with` fields must
/// all match, `when` (if present) must hold and `exceptWhen` must not.
pub(crate) fn catch_matches(
    instance: &mut WorkflowInstance,
    id: NodeId,
    catch: &CatchClause,
    error: &WorkflowError,
) -> Result<bool, WorkflowError> {
    let error_value = serde_json::to_value(error).unwrap_or(Value::Null);

    if let Some(filter) = &catch.errors
        && let Some(with) = &filter.with
    {
        for (key, expected) in with {
            let actual = error_value.get(key.as_str());
            let matched = match actual {
                Some(actual) => values_match(key, expected, actual),
                None => false,
            };
            if !matched {
                return Ok(false);
            }
        }
    }

    if catch.when.is_none() && catch.except_when.is_none() {
        return Ok(true);
    }

    let input = instance.transformed_input(id)?;
    let var_name = catch.as_.as_deref().unwrap_or("error");
    let scope = Scope::new()
        .with_var(var_name, error_value.clone())
        .layered(instance.scope_for(id, &input, None).flatten());

    if let Some(when) = &catch.when {
        let verdict = expressions::evaluate_jq(&error_value, when, &scope)?;
        if !is_truthy(&verdict) {
            return Ok(false);
        }
    }
    if let Some(except) = &catch.except_when {
        let verdict = expressions::evaluate_jq(&error_value, except, &scope)?;
        if is_truthy(&verdict) {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Decide retry versus catch for an error this try has accepted.
pub(crate) fn recover(
    instance: &mut WorkflowInstance,
    id: NodeId,
    catch: &CatchClause,
    error: &WorkflowError,
) -> Result<Recovery, (NodeId, WorkflowError)> {
    let tree = Arc::clone(&instance.tree);

    match retry_delay(instance, id, catch).map_err(|e| (id, e))? {
        Some(delay) => {
            let state = instance.state_mut(id);
            state.attempt_index += 1;
            state.child_index = -1;
            instance.clear_subtree(id);
            Ok(Recovery::Retry { delay })
        }
        None => {
            let error_value = serde_json::to_value(error).unwrap_or(Value::Null);
            let var_name = catch.as_.clone().unwrap_or_else(|| "error".to_string());
            instance
                .state_mut(id)
                .variables
                .insert(var_name, error_value);

            let catch_entry = tree
                .node(id)
                .children
                .iter()
                .copied()
                .find(|child| tree.node(*child).name == "catch");

            match catch_entry {
                Some(entry) => {
                    let input = instance.transformed_input(id).map_err(|e| (id, e))?;
                    let slot = tree
                        .node(id)
                        .children
                        .iter()
                        .position(|child| *child == entry)
                        .unwrap_or(1);
                    #[allow(clippy::cast_possible_wrap)]
                    {
                        instance.state_mut(id).child_index = slot as i32;
                    }
                    instance.state_mut(entry).raw_input = Some(input);
                    Ok(Recovery::CatchBranch { entry })
                }
                None => {
                    if instance
                        .states
                        .get(&id)
                        .and_then(|s| s.raw_output.as_ref())
                        .is_none()
                    {
                        let input = instance.transformed_input(id).map_err(|e| (id, e))?;
                        instance.state_mut(id).raw_output = Some(input);
                    }
                    let next = instance.then_node(id, None).map_err(|e| (id, e))?;
                    Ok(Recovery::Resume { next })
                }
            }
        }
    }
}

/// The delay before the next retry, or None when no retry policy applies or
/// the attempt budget is spent.
fn retry_delay(
    instance: &mut WorkflowInstance,
    id: NodeId,
    catch: &CatchClause,
) -> Result<Option<Duration>, WorkflowError> {
    let Some(retry) = &catch.retry else {
        return Ok(None);
    };

    let policy = match retry {
        RetryRef::Policy(policy) => policy.clone(),
        RetryRef::Named(name) => instance
            .definition
            .retry_policy(name)
            .cloned()
            .ok_or_else(|| {
                WorkflowError::configuration("Unknown retry policy")
                    .with_detail(format!("no policy named '{name}' under use.retries"))
            })?,
    };

    let attempts = instance
        .states
        .get(&id)
        .map(|s| s.attempt_index)
        .unwrap_or(0);
    if let Some(limit) = policy
        .limit
        .as_ref()
        .and_then(|l| l.attempt.as_ref())
        .and_then(|a| a.count)
        && attempts >= limit
    {
        return Ok(None);
    }

    let initial = policy.delay.to_duration().map_err(|e| {
        WorkflowError::configuration("Invalid retry delay").with_detail(e.to_string())
    })?;
    Ok(Some(backoff::delay_for_attempt(initial, attempts + 1)))
}

/// Loose comparison: numbers compare by value, the `type` field also accepts
/// the bare identifier form of an error type URI.
fn values_match(key: &str, expected: &Value, actual: &Value) -> bool {
    if key == "type"
        && let (Value::String(expected), Value::String(actual)) = (expected, actual)
        && let Some(kind) = ErrorKind::from_type(expected)
        && kind.uri() == *actual
    {
        return true;
    }

    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => e.as_f64() == a.as_f64(),
        _ => expected == actual,
    }
}
