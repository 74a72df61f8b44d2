//! The workflow instance engine.
//!
//! One instance owns the mutable state of a single snapshot and drives the
//! cursor forward until the next suspension point: an executed activity, a
//! wait, a pending retry, completion, or an uncaught fault. All traversal is
//! synchronous; only activity dispatch awaits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use snafu::prelude::*;
use tracing::debug;
use uuid::Uuid;

use crate::activities::{ActivityContext, ActivityOutcome, RunnerProvider};
use crate::descriptors::{RuntimeDescriptor, TaskDescriptor, WorkflowDescriptor, WorkflowNaming};
use crate::dsl::{FlowDirective, WorkflowDefinition};
use crate::error::WorkflowError;
use crate::expressions::{self, Scope};
use crate::position::NodePosition;
use crate::schema;
use crate::secrets::SecretStore;
use crate::state::{NodeState, WorkflowMessage};
use crate::tree::{self, NodeId, NodeKind, NodeTree};

mod nodes;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unknown position in snapshot: {position}"))]
    UnknownPosition { position: String },

    #[snafu(display("Tree build error: {source}"))]
    Tree { source: tree::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<tree::Error> for Error {
    fn from(source: tree::Error) -> Self {
        Error::Tree { source }
    }
}

/// Where a `run()` call left the instance.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceStatus {
    /// Not yet run.
    Pending,
    /// An activity completed; the next snapshot should go back on the wire.
    Running,
    /// A wait activity was reached; redeliver after the delay.
    Waiting { delay: Duration },
    /// A caught error is pending a retry; redeliver after the delay.
    Retrying { delay: Duration },
    /// The root was exited; nothing further to deliver.
    Completed,
    /// An uncaught error; the final snapshot carries the diagnostics.
    Faulted { error: WorkflowError },
}

/// Traversal step: where the walk goes next.
enum Step {
    Enter(NodeId),
    Activity(NodeId),
    /// A fork whose branches contain activities; they run concurrently.
    Branches(NodeId),
    End,
    Halt,
}

type Walk = std::result::Result<Step, (NodeId, WorkflowError)>;

pub struct WorkflowInstance {
    pub(crate) tree: Arc<NodeTree>,
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) states: HashMap<NodeId, NodeState>,
    pub(crate) transformed_inputs: HashMap<NodeId, Value>,
    pub(crate) directives: HashMap<NodeId, FlowDirective>,
    pub(crate) secrets: SecretStore,
    runners: RunnerProvider,
    status: InstanceStatus,
    cursor: NodeId,
    final_output: Option<Value>,
    /// Set on a fork-branch clone: traversal stops when control returns to
    /// this node instead of leaving the branch subtree.
    barrier: Option<NodeId>,
}

impl WorkflowInstance {
    /// Rehydrate an instance from a snapshot.
    pub fn from_message(
        definition: Arc<WorkflowDefinition>,
        message: &WorkflowMessage,
        secrets: SecretStore,
        runners: RunnerProvider,
    ) -> Result<Self> {
        let tree = tree::cached_tree(&definition)?;

        let mut states = HashMap::new();
        for (position_text, state) in &message.states {
            let position =
                NodePosition::parse(position_text).map_err(|_| Error::UnknownPosition {
                    position: position_text.clone(),
                })?;
            let node = tree.lookup(&position).context(UnknownPositionSnafu {
                position: position_text.clone(),
            })?;
            states.insert(node.id, state.clone());
        }

        let cursor = tree
            .lookup(&message.position)
            .context(UnknownPositionSnafu {
                position: message.position.to_string(),
            })?
            .id;

        Ok(Self {
            tree,
            definition,
            states,
            transformed_inputs: HashMap::new(),
            directives: HashMap::new(),
            secrets,
            runners,
            status: InstanceStatus::Pending,
            cursor,
            final_output: None,
            barrier: None,
        })
    }

    /// A detached copy that drives a single branch of `fork`; its traversal
    /// never crosses the fork node.
    pub(crate) fn branch_clone(&self, fork: NodeId) -> Self {
        Self {
            tree: Arc::clone(&self.tree),
            definition: Arc::clone(&self.definition),
            states: self.states.clone(),
            transformed_inputs: self.transformed_inputs.clone(),
            directives: HashMap::new(),
            secrets: self.secrets.clone(),
            runners: self.runners.clone(),
            status: InstanceStatus::Pending,
            cursor: fork,
            final_output: None,
            barrier: Some(fork),
        }
    }

    /// The snapshot that starts a fresh instance of `definition`.
    #[must_use]
    pub fn initial_message(definition: &WorkflowDefinition, input: Value) -> WorkflowMessage {
        let mut message = WorkflowMessage::new(
            definition.document.name.clone(),
            definition.document.version.clone(),
        );
        message.set_state(
            &NodePosition::root(),
            NodeState {
                raw_input: Some(input),
                workflow_id: Some(Uuid::new_v4().to_string()),
                ..NodeState::default()
            },
        );
        message
    }

    #[must_use]
    pub fn status(&self) -> &InstanceStatus {
        &self.status
    }

    #[must_use]
    pub fn workflow_id(&self) -> Option<String> {
        self.states
            .get(&self.tree.root_id())
            .and_then(|s| s.workflow_id.clone())
    }

    /// The workflow output, available once the status is `Completed`.
    #[must_use]
    pub fn output(&self) -> Option<&Value> {
        self.final_output.as_ref()
    }

    /// Serialize the current state and cursor; only non-default node states
    /// are captured.
    #[must_use]
    pub fn snapshot(&self) -> WorkflowMessage {
        let mut message = WorkflowMessage::new(self.tree.name.clone(), self.tree.version.clone());
        for node in self.tree.iter() {
            if let Some(state) = self.states.get(&node.id) {
                message.set_state(&node.position, state.clone());
            }
        }
        message.position = self.tree.node(self.cursor).position.clone();
        message
    }

    /// Advance the instance until the next suspension point.
    pub async fn run(&mut self) -> Result<&InstanceStatus> {
        self.status = InstanceStatus::Running;
        let mut walk = self.seed();

        loop {
            match walk {
                Ok(Step::Enter(id)) => walk = self.traverse_from(id),
                Ok(Step::Activity(id)) => {
                    self.cursor = id;
                    match self.execute_activity(id).await {
                        Ok(()) => break,
                        Err(error) => walk = Err((id, error)),
                    }
                }
                Ok(Step::Branches(id)) => {
                    self.cursor = id;
                    walk = match self.run_branches(id).await {
                        Ok(()) => self
                            .then_node(id, None)
                            .map(|next| match next {
                                Some(next) => Step::Enter(next),
                                None => Step::End,
                            })
                            .map_err(|e| (id, e)),
                        Err(error) => Err((id, error)),
                    };
                }
                Ok(Step::End) => {
                    self.cursor = self.tree.root_id();
                    self.status = InstanceStatus::Completed;
                    break;
                }
                Ok(Step::Halt) => break,
                Err((at, error)) => walk = self.recover(at, error),
            }
        }

        Ok(&self.status)
    }

    // -- traversal ---------------------------------------------------------

    /// Resolve the resume cursor: a node that already carries raw output was
    /// executed in a previous hop, so its `then` is taken first (a `try`
    /// cursor is the exception: it resumes by re-running its body).
    fn seed(&mut self) -> Walk {
        let current = self.cursor;
        let completed = self
            .states
            .get(&current)
            .is_some_and(NodeState::is_completed);
        let is_try = matches!(self.tree.node(current).kind, NodeKind::Try { .. });

        if completed && !is_try {
            let next = self.then_node(current, None).map_err(|e| (current, e))?;
            Ok(match next {
                Some(id) => Step::Enter(id),
                None => Step::End,
            })
        } else {
            Ok(Step::Enter(current))
        }
    }

    /// Walk downward from `id` until an activity is ready to execute or the
    /// walk falls off the root.
    fn traverse_from(&mut self, id: NodeId) -> Walk {
        let tree = Arc::clone(&self.tree);
        let mut next = Some(id);

        while let Some(id) = next {
            if !self.should_start(id).map_err(|e| (id, e))? {
                next = match tree.node(id).parent {
                    Some(parent) => self.continue_node(parent).map_err(|e| (parent, e))?,
                    None => None,
                };
                continue;
            }

            if tree.node(id).kind.is_activity() {
                return Ok(Step::Activity(id));
            }

            // A fork over activity-bearing branches runs them concurrently;
            // only activity-free forks take the cheap sequential path below.
            if matches!(tree.node(id).kind, NodeKind::Fork { .. })
                && tree.subtree_has_activity(id)
            {
                return Ok(Step::Branches(id));
            }

            self.execute_flow(id).map_err(|e| (id, e))?;
            next = self.continue_node(id).map_err(|e| (id, e))?;
        }

        Ok(Step::End)
    }

    // -- node runtime ------------------------------------------------------

    pub(crate) fn state_mut(&mut self, id: NodeId) -> &mut NodeState {
        self.states.entry(id).or_default()
    }

    pub(crate) fn root_state_mut(&mut self) -> &mut NodeState {
        let root = self.tree.root_id();
        self.state_mut(root)
    }

    /// The evaluation scope at `id`: task-level bindings first, then variable
    /// overlays walking up the parent chain, finally the root layer with
    /// context, secrets and descriptors. Inner layers always win.
    pub(crate) fn scope_for(&self, id: NodeId, input: &Value, output: Option<&Value>) -> Scope {
        let node = self.tree.node(id);

        let mut task_layer = Map::new();
        task_layer.insert(
            "task".to_string(),
            serde_json::to_value(TaskDescriptor {
                name: node.name.clone(),
                reference: node.position.to_string(),
                input: input.clone(),
                output: output.cloned(),
                started_at: self
                    .states
                    .get(&id)
                    .and_then(|s| s.started_at)
                    .map(Into::into),
            })
            .unwrap_or(Value::Null),
        );
        task_layer.insert("input".to_string(), input.clone());
        if let Some(output) = output {
            task_layer.insert("output".to_string(), output.clone());
        }

        let mut scope = Scope::new().layered(task_layer);

        let mut walk = Some(id);
        while let Some(current) = walk {
            if let Some(state) = self.states.get(&current)
                && !state.variables.is_empty()
            {
                scope = scope.layered(state.variables.clone());
            }
            walk = self.tree.node(current).parent;
        }

        let root_state = self.states.get(&self.tree.root_id());
        let mut root_layer = Map::new();
        root_layer.insert(
            "context".to_string(),
            Value::Object(root_state.map(|s| s.context.clone()).unwrap_or_default()),
        );
        root_layer.insert(
            "secrets".to_string(),
            Value::Object(self.secrets.as_object()),
        );
        root_layer.insert(
            "workflow".to_string(),
            serde_json::to_value(WorkflowDescriptor {
                id: self.workflow_id().unwrap_or_default(),
                definition: WorkflowNaming {
                    namespace: self.tree.namespace.clone(),
                    name: self.tree.name.clone(),
                    version: self.tree.version.clone(),
                },
                input: root_state
                    .and_then(|s| s.raw_input.clone())
                    .unwrap_or(Value::Null),
                started_at: root_state.and_then(|s| s.started_at).map(Into::into),
            })
            .unwrap_or(Value::Null),
        );
        root_layer.insert(
            "runtime".to_string(),
            serde_json::to_value(RuntimeDescriptor::default()).unwrap_or(Value::Null),
        );

        scope.layered(root_layer)
    }

    /// The node's input after schema validation and the `input.from`
    /// transformation. Memoized per run; deterministic across resumes since it
    /// derives from the persisted raw input.
    pub(crate) fn transformed_input(&mut self, id: NodeId) -> std::result::Result<Value, WorkflowError> {
        if let Some(cached) = self.transformed_inputs.get(&id) {
            return Ok(cached.clone());
        }

        let tree = Arc::clone(&self.tree);
        let node = tree.node(id);
        let raw = self
            .states
            .get(&id)
            .and_then(|s| s.raw_input.clone())
            .unwrap_or(Value::Null);

        if let Some(input) = &node.common.input
            && let Some(schema_def) = &input.schema
        {
            schema::validate(&raw, schema_def).map_err(|e| e.at(&node.position))?;
        }

        let transformed = match node.common.input.as_ref().and_then(|i| i.from.as_ref()) {
            Some(from) => {
                let scope = self.scope_for(id, &raw, None);
                expressions::evaluate_value(&raw, from, &scope)
                    .map_err(|e| WorkflowError::from(e).at(&node.position))?
            }
            None => raw,
        };

        self.transformed_inputs.insert(id, transformed.clone());
        Ok(transformed)
    }

    /// Gate a node: record its start, transform its input, evaluate its `if`
    /// guard. A false guard resets the node's state and skips it.
    pub(crate) fn should_start(&mut self, id: NodeId) -> std::result::Result<bool, WorkflowError> {
        let tree = Arc::clone(&self.tree);
        let node = tree.node(id);

        if self.state_mut(id).started_at.is_none() {
            self.state_mut(id).started_at = Some(Utc::now());
        }

        let input = self.transformed_input(id)?;

        if let Some(condition) = &node.common.if_ {
            let scope = self.scope_for(id, &input, None);
            let verdict = expressions::evaluate_jq(&input, condition, &scope)
                .map_err(|e| WorkflowError::from(e).at(&node.position))?;
            let Value::Bool(enter) = verdict else {
                return Err(WorkflowError::expression("Guard must evaluate to a boolean")
                    .with_detail(format!("'if' produced {verdict}"))
                    .at(&node.position));
            };
            if !enter {
                debug!(position = %node.position, "guard is false, skipping node");
                self.states.remove(&id);
                self.transformed_inputs.remove(&id);
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Perform a flow node's own effect. Activities never go through here;
    /// their effects run in [`Self::execute_activity`].
    fn execute_flow(&mut self, id: NodeId) -> std::result::Result<(), WorkflowError> {
        let tree = Arc::clone(&self.tree);
        let input = self.transformed_input(id)?;

        match &tree.node(id).kind {
            NodeKind::Switch { cases } => nodes::switch::execute(self, id, cases, &input)?,
            NodeKind::Set { values } => nodes::set::execute(self, id, values, &input)?,
            NodeKind::Raise { error } => nodes::raise::execute(self, id, error, &input)?,
            NodeKind::Fork { .. } => {
                self.state_mut(id).raw_output = Some(Value::Array(Vec::new()));
            }
            _ => {
                // Base default: raw output starts as the transformed input;
                // children overwrite it as they complete.
                self.state_mut(id).raw_output = Some(input);
            }
        }
        Ok(())
    }

    /// Flow-node continuation: pick the next child, or fall through to
    /// `then()` when the node is exhausted.
    pub(crate) fn continue_node(
        &mut self,
        id: NodeId,
    ) -> std::result::Result<Option<NodeId>, WorkflowError> {
        if self.barrier == Some(id) {
            // A branch clone stops here; the owning instance collects the
            // branch output from the fork's accumulator.
            return Ok(None);
        }

        let tree = Arc::clone(&self.tree);
        match &tree.node(id).kind {
            NodeKind::Root | NodeKind::Do => nodes::do_block::continue_node(self, id),
            NodeKind::For { clause, while_ } => {
                nodes::for_loop::continue_node(self, id, clause, while_.as_deref())
            }
            NodeKind::Try { .. } => nodes::try_catch::continue_node(self, id),
            NodeKind::Fork { compete } => nodes::fork::continue_node(self, id, *compete),
            NodeKind::Switch { .. } => {
                let directive = self.directives.remove(&id);
                self.then_node(id, directive)
            }
            _ => self.then_node(id, None),
        }
    }

    /// Complete a node: validate and transform its output, apply the context
    /// export, propagate the result to the parent, and clear the node's state
    /// so a later re-entry starts clean.
    pub(crate) fn complete_node(&mut self, id: NodeId) -> std::result::Result<Value, WorkflowError> {
        let tree = Arc::clone(&self.tree);
        let node = tree.node(id);

        let raw_output = self
            .states
            .get(&id)
            .and_then(|s| s.raw_output.clone())
            .unwrap_or(Value::Null);

        if let Some(output) = &node.common.output
            && let Some(schema_def) = &output.schema
        {
            schema::validate(&raw_output, schema_def).map_err(|e| e.at(&node.position))?;
        }

        let input = self.transformed_input(id)?;
        let transformed = match node.common.output.as_ref().and_then(|o| o.as_.as_ref()) {
            Some(as_) => {
                let scope = self.scope_for(id, &input, Some(&raw_output));
                expressions::evaluate_value(&raw_output, as_, &scope)
                    .map_err(|e| WorkflowError::from(e).at(&node.position))?
            }
            None => raw_output,
        };

        if let Some(export) = &node.common.export
            && let Some(as_) = &export.as_
        {
            let scope = self.scope_for(id, &input, Some(&transformed));
            let exported = expressions::evaluate_value(&transformed, as_, &scope)
                .map_err(|e| WorkflowError::from(e).at(&node.position))?;
            if let Some(schema_def) = &export.schema {
                schema::validate(&exported, schema_def).map_err(|e| e.at(&node.position))?;
            }
            let Value::Object(context) = exported else {
                return Err(WorkflowError::expression("Export must produce an object")
                    .with_detail(format!("'export.as' produced {exported}"))
                    .at(&node.position));
            };
            self.root_state_mut().context = context;
        }

        match node.parent {
            Some(parent) => {
                let is_fork = matches!(tree.node(parent).kind, NodeKind::Fork { .. });
                let parent_state = self.state_mut(parent);
                if is_fork {
                    // Branch outputs accumulate instead of replacing.
                    match parent_state.raw_output.as_mut() {
                        Some(Value::Array(branches)) => branches.push(transformed.clone()),
                        _ => {
                            parent_state.raw_output = Some(Value::Array(vec![transformed.clone()]));
                        }
                    }
                } else {
                    parent_state.raw_output = Some(transformed.clone());
                }
            }
            None => self.final_output = Some(transformed.clone()),
        }

        self.states.remove(&id);
        self.transformed_inputs.remove(&id);
        Ok(transformed)
    }

    /// Complete `id` and resolve where control goes next.
    pub(crate) fn then_node(
        &mut self,
        id: NodeId,
        directive: Option<FlowDirective>,
    ) -> std::result::Result<Option<NodeId>, WorkflowError> {
        if self.barrier == Some(id) {
            // An exit directive inside a branch clone ends the branch, not
            // the fork.
            return Ok(None);
        }

        let tree = Arc::clone(&self.tree);
        let node = tree.node(id);
        let directive = directive
            .or_else(|| node.common.then.clone())
            .unwrap_or(FlowDirective::Continue);

        self.complete_node(id)?;

        match directive {
            FlowDirective::Continue => match node.parent {
                Some(parent) => self.continue_node(parent),
                None => Ok(None),
            },
            FlowDirective::Exit => match node.parent {
                Some(parent) => self.then_node(parent, None),
                None => Ok(None),
            },
            FlowDirective::End => {
                let mut walk = node.parent;
                while let Some(id) = walk {
                    if self.barrier == Some(id) {
                        return Ok(None);
                    }
                    walk = tree.node(id).parent;
                    self.complete_node(id)?;
                }
                Ok(None)
            }
            FlowDirective::Task(target) => {
                let Some(parent) = node.parent else {
                    return Err(WorkflowError::configuration("No sibling to jump to")
                        .with_detail(format!("'then: {target}' at the root"))
                        .at(&node.position));
                };
                let siblings = &tree.node(parent).children;
                let Some(slot) = siblings
                    .iter()
                    .position(|child| tree.node(*child).name == target)
                else {
                    return Err(WorkflowError::configuration("Unknown task in flow directive")
                        .with_detail(format!("no sibling named '{target}'"))
                        .at(&node.position));
                };

                #[allow(clippy::cast_possible_wrap)]
                {
                    self.state_mut(parent).child_index = slot as i32;
                }
                let input = self
                    .states
                    .get(&parent)
                    .and_then(|s| s.raw_output.clone())
                    .unwrap_or(Value::Null);
                let sibling = siblings[slot];
                self.state_mut(sibling).raw_input = Some(input);
                Ok(Some(sibling))
            }
        }
    }

    /// Drop the state of every descendant of `id` (a try body being retried).
    pub(crate) fn clear_subtree(&mut self, id: NodeId) {
        let tree = Arc::clone(&self.tree);
        let mut stack: Vec<NodeId> = tree.node(id).children.clone();
        while let Some(child) = stack.pop() {
            self.states.remove(&child);
            self.transformed_inputs.remove(&child);
            self.directives.remove(&child);
            stack.extend(tree.node(child).children.iter().copied());
        }
    }

    // -- error raise protocol ---------------------------------------------

    /// Walk ancestors of the raising node for a catching `try` and decide
    /// retry, catch branch, or fault.
    fn recover(&mut self, at: NodeId, error: WorkflowError) -> Walk {
        let tree = Arc::clone(&self.tree);
        debug!(position = %tree.node(at).position, error = %error, "handling raised error");

        let mut walk = tree.node(at).parent;
        while let Some(id) = walk {
            if self.barrier == Some(id) {
                // Errors leave a branch clone through the fork: the owning
                // instance re-raises them against the ancestors of the fork.
                break;
            }
            walk = tree.node(id).parent;
            let NodeKind::Try { catch } = &tree.node(id).kind else {
                continue;
            };

            let matched = match nodes::try_catch::catch_matches(self, id, catch, &error) {
                Ok(matched) => matched,
                Err(inner) => return self.fault(at, inner),
            };
            if !matched {
                continue;
            }

            match nodes::try_catch::recover(self, id, catch, &error) {
                Ok(nodes::try_catch::Recovery::Retry { delay }) => {
                    self.cursor = id;
                    self.status = InstanceStatus::Retrying { delay };
                    return Ok(Step::Halt);
                }
                Ok(nodes::try_catch::Recovery::CatchBranch { entry }) => {
                    return Ok(Step::Enter(entry));
                }
                Ok(nodes::try_catch::Recovery::Resume { next }) => {
                    return Ok(match next {
                        Some(id) => Step::Enter(id),
                        None => Step::End,
                    });
                }
                Err((id, inner)) => return Err((id, inner)),
            }
        }

        self.fault(at, error)
    }

    fn fault(&mut self, at: NodeId, error: WorkflowError) -> Walk {
        self.cursor = at;
        self.status = InstanceStatus::Faulted { error };
        Ok(Step::Halt)
    }

    // -- activities --------------------------------------------------------

    async fn run_branches(&mut self, id: NodeId) -> std::result::Result<(), WorkflowError> {
        let compete = matches!(self.tree.node(id).kind, NodeKind::Fork { compete: true });
        nodes::fork::execute_branches(self, id, compete).await
    }

    async fn execute_activity(&mut self, id: NodeId) -> std::result::Result<(), WorkflowError> {
        let tree = Arc::clone(&self.tree);
        let node = tree.node(id);
        let input = self.transformed_input(id)?;
        let scope = self.scope_for(id, &input, None);

        let context = ActivityContext {
            kind: node.kind.clone(),
            input,
            scope,
            secrets: self.secrets.clone(),
            position: node.position.clone(),
        };

        let runner = self.runners.get(&context.activity_kind()?)?;

        let deadline = match &node.common.timeout {
            Some(timeout) => Some(timeout.after.to_duration().map_err(|e| {
                WorkflowError::configuration("Invalid timeout duration")
                    .with_detail(e.to_string())
                    .at(&node.position)
            })?),
            None => None,
        };

        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, runner.run(context))
                .await
                .unwrap_or_else(|_| {
                    Err(WorkflowError::communication("Activity timed out")
                        .with_detail(format!("deadline of {deadline:?} exceeded"))
                        .at(&node.position))
                }),
            None => runner.run(context).await,
        }?;

        match outcome {
            ActivityOutcome::Output(output) => {
                self.state_mut(id).raw_output = Some(output);
                self.status = InstanceStatus::Running;
            }
            ActivityOutcome::Suspend { output, delay } => {
                self.state_mut(id).raw_output = Some(output);
                self.status = InstanceStatus::Waiting { delay };
            }
        }
        Ok(())
    }
}
