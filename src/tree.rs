//! The static workflow tree.
//!
//! Built once per `(name, version)` from a parsed definition and cached
//! process-wide; instances never mutate it. Nodes live in an arena and refer
//! to each other by index, with a position map for cursor lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use lazy_static::lazy_static;
use serde_json::Value;
use snafu::prelude::*;

use crate::dsl::{
    CatchClause, DurationSpec, ErrorDefinition, ForClause, HttpArguments, ProcessReturnMode,
    RaiseErrorSpec, ScriptProcess, ShellProcess, SubflowReference, SwitchItem, TaskCommon,
    TaskDefinition, TaskList, WorkflowDefinition,
};
use crate::position::NodePosition;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unsupported call kind '{kind}' at {position}"))]
    UnsupportedCallKind { kind: String, position: String },

    #[snafu(display("Invalid arguments for '{kind}' call at {position}: {source}"))]
    InvalidCallArguments {
        kind: String,
        position: String,
        source: serde_json::Error,
    },

    #[snafu(display("Run task at {position} must define exactly one of shell, script, workflow"))]
    AmbiguousRunTask { position: String },

    #[snafu(display("Error references are not supported (raise at {position})"))]
    UnsupportedErrorReference { position: String },
}

pub type Result<T> = std::result::Result<T, Error>;

pub type NodeId = usize;

/// What a node is and the kind-specific slice of its definition.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Root,
    Do,
    For {
        clause: ForClause,
        while_: Option<String>,
    },
    Try {
        catch: CatchClause,
    },
    Switch {
        cases: Vec<SwitchItem>,
    },
    Set {
        values: IndexMap<String, Value>,
    },
    Raise {
        error: ErrorDefinition,
    },
    Fork {
        compete: bool,
    },
    HttpCall {
        args: HttpArguments,
    },
    Shell {
        process: ShellProcess,
        await_: bool,
        return_: ProcessReturnMode,
    },
    Script {
        process: ScriptProcess,
        await_: bool,
        return_: ProcessReturnMode,
    },
    Subflow {
        reference: SubflowReference,
        await_: bool,
    },
    Wait {
        duration: DurationSpec,
    },
    Emit {
        event: Value,
    },
    Listen {
        event: Value,
    },
}

impl NodeKind {
    /// Activities perform an external effect; everything else only steers
    /// control flow.
    #[must_use]
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            NodeKind::HttpCall { .. }
                | NodeKind::Shell { .. }
                | NodeKind::Script { .. }
                | NodeKind::Subflow { .. }
                | NodeKind::Wait { .. }
                | NodeKind::Emit { .. }
                | NodeKind::Listen { .. }
        )
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Do => "do",
            NodeKind::For { .. } => "for",
            NodeKind::Try { .. } => "try",
            NodeKind::Switch { .. } => "switch",
            NodeKind::Set { .. } => "set",
            NodeKind::Raise { .. } => "raise",
            NodeKind::Fork { .. } => "fork",
            NodeKind::HttpCall { .. } => "call",
            NodeKind::Shell { .. } | NodeKind::Script { .. } => "run",
            NodeKind::Subflow { .. } => "subflow",
            NodeKind::Wait { .. } => "wait",
            NodeKind::Emit { .. } => "emit",
            NodeKind::Listen { .. } => "listen",
        }
    }
}

/// One immutable node of the workflow tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub name: String,
    pub position: NodePosition,
    pub kind: NodeKind,
    pub common: TaskCommon,
}

#[derive(Debug)]
pub struct NodeTree {
    pub name: String,
    pub version: String,
    pub namespace: String,
    nodes: Vec<Node>,
    by_position: HashMap<NodePosition, NodeId>,
}

impl NodeTree {
    /// Compile a definition into its tree. Deterministic: two compilations of
    /// the same definition assign identical positions.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        let mut tree = NodeTree {
            name: definition.document.name.clone(),
            version: definition.document.version.clone(),
            namespace: definition.document.namespace.clone(),
            nodes: Vec::new(),
            by_position: HashMap::new(),
        };

        let root_common = TaskCommon {
            input: definition.input.clone(),
            output: definition.output.clone(),
            ..TaskCommon::default()
        };
        let root = tree.push_node(None, "root", NodePosition::root(), NodeKind::Root, root_common);

        let do_position = NodePosition::root().child_name("do");
        let do_id = tree.push_node(Some(root), "do", do_position, NodeKind::Do, TaskCommon::default());
        tree.attach_task_list(do_id, &definition.do_)?;

        Ok(tree)
    }

    #[must_use]
    pub fn root_id(&self) -> NodeId {
        0
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn lookup(&self, position: &NodePosition) -> Option<&Node> {
        self.by_position.get(position).map(|id| &self.nodes[*id])
    }

    /// Whether any node under `id` performs an external effect.
    #[must_use]
    pub fn subtree_has_activity(&self, id: NodeId) -> bool {
        let mut stack = self.nodes[id].children.clone();
        while let Some(child) = stack.pop() {
            let node = &self.nodes[child];
            if node.kind.is_activity() {
                return true;
            }
            stack.extend(node.children.iter().copied());
        }
        false
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    fn push_node(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        position: NodePosition,
        kind: NodeKind,
        common: TaskCommon,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            parent,
            children: Vec::new(),
            name: name.to_string(),
            position: position.clone(),
            kind,
            common,
        });
        self.by_position.insert(position, id);
        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
        }
        id
    }

    fn attach_task_list(&mut self, parent: NodeId, list: &TaskList) -> Result<()> {
        let base = self.nodes[parent].position.clone();
        for (index, item) in list.iter().enumerate() {
            let position = base.child_index(index).child_name(&item.name);
            self.attach_task(parent, &item.name, position, &item.task)?;
        }
        Ok(())
    }

    fn attach_task(
        &mut self,
        parent: NodeId,
        name: &str,
        position: NodePosition,
        task: &TaskDefinition,
    ) -> Result<()> {
        let common = task.common().clone();
        match task {
            TaskDefinition::Do(t) => {
                let id = self.push_node(Some(parent), name, position, NodeKind::Do, common);
                self.attach_task_list(id, &t.do_)?;
            }
            TaskDefinition::For(t) => {
                let id = self.push_node(
                    Some(parent),
                    name,
                    position.clone(),
                    NodeKind::For {
                        clause: t.for_.clone(),
                        while_: t.while_.clone(),
                    },
                    common,
                );
                let body_position = position.child_name("do");
                let body = self.push_node(Some(id), "do", body_position, NodeKind::Do, TaskCommon::default());
                self.attach_task_list(body, &t.do_)?;
            }
            TaskDefinition::Try(t) => {
                let id = self.push_node(
                    Some(parent),
                    name,
                    position.clone(),
                    NodeKind::Try {
                        catch: t.catch.clone(),
                    },
                    common,
                );
                let body_position = position.child_name("try");
                let body = self.push_node(Some(id), "try", body_position, NodeKind::Do, TaskCommon::default());
                self.attach_task_list(body, &t.try_)?;

                if let Some(catch_do) = &t.catch.do_ {
                    let catch_position = position.child_name("catch").child_name("do");
                    let catch_body =
                        self.push_node(Some(id), "catch", catch_position, NodeKind::Do, TaskCommon::default());
                    self.attach_task_list(catch_body, catch_do)?;
                }
            }
            TaskDefinition::Fork(t) => {
                let id = self.push_node(
                    Some(parent),
                    name,
                    position.clone(),
                    NodeKind::Fork {
                        compete: t.fork.compete,
                    },
                    common,
                );
                let base = position.child_name("fork").child_name("branches");
                for (index, item) in t.fork.branches.iter().enumerate() {
                    let branch_position = base.child_index(index).child_name(&item.name);
                    self.attach_task(id, &item.name, branch_position, &item.task)?;
                }
            }
            TaskDefinition::Switch(t) => {
                self.push_node(
                    Some(parent),
                    name,
                    position,
                    NodeKind::Switch {
                        cases: t.switch.clone(),
                    },
                    common,
                );
            }
            TaskDefinition::Set(t) => {
                self.push_node(
                    Some(parent),
                    name,
                    position,
                    NodeKind::Set {
                        values: t.set.clone(),
                    },
                    common,
                );
            }
            TaskDefinition::Raise(t) => {
                let error = match &t.raise.error {
                    RaiseErrorSpec::Definition(def) => def.clone(),
                    RaiseErrorSpec::Reference(_) => {
                        return UnsupportedErrorReferenceSnafu {
                            position: position.to_string(),
                        }
                        .fail();
                    }
                };
                self.push_node(Some(parent), name, position, NodeKind::Raise { error }, common);
            }
            TaskDefinition::Call(t) => {
                if t.call != "http" {
                    return UnsupportedCallKindSnafu {
                        kind: t.call.clone(),
                        position: position.to_string(),
                    }
                    .fail();
                }
                let args: HttpArguments =
                    serde_json::from_value(t.with.clone()).context(InvalidCallArgumentsSnafu {
                        kind: t.call.clone(),
                        position: position.to_string(),
                    })?;
                self.push_node(Some(parent), name, position, NodeKind::HttpCall { args }, common);
            }
            TaskDefinition::Run(t) => {
                let kind = match (&t.run.shell, &t.run.script, &t.run.workflow) {
                    (Some(process), None, None) => NodeKind::Shell {
                        process: process.clone(),
                        await_: t.run.await_,
                        return_: t.run.return_,
                    },
                    (None, Some(process), None) => NodeKind::Script {
                        process: process.clone(),
                        await_: t.run.await_,
                        return_: t.run.return_,
                    },
                    (None, None, Some(reference)) => NodeKind::Subflow {
                        reference: reference.clone(),
                        await_: t.run.await_,
                    },
                    _ => {
                        return AmbiguousRunTaskSnafu {
                            position: position.to_string(),
                        }
                        .fail();
                    }
                };
                self.push_node(Some(parent), name, position, kind, common);
            }
            TaskDefinition::Wait(t) => {
                self.push_node(
                    Some(parent),
                    name,
                    position,
                    NodeKind::Wait {
                        duration: t.wait.clone(),
                    },
                    common,
                );
            }
            TaskDefinition::Emit(t) => {
                self.push_node(
                    Some(parent),
                    name,
                    position,
                    NodeKind::Emit {
                        event: t.emit.clone(),
                    },
                    common,
                );
            }
            TaskDefinition::Listen(t) => {
                self.push_node(
                    Some(parent),
                    name,
                    position,
                    NodeKind::Listen {
                        event: t.listen.clone(),
                    },
                    common,
                );
            }
        }
        Ok(())
    }
}

lazy_static! {
    static ref TREE_CACHE: RwLock<HashMap<(String, String), Arc<NodeTree>>> =
        RwLock::new(HashMap::new());
}

/// Fetch or build the cached tree for a definition.
///
/// Entries are insert-once, read-many: definitions are immutable per
/// `(name, version)`, so the cache is never evicted in-process.
pub fn cached_tree(definition: &WorkflowDefinition) -> Result<Arc<NodeTree>> {
    let key = (
        definition.document.name.clone(),
        definition.document.version.clone(),
    );

    if let Some(tree) = TREE_CACHE
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(&key)
    {
        return Ok(Arc::clone(tree));
    }

    let tree = Arc::new(NodeTree::build(definition)?);
    let mut cache = TREE_CACHE
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let entry = cache.entry(key).or_insert_with(|| Arc::clone(&tree));
    Ok(Arc::clone(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_yaml(yaml).unwrap()
    }

    const NESTED: &str = r#"
document:
  dsl: '1.0.0'
  namespace: test
  name: nested
  version: '0.1.0'
do:
  - first:
      set:
        a: 1
  - loop:
      for:
        each: item
        in: "${ .items }"
      do:
        - work:
            set:
              b: 2
  - guarded:
      try:
        - risky:
            raise:
              error:
                type: runtime
                status: 500
                title: boom
      catch:
        do:
          - recover:
              set:
                ok: true
"#;

    #[test]
    fn positions_are_deterministic() {
        let definition = parse(NESTED);
        let a = NodeTree::build(&definition).unwrap();
        let b = NodeTree::build(&definition).unwrap();
        let positions_a: Vec<_> = a.iter().map(|n| n.position.to_string()).collect();
        let positions_b: Vec<_> = b.iter().map(|n| n.position.to_string()).collect();
        assert_eq!(positions_a, positions_b);
    }

    #[test]
    fn expected_positions_exist() {
        let tree = NodeTree::build(&parse(NESTED)).unwrap();
        for position in [
            "/",
            "/do",
            "/do/0/first",
            "/do/1/loop",
            "/do/1/loop/do",
            "/do/1/loop/do/0/work",
            "/do/2/guarded",
            "/do/2/guarded/try",
            "/do/2/guarded/try/0/risky",
            "/do/2/guarded/catch/do",
            "/do/2/guarded/catch/do/0/recover",
        ] {
            let parsed = NodePosition::parse(position).unwrap();
            assert!(tree.lookup(&parsed).is_some(), "missing node at {position}");
        }
    }

    #[test]
    fn root_has_single_do_child() {
        let tree = NodeTree::build(&parse(NESTED)).unwrap();
        let root = tree.node(tree.root_id());
        assert!(matches!(root.kind, NodeKind::Root));
        assert_eq!(root.children.len(), 1);
        let do_node = tree.node(root.children[0]);
        assert!(matches!(do_node.kind, NodeKind::Do));
        assert_eq!(do_node.children.len(), 3);
    }

    #[test]
    fn unsupported_call_kind_fails_at_build() {
        let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: test
  name: badcall
  version: '0.1.0'
do:
  - call-it:
      call: grpc
      with:
        method: GET
        endpoint: http://example.com
"#;
        let err = NodeTree::build(&parse(yaml)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCallKind { .. }));
    }

    #[test]
    fn cache_returns_same_tree() {
        let definition = parse(NESTED);
        let a = cached_tree(&definition).unwrap();
        let b = cached_tree(&definition).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn activities_and_flow_nodes_classified() {
        let yaml = r#"
document:
  dsl: '1.0.0'
  namespace: test
  name: kinds
  version: '0.1.0'
do:
  - pause:
      wait: PT1S
  - decide:
      switch:
        - default:
            then: exit
"#;
        let tree = NodeTree::build(&parse(yaml)).unwrap();
        let pause = tree
            .lookup(&NodePosition::parse("/do/0/pause").unwrap())
            .unwrap();
        assert!(pause.kind.is_activity());
        let decide = tree
            .lookup(&NodePosition::parse("/do/1/decide").unwrap())
            .unwrap();
        assert!(!decide.kind.is_activity());
    }
}
