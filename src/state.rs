//! Per-node execution state and the serializable workflow snapshot.
//!
//! The wire form uses stable short keys and omits every default-valued field,
//! so a freshly-entered node contributes nothing to the payload and old
//! readers can skip keys they do not know.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::position::NodePosition;

fn neg_one() -> i32 {
    -1
}

fn is_neg_one(value: &i32) -> bool {
    *value == -1
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Mutable record attached to one node of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Scope overlay (loop variables, caught errors, `set` results).
    #[serde(rename = "var", default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,

    /// Retry attempt counter: 0 on first attempt, N on the Nth retry.
    #[serde(rename = "try", default, skip_serializing_if = "is_zero")]
    pub attempt_index: u32,

    /// Child cursor: -1 before entry, `children.len()` past the last child.
    #[serde(rename = "i", default = "neg_one", skip_serializing_if = "is_neg_one")]
    pub child_index: i32,

    #[serde(rename = "inp", default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,

    /// Set on completion; a node with raw output present never re-executes.
    #[serde(rename = "out", default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,

    /// Exported workflow context (root node only).
    #[serde(rename = "ctx", default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,

    /// Instance identifier (root node only).
    #[serde(rename = "wid", default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    #[serde(rename = "sat", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// For-loop iteration cursor.
    #[serde(rename = "fori", default = "neg_one", skip_serializing_if = "is_neg_one")]
    pub for_index: i32,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            variables: Map::new(),
            attempt_index: 0,
            child_index: -1,
            raw_input: None,
            raw_output: None,
            context: Map::new(),
            workflow_id: None,
            started_at: None,
            for_index: -1,
        }
    }
}

impl NodeState {
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == NodeState::default()
    }

    /// Whether this node has completed its own effect.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.raw_output.is_some()
    }
}

/// Snapshot of one workflow instance at one resumable cursor.
///
/// Positions key the state map in their string form; a `BTreeMap` keeps the
/// serialization canonical so equal snapshots serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMessage {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "v")]
    pub version: String,
    #[serde(rename = "s", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub states: BTreeMap<String, NodeState>,
    #[serde(rename = "p")]
    pub position: NodePosition,
}

impl WorkflowMessage {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            states: BTreeMap::new(),
            position: NodePosition::root(),
        }
    }

    /// Record a node state, dropping it entirely when default-valued.
    pub fn set_state(&mut self, position: &NodePosition, state: NodeState) {
        if state.is_default() {
            self.states.remove(&position.to_string());
        } else {
            self.states.insert(position.to_string(), state);
        }
    }

    #[must_use]
    pub fn state(&self, position: &NodePosition) -> Option<&NodeState> {
        self.states.get(&position.to_string())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_serializes_to_empty_object() {
        let json = serde_json::to_value(NodeState::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn only_non_default_fields_appear() {
        let state = NodeState {
            attempt_index: 2,
            raw_input: Some(serde_json::json!("x")),
            ..NodeState::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, serde_json::json!({"try": 2, "inp": "x"}));
    }

    #[test]
    fn child_index_defaults_to_minus_one() {
        let state: NodeState = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(state.child_index, -1);
        assert_eq!(state.for_index, -1);
        assert!(state.is_default());
    }

    #[test]
    fn set_state_prunes_defaults() {
        let mut message = WorkflowMessage::new("wf", "1.0.0");
        let pos = NodePosition::parse("/do/0/a").unwrap();
        message.set_state(
            &pos,
            NodeState {
                child_index: 0,
                ..NodeState::default()
            },
        );
        assert_eq!(message.states.len(), 1);
        message.set_state(&pos, NodeState::default());
        assert!(message.states.is_empty());
    }

    #[test]
    fn message_uses_short_keys() {
        let mut message = WorkflowMessage::new("order-flow", "1.2.0");
        message.position = NodePosition::parse("/do/0/first").unwrap();
        message.set_state(
            &NodePosition::root(),
            NodeState {
                workflow_id: Some("wf-1".to_string()),
                child_index: 0,
                ..NodeState::default()
            },
        );
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["n"], "order-flow");
        assert_eq!(json["v"], "1.2.0");
        assert_eq!(json["p"], "/do/0/first");
        assert_eq!(json["s"]["/"]["wid"], "wf-1");
        assert_eq!(json["s"]["/"]["i"], 0);
    }

    #[test]
    fn canonical_round_trip() {
        let payload = r#"{"n":"wf","v":"1.0.0","s":{"/":{"i":0,"wid":"abc"},"/do/0/a":{"inp":{"k":1}}},"p":"/do/0/a"}"#;
        let message = WorkflowMessage::from_json(payload).unwrap();
        let serialized = message.to_json().unwrap();
        let reparsed = WorkflowMessage::from_json(&serialized).unwrap();
        assert_eq!(reparsed, message);
        assert_eq!(serialized, reparsed.to_json().unwrap());
    }
}
