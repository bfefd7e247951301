use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Manager-assigned node identity, unique for the lifetime of a session.
pub type NodeId = u64;

/// A single stored value: either a scalar or a reference to a child node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    Node(NodeId),
    Scalar(serde_json::Value),
}

impl StateValue {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            Self::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::Node(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_scalar().and_then(|v| v.as_str())
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Scalar(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::Scalar(serde_json::Value::String(value.to_string()))
    }
}

/// What a node represents. Used for labelling and for sanity checks during resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Planet,
    Flow,
    Atmosphere,
    Component,
    WorkerHeaven,
    Worker,
    Other,
}

/// One node as it appears in a snapshot or as part of a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub attributes: BTreeMap<String, StateValue>,
    #[serde(default)]
    pub lists: BTreeMap<String, Vec<StateValue>>,
    #[serde(default)]
    pub dicts: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl NodeSnapshot {
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            attributes: BTreeMap::new(),
            lists: BTreeMap::new(),
            dicts: BTreeMap::new(),
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<StateValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn child(mut self, key: &str, id: NodeId) -> Self {
        self.attributes.insert(key.to_string(), StateValue::Node(id));
        self
    }

    pub fn list(mut self, key: &str, items: Vec<StateValue>) -> Self {
        self.lists.insert(key.to_string(), items);
        self
    }

    pub fn dict(mut self, key: &str) -> Self {
        self.dicts.entry(key.to_string()).or_default();
        self
    }

    /// Every node this snapshot references directly.
    pub fn child_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.attributes
            .values()
            .chain(self.lists.values().flatten())
            .filter_map(StateValue::as_node)
    }
}

/// A full subtree, e.g. the planet at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub root: NodeId,
    pub nodes: Vec<NodeSnapshot>,
    /// The manager's change counter when the snapshot was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Snapshot {
    pub fn new(root: NodeId, nodes: Vec<NodeSnapshot>) -> Self {
        Self {
            root,
            nodes,
            seq: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }
}

/// An incremental change to exactly one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Set {
        key: String,
        value: StateValue,
    },
    Append {
        key: String,
        value: StateValue,
    },
    Remove {
        key: String,
        value: StateValue,
    },
    SetItem {
        key: String,
        subkey: String,
        value: serde_json::Value,
    },
    DelItem {
        key: String,
        subkey: String,
    },
}

impl Change {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Append { key, .. }
            | Self::Remove { key, .. }
            | Self::SetItem { key, .. }
            | Self::DelItem { key, .. } => key,
        }
    }
}

/// A change plus any node subtrees it introduces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub node: NodeId,
    #[serde(flatten)]
    pub change: Change,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeSnapshot>,
    /// Position in the manager's change order, when the manager numbers its changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Delta {
    pub fn new(node: NodeId, change: Change) -> Self {
        Self {
            node,
            change,
            nodes: Vec::new(),
            seq: None,
        }
    }

    pub fn set(node: NodeId, key: &str, value: impl Into<StateValue>) -> Self {
        Self::new(
            node,
            Change::Set {
                key: key.to_string(),
                value: value.into(),
            },
        )
    }

    pub fn append(node: NodeId, key: &str, value: impl Into<StateValue>) -> Self {
        Self::new(
            node,
            Change::Append {
                key: key.to_string(),
                value: value.into(),
            },
        )
    }

    pub fn remove(node: NodeId, key: &str, value: impl Into<StateValue>) -> Self {
        Self::new(
            node,
            Change::Remove {
                key: key.to_string(),
                value: value.into(),
            },
        )
    }

    pub fn set_item(node: NodeId, key: &str, subkey: &str, value: serde_json::Value) -> Self {
        Self::new(
            node,
            Change::SetItem {
                key: key.to_string(),
                subkey: subkey.to_string(),
                value,
            },
        )
    }

    pub fn del_item(node: NodeId, key: &str, subkey: &str) -> Self {
        Self::new(
            node,
            Change::DelItem {
                key: key.to_string(),
                subkey: subkey.to_string(),
            },
        )
    }

    /// Attach node subtrees introduced by this change.
    pub fn with_nodes(mut self, nodes: Vec<NodeSnapshot>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_wire_format_is_flat() {
        let delta = Delta::set(7, "mood", json!("happy"));
        let encoded = serde_json::to_value(&delta).unwrap();
        assert_eq!(
            encoded,
            json!({"node": 7, "op": "set", "key": "mood", "value": {"scalar": "happy"}})
        );
    }

    #[test]
    fn decodes_append_with_introduced_nodes() {
        let raw = json!({
            "node": 2,
            "op": "append",
            "key": "components",
            "value": {"node": 10},
            "nodes": [{"id": 10, "kind": "component", "attributes": {"name": {"scalar": "muxer"}}}]
        });
        let delta: Delta = serde_json::from_value(raw).unwrap();
        assert_eq!(delta.change.key(), "components");
        assert_eq!(delta.nodes.len(), 1);
        assert_eq!(delta.nodes[0].attributes["name"].as_str(), Some("muxer"));
        assert!(delta.nodes[0].lists.is_empty());
    }

    #[test]
    fn child_ids_cover_attributes_and_lists() {
        let node = NodeSnapshot::new(1, NodeKind::Planet)
            .child("atmosphere", 2)
            .list("flows", vec![StateValue::Node(3), "x".into()]);
        let mut ids: Vec<_> = node.child_ids().collect();
        ids.sort();
        assert_eq!(ids, vec![2, 3]);
    }
}
