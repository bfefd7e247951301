//! Local mirror of the manager's state tree.
//!
//! The tree is an arena of [`Node`]s keyed by manager-assigned [`NodeId`].
//! Ownership flows strictly downward (planet -> flow/atmosphere -> component);
//! each node also keeps a non-owning `parent` id used for labelling.
//!
//! A node's keys each hold exactly one kind of [`Slot`]: a single value, an
//! ordered list, or a keyed mapping. Nodes only change through
//! [`StateTree::apply`], which mutates one node and then notifies that node's
//! listeners in registration order.

mod listener;
mod mirror;
pub mod planet;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::models::{Change, Delta, NodeId, NodeKind, NodeSnapshot, Snapshot, StateValue};

pub use listener::{ListenerControl, StateListener};
pub use mirror::Mirror;

use listener::same_listener;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("no node with id {0}")]
    UnknownNode(NodeId),

    #[error("nothing at path '{0}'")]
    NotFound(String),

    #[error("key '{key}' on node {node} holds a {found}, not a {expected}")]
    KindMismatch {
        node: NodeId,
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("node {0} already exists")]
    DuplicateNode(NodeId),

    #[error("reference to missing node {0}")]
    DanglingReference(NodeId),
}

/// The contents of one key on a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(StateValue),
    List(Vec<StateValue>),
    Dict(BTreeMap<String, serde_json::Value>),
}

impl Slot {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
        }
    }
}

pub struct Node {
    id: NodeId,
    kind: NodeKind,
    parent: Option<NodeId>,
    slots: BTreeMap<String, Slot>,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .field("slots", &self.slots)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Back-reference to the owning node. Never used for traversal.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn slot(&self, key: &str) -> Option<&Slot> {
        self.slots.get(key)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        match self.slots.get(key) {
            Some(Slot::Value(value)) => Some(value),
            _ => None,
        }
    }

    pub fn scalar(&self, key: &str) -> Option<&serde_json::Value> {
        self.get(key).and_then(StateValue::as_scalar)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(StateValue::as_str)
    }

    /// Items of a list key; empty when the key is absent.
    pub fn list(&self, key: &str) -> &[StateValue] {
        match self.slots.get(key) {
            Some(Slot::List(items)) => items,
            _ => &[],
        }
    }

    pub fn dict(&self, key: &str) -> Option<&BTreeMap<String, serde_json::Value>> {
        match self.slots.get(key) {
            Some(Slot::Dict(items)) => Some(items),
            _ => None,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn child_ids(&self) -> Vec<NodeId> {
        self.slots
            .values()
            .flat_map(|slot| match slot {
                Slot::Value(value) => value.as_node().into_iter().collect::<Vec<_>>(),
                Slot::List(items) => items.iter().filter_map(StateValue::as_node).collect(),
                Slot::Dict(_) => Vec::new(),
            })
            .collect()
    }

    fn to_snapshot(&self) -> NodeSnapshot {
        let mut snapshot = NodeSnapshot::new(self.id, self.kind);
        for (key, slot) in &self.slots {
            match slot {
                Slot::Value(value) => {
                    snapshot.attributes.insert(key.clone(), value.clone());
                }
                Slot::List(items) => {
                    snapshot.lists.insert(key.clone(), items.clone());
                }
                Slot::Dict(items) => {
                    snapshot.dicts.insert(key.clone(), items.clone());
                }
            }
        }
        snapshot
    }
}

#[derive(Debug, Default)]
pub struct StateTree {
    nodes: HashMap<NodeId, Node>,
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// The top of the subtree `id` belongs to.
    pub fn root_of(&self, id: NodeId) -> Option<NodeId> {
        let mut node = self.get(id)?;
        while let Some(parent) = node.parent {
            node = self.get(parent)?;
        }
        Some(node.id)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, StateError> {
        self.nodes.get(&id).ok_or(StateError::UnknownNode(id))
    }

    /// Insert a whole subtree. Returns the snapshot's root id.
    pub fn load(&mut self, snapshot: Snapshot) -> Result<NodeId, StateError> {
        let root = snapshot.root;
        if !snapshot.nodes.iter().any(|n| n.id == root) {
            return Err(StateError::DanglingReference(root));
        }
        self.insert_nodes(snapshot.nodes, None)?;
        Ok(root)
    }

    /// Export the subtree under `root` in wire form.
    pub fn snapshot(&self, root: NodeId) -> Result<Snapshot, StateError> {
        let mut nodes = Vec::new();
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            let node = self.node(id)?;
            pending.extend(
                node.child_ids()
                    .into_iter()
                    .filter(|child| self.get(*child).is_some_and(|c| c.parent == Some(id))),
            );
            nodes.push(node.to_snapshot());
        }
        Ok(Snapshot::new(root, nodes))
    }

    /// Look up a node by path relative to `root`.
    ///
    /// A segment naming a node-valued key descends into that node; a segment
    /// naming a list key must be followed by the `name` of one of its children:
    /// `flows/default/components/producer`, `atmosphere/components/porter`.
    /// Purely local; never blocks on the network.
    pub fn query(&self, root: NodeId, path: &str) -> Result<&Node, StateError> {
        let not_found = || StateError::NotFound(path.to_string());
        let mut current = self.nodes.get(&root).ok_or_else(not_found)?;
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        while let Some(segment) = segments.next() {
            current = match current.slots.get(segment) {
                Some(Slot::Value(StateValue::Node(id))) => {
                    self.nodes.get(id).ok_or_else(not_found)?
                }
                Some(Slot::List(items)) => {
                    let name = segments.next().ok_or_else(not_found)?;
                    items
                        .iter()
                        .filter_map(StateValue::as_node)
                        .filter_map(|id| self.nodes.get(&id))
                        .find(|child| child.get_str("name") == Some(name))
                        .ok_or_else(not_found)?
                }
                _ => return Err(not_found()),
            };
        }
        Ok(current)
    }

    /// Register a listener. Registering the same listener twice is a no-op.
    pub fn add_listener(
        &mut self,
        id: NodeId,
        listener: Arc<dyn StateListener>,
    ) -> Result<(), StateError> {
        let node = self.nodes.get_mut(&id).ok_or(StateError::UnknownNode(id))?;
        if !node.listeners.iter().any(|l| same_listener(l, &listener)) {
            node.listeners.push(listener);
        }
        Ok(())
    }

    /// Unregister a listener. Returns whether it was registered; absence is not an error.
    pub fn remove_listener(&mut self, id: NodeId, listener: &Arc<dyn StateListener>) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        let before = node.listeners.len();
        node.listeners.retain(|l| !same_listener(l, listener));
        node.listeners.len() != before
    }

    /// Apply one change, then notify the changed node's listeners.
    ///
    /// A delta that fails validation leaves the tree untouched.
    pub fn apply(&mut self, delta: Delta) -> Result<(), StateError> {
        let Delta {
            node: id,
            change,
            nodes,
            ..
        } = delta;

        let node = self.node(id)?;
        let expected = match &change {
            Change::Set { .. } => "value",
            Change::Append { .. } | Change::Remove { .. } => "list",
            Change::SetItem { .. } | Change::DelItem { .. } => "dict",
        };
        if let Some(slot) = node.slots.get(change.key()) {
            if slot.kind_name() != expected {
                return Err(StateError::KindMismatch {
                    node: id,
                    key: change.key().to_string(),
                    expected,
                    found: slot.kind_name(),
                });
            }
        }
        if let Change::Set { value, .. } | Change::Append { value, .. } = &change {
            if let Some(child) = value.as_node() {
                if !self.contains(child) && !nodes.iter().any(|n| n.id == child) {
                    return Err(StateError::DanglingReference(child));
                }
            }
        }
        if !nodes.is_empty() {
            self.insert_nodes(nodes, Some(id))?;
        }

        match change {
            Change::Set { key, value } => {
                let old = self
                    .node_mut(id)?
                    .slots
                    .insert(key.clone(), Slot::Value(value.clone()));
                self.dispatch(id, |l, tree| l.state_set(tree, id, &key, &value));
                if let Some(Slot::Value(StateValue::Node(old_child))) = old {
                    if value.as_node() != Some(old_child) {
                        self.destroy_child(id, old_child);
                    }
                }
            }
            Change::Append { key, value } => {
                match self
                    .node_mut(id)?
                    .slots
                    .entry(key.clone())
                    .or_insert_with(|| Slot::List(Vec::new()))
                {
                    Slot::List(items) => items.push(value.clone()),
                    _ => unreachable!("slot kind checked above"),
                }
                self.dispatch(id, |l, tree| l.state_append(tree, id, &key, &value));
            }
            Change::Remove { key, value } => {
                let removed = match self.node_mut(id)?.slots.get_mut(&key) {
                    Some(Slot::List(items)) => match items.iter().position(|v| *v == value) {
                        Some(pos) => {
                            items.remove(pos);
                            true
                        }
                        None => false,
                    },
                    _ => false,
                };
                if !removed {
                    tracing::warn!(node = id, key = %key, ?value, "ignoring removal of absent item");
                    return Ok(());
                }
                self.dispatch(id, |l, tree| l.state_remove(tree, id, &key, &value));
                if let Some(child) = value.as_node() {
                    self.destroy_child(id, child);
                }
            }
            Change::SetItem { key, subkey, value } => {
                match self
                    .node_mut(id)?
                    .slots
                    .entry(key.clone())
                    .or_insert_with(|| Slot::Dict(BTreeMap::new()))
                {
                    Slot::Dict(items) => {
                        items.insert(subkey.clone(), value.clone());
                    }
                    _ => unreachable!("slot kind checked above"),
                }
                self.dispatch(id, |l, tree| {
                    l.state_set_item(tree, id, &key, &subkey, &value)
                });
            }
            Change::DelItem { key, subkey } => {
                let removed = match self.node_mut(id)?.slots.get_mut(&key) {
                    Some(Slot::Dict(items)) => items.remove(&subkey),
                    _ => None,
                };
                let Some(value) = removed else {
                    tracing::warn!(node = id, key = %key, subkey = %subkey, "ignoring deletion of absent item");
                    return Ok(());
                };
                self.dispatch(id, |l, tree| {
                    l.state_del_item(tree, id, &key, &subkey, &value)
                });
            }
        }
        Ok(())
    }

    /// Destroy every node, telling all listeners their node is gone.
    pub fn clear(&mut self) {
        let nodes = std::mem::take(&mut self.nodes);
        for (id, node) in nodes {
            for listener in node.listeners {
                listener.node_destroyed(id);
            }
        }
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, StateError> {
        self.nodes.get_mut(&id).ok_or(StateError::UnknownNode(id))
    }

    fn insert_nodes(
        &mut self,
        nodes: Vec<NodeSnapshot>,
        attach_to: Option<NodeId>,
    ) -> Result<(), StateError> {
        let mut incoming = HashSet::new();
        for node in &nodes {
            if self.nodes.contains_key(&node.id) || !incoming.insert(node.id) {
                return Err(StateError::DuplicateNode(node.id));
            }
        }

        let mut parents = HashMap::new();
        for node in &nodes {
            for child in node.child_ids() {
                if !incoming.contains(&child) {
                    return Err(StateError::DanglingReference(child));
                }
                parents.insert(child, node.id);
            }
            for key in node.lists.keys().chain(node.dicts.keys()) {
                if node.attributes.contains_key(key) {
                    return Err(StateError::KindMismatch {
                        node: node.id,
                        key: key.clone(),
                        expected: "value",
                        found: "collection",
                    });
                }
            }
            if let Some(key) = node.lists.keys().find(|k| node.dicts.contains_key(*k)) {
                return Err(StateError::KindMismatch {
                    node: node.id,
                    key: key.clone(),
                    expected: "list",
                    found: "dict",
                });
            }
        }

        for snapshot in nodes {
            let mut slots = BTreeMap::new();
            for (key, value) in snapshot.attributes {
                slots.insert(key, Slot::Value(value));
            }
            for (key, items) in snapshot.lists {
                slots.insert(key, Slot::List(items));
            }
            for (key, items) in snapshot.dicts {
                slots.insert(key, Slot::Dict(items));
            }
            let parent = parents.get(&snapshot.id).copied().or(attach_to);
            self.nodes.insert(
                snapshot.id,
                Node {
                    id: snapshot.id,
                    kind: snapshot.kind,
                    parent,
                    slots,
                    listeners: Vec::new(),
                },
            );
        }
        Ok(())
    }

    fn dispatch<F>(&mut self, id: NodeId, mut deliver: F)
    where
        F: FnMut(&dyn StateListener, &StateTree) -> ListenerControl,
    {
        let listeners = match self.nodes.get(&id) {
            Some(node) => node.listeners.clone(),
            None => return,
        };
        let mut detached = Vec::new();
        for listener in &listeners {
            if deliver(listener.as_ref(), self) == ListenerControl::Detach {
                detached.push(listener.clone());
            }
        }
        for listener in &detached {
            self.remove_listener(id, listener);
        }
    }

    /// Destroy `child` if `parent` owns it.
    fn destroy_child(&mut self, parent: NodeId, child: NodeId) {
        if self
            .nodes
            .get(&child)
            .is_some_and(|c| c.parent == Some(parent))
        {
            self.destroy(child);
        }
    }

    fn destroy(&mut self, id: NodeId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        tracing::debug!(node = id, kind = ?node.kind, "destroying node");
        for child in node.child_ids() {
            self.destroy_child(id, child);
        }
        for listener in node.listeners {
            listener.node_destroyed(id);
        }
    }
}
