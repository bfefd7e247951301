use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::models::{Delta, NodeId, Snapshot};

use super::{StateError, StateListener, StateTree};

/// Shared handle to a session's [`StateTree`].
///
/// Reads may happen from any task. Writes are limited to loading snapshots,
/// applying deltas, and (un)registering listeners, so the only code that
/// mutates node contents is the delta pump. Guards must not be held across
/// an `.await`.
#[derive(Debug, Clone, Default)]
pub struct Mirror {
    tree: Arc<RwLock<StateTree>>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, StateTree> {
        self.tree.read()
    }

    pub fn load(&self, snapshot: Snapshot) -> Result<NodeId, StateError> {
        self.tree.write().load(snapshot)
    }

    pub fn apply(&self, delta: Delta) -> Result<(), StateError> {
        self.tree.write().apply(delta)
    }

    pub fn add_listener(
        &self,
        node: NodeId,
        listener: Arc<dyn StateListener>,
    ) -> Result<(), StateError> {
        self.tree.write().add_listener(node, listener)
    }

    pub fn remove_listener(&self, node: NodeId, listener: &Arc<dyn StateListener>) -> bool {
        self.tree.write().remove_listener(node, listener)
    }

    /// Drop every node; listeners are told their nodes are gone.
    pub fn clear(&self) {
        self.tree.write().clear()
    }
}
