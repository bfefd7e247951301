use std::sync::Arc;

use crate::models::{NodeId, StateValue};

use super::StateTree;

/// Returned by every callback; `Detach` unregisters the listener once dispatch finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    Keep,
    Detach,
}

/// Observer of one node in a [`StateTree`].
///
/// Callbacks run synchronously on the delta-application path after the change
/// is fully applied. The tree is handed out read-only; listeners cannot mutate
/// it. Every callback defaults to ignoring the event.
pub trait StateListener: Send + Sync {
    fn state_set(
        &self,
        _tree: &StateTree,
        _node: NodeId,
        _key: &str,
        _value: &StateValue,
    ) -> ListenerControl {
        ListenerControl::Keep
    }

    fn state_append(
        &self,
        _tree: &StateTree,
        _node: NodeId,
        _key: &str,
        _value: &StateValue,
    ) -> ListenerControl {
        ListenerControl::Keep
    }

    /// For node values the removed child is still readable from `tree` during this call.
    fn state_remove(
        &self,
        _tree: &StateTree,
        _node: NodeId,
        _key: &str,
        _value: &StateValue,
    ) -> ListenerControl {
        ListenerControl::Keep
    }

    fn state_set_item(
        &self,
        _tree: &StateTree,
        _node: NodeId,
        _key: &str,
        _subkey: &str,
        _value: &serde_json::Value,
    ) -> ListenerControl {
        ListenerControl::Keep
    }

    fn state_del_item(
        &self,
        _tree: &StateTree,
        _node: NodeId,
        _key: &str,
        _subkey: &str,
        _value: &serde_json::Value,
    ) -> ListenerControl {
        ListenerControl::Keep
    }

    /// The node was destroyed; the listener has already been detached.
    fn node_destroyed(&self, _node: NodeId) {}
}

/// Listener identity is the allocation, not the value.
pub(crate) fn same_listener(a: &Arc<dyn StateListener>, b: &Arc<dyn StateListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
