use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::models::{Mood, NodeId, StateValue};
use crate::state::{ListenerControl, Mirror, StateError, StateListener, StateTree};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("component node {0} went away before reaching the expected mood")]
    TargetGone(NodeId),
}

type WaitResult = Result<Mood, WaitError>;

/// One-shot listener resolving on the first `mood` set that falls in `accept`.
///
/// Resolves at most once, detaches itself when it does, and fails with
/// [`WaitError::TargetGone`] if the node is destroyed first.
pub struct MoodWaiter {
    node: NodeId,
    accept: Vec<Mood>,
    sender: Mutex<Option<oneshot::Sender<WaitResult>>>,
}

impl MoodWaiter {
    fn new(node: NodeId, accept: &[Mood]) -> (Arc<Self>, oneshot::Receiver<WaitResult>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Self {
            node,
            accept: accept.to_vec(),
            sender: Mutex::new(Some(tx)),
        });
        (waiter, rx)
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.lock().is_none()
    }

    fn resolve(&self, result: WaitResult) -> bool {
        match self.sender.lock().take() {
            Some(tx) => {
                // receiver may already be gone if the caller stopped waiting
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

impl StateListener for MoodWaiter {
    fn state_set(
        &self,
        _tree: &StateTree,
        node: NodeId,
        key: &str,
        value: &StateValue,
    ) -> ListenerControl {
        if key != "mood" {
            return ListenerControl::Keep;
        }
        let Some(mood) = value.as_scalar().and_then(Mood::from_value) else {
            tracing::warn!(node, ?value, "unrecognised mood value");
            return ListenerControl::Keep;
        };
        if !self.accept.contains(&mood) {
            tracing::debug!(node, %mood, "mood changed, still waiting");
            return ListenerControl::Keep;
        }
        if self.resolve(Ok(mood)) {
            tracing::debug!(node, %mood, "mood reached");
        }
        ListenerControl::Detach
    }

    fn node_destroyed(&self, node: NodeId) {
        if self.resolve(Err(WaitError::TargetGone(node))) {
            tracing::debug!(node, "waited-on node destroyed");
        }
    }
}

/// Handle on an attached [`MoodWaiter`].
///
/// Dropping the handle before the waiter resolves detaches the waiter, which
/// is how timeouts and cancellation release it.
pub struct MoodWait {
    waiter: Arc<MoodWaiter>,
    receiver: oneshot::Receiver<WaitResult>,
    mirror: Mirror,
}

impl MoodWait {
    /// Register a waiter on `node` for any of the `accept` moods.
    pub fn attach(mirror: &Mirror, node: NodeId, accept: &[Mood]) -> Result<Self, StateError> {
        let (waiter, receiver) = MoodWaiter::new(node, accept);
        mirror.add_listener(node, waiter.clone())?;
        Ok(Self {
            waiter,
            receiver,
            mirror: mirror.clone(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.waiter.node
    }

    pub async fn wait(mut self) -> Result<Mood, WaitError> {
        let node = self.waiter.node;
        (&mut self.receiver)
            .await
            .unwrap_or(Err(WaitError::TargetGone(node)))
    }
}

impl Drop for MoodWait {
    fn drop(&mut self) {
        if !self.waiter.is_resolved() {
            let listener: Arc<dyn StateListener> = self.waiter.clone();
            if self.mirror.remove_listener(self.waiter.node, &listener) {
                tracing::debug!(node = self.waiter.node, "mood wait abandoned");
            }
        }
    }
}
