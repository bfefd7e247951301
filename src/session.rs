//! One connection to a manager.
//!
//! A session owns the mirror, the background task that feeds it deltas, and
//! the connection status. Everything the admin tools ask (moods, properties,
//! workers, actions) goes through here.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::action::ActionOrchestrator;
use crate::gateway::{ComponentRef, DeltaReceiver, GatewayError, RemoteGateway};
use crate::models::{AvatarId, Mood, NodeId, PathError, StateValue};
use crate::state::planet::{self, ComponentView, PlanetView, ResolveError, WorkerInfo};
use crate::state::{ListenerControl, Mirror, StateError, StateListener, StateTree};

/// Connection status, observable through [`Session::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Disconnected(String),
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("manager sent an unusable tree: {0}")]
    State(#[from] StateError),
}

/// Failures of the read-only query helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    NotFound(#[from] ResolveError),

    #[error("Component {} in flow {} has no property called {property}", .avatar.name, .avatar.scope)]
    PropertyNotFound { avatar: AvatarId, property: String },

    #[error("Component {0} has no mood")]
    NoMood(AvatarId),

    #[error("not connected to the manager")]
    Disconnected,
}

pub struct Session {
    gateway: Arc<dyn RemoteGateway>,
    mirror: Mirror,
    planet: NodeId,
    workers: Option<NodeId>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    status: watch::Receiver<SessionStatus>,
    pump: JoinHandle<()>,
}

impl Session {
    /// Subscribe, fetch the planet and worker trees, and start mirroring.
    ///
    /// The subscription is opened before the snapshot is fetched so that no
    /// change falls between the two. Deltas numbered at or below a snapshot's
    /// sequence are already part of it and are skipped.
    pub async fn connect(gateway: Arc<dyn RemoteGateway>) -> Result<Self, SessionError> {
        let deltas = gateway.subscribe().await?;
        let mirror = Mirror::new();
        let mut fences = Vec::new();

        let snapshot = gateway.fetch_snapshot().await?;
        fences.extend(snapshot.seq.map(|seq| (snapshot.root, seq)));
        let planet = mirror.load(snapshot)?;

        let workers = match gateway.list_workers().await {
            Ok(snapshot) => {
                fences.extend(snapshot.seq.map(|seq| (snapshot.root, seq)));
                Some(mirror.load(snapshot)?)
            }
            Err(e) if e.is_connection() => return Err(e.into()),
            Err(e) => {
                tracing::warn!("could not fetch workers: {}", e);
                None
            }
        };

        let watcher: Arc<dyn StateListener> = Arc::new(PlanetWatcher { planet, workers });
        mirror.add_listener(planet, watcher.clone())?;
        if let Some(workers) = workers {
            mirror.add_listener(workers, watcher)?;
        }

        {
            let tree = mirror.read();
            let view = PlanetView::new(&tree, planet)?;
            for flow in view.ignored_flows() {
                tracing::warn!(
                    flow = flow.name().unwrap_or_default(),
                    "only the first flow is handled, ignoring"
                );
            }
            tracing::info!(
                planet = view.name().unwrap_or_default(),
                components = view.components().len(),
                "connected to manager"
            );
        }

        let (status_tx, status) = watch::channel(SessionStatus::Connected);
        let status_tx = Arc::new(status_tx);
        let pump = tokio::spawn(pump_deltas(
            deltas,
            mirror.clone(),
            fences,
            status_tx.clone(),
        ));

        Ok(Self {
            gateway,
            mirror,
            planet,
            workers,
            status_tx,
            status,
            pump,
        })
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn gateway(&self) -> Arc<dyn RemoteGateway> {
        self.gateway.clone()
    }

    pub fn planet_root(&self) -> NodeId {
        self.planet
    }

    pub fn workers_root(&self) -> Option<NodeId> {
        self.workers
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow() == SessionStatus::Connected
    }

    pub fn orchestrator(&self) -> ActionOrchestrator {
        ActionOrchestrator::new(
            self.gateway.clone(),
            self.mirror.clone(),
            self.planet,
            self.status.clone(),
        )
    }

    /// Stop mirroring and drop the tree. Pending mood waits fail as gone.
    pub fn close(&self) {
        self.pump.abort();
        let changed = self.status_tx.send_if_modified(|status| {
            if *status == SessionStatus::Closed {
                false
            } else {
                *status = SessionStatus::Closed;
                true
            }
        });
        if changed {
            self.mirror.clear();
            tracing::debug!("session closed");
        }
    }

    fn with_component<T>(
        &self,
        avatar: &AvatarId,
        f: impl FnOnce(ComponentView<'_>) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        let tree = self.mirror.read();
        let view = PlanetView::new(&tree, self.planet).map_err(|_| QueryError::Disconnected)?;
        let component = view
            .find_component(avatar)
            .ok_or_else(|| ResolveError::ComponentNotFound(avatar.clone()))?;
        f(component)
    }

    /// Find the component a path such as `/default/producer` names.
    pub fn resolve_avatar(&self, path: &str) -> Result<ComponentRef, QueryError> {
        let avatar: AvatarId = path.parse()?;
        self.with_component(&avatar, |c| {
            Ok(ComponentRef {
                node: c.id(),
                avatar: c.avatar(),
            })
        })
    }

    pub fn get_mood(&self, avatar: &AvatarId) -> Result<Mood, QueryError> {
        self.with_component(avatar, |c| {
            c.mood().ok_or_else(|| QueryError::NoMood(c.avatar()))
        })
    }

    pub fn get_property(
        &self,
        avatar: &AvatarId,
        property: &str,
    ) -> Result<serde_json::Value, QueryError> {
        self.with_component(avatar, |c| {
            c.properties()
                .and_then(|props| props.get(property))
                .cloned()
                .ok_or_else(|| QueryError::PropertyNotFound {
                    avatar: c.avatar(),
                    property: property.to_string(),
                })
        })
    }

    /// Property names in sorted order. A component without properties lists none.
    pub fn list_properties(&self, avatar: &AvatarId) -> Result<Vec<String>, QueryError> {
        self.with_component(avatar, |c| {
            let mut names: Vec<String> = c
                .properties()
                .map(|props| props.keys().cloned().collect())
                .unwrap_or_default();
            names.sort();
            Ok(names)
        })
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let Some(heaven) = self.workers else {
            return Vec::new();
        };
        planet::workers(&self.mirror.read(), heaven).unwrap_or_default()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Feed deltas into the mirror until the stream ends, then mark the session disconnected.
async fn pump_deltas(
    mut deltas: DeltaReceiver,
    mirror: Mirror,
    fences: Vec<(NodeId, u64)>,
    status: Arc<watch::Sender<SessionStatus>>,
) {
    let reason = loop {
        match deltas.recv().await {
            Some(Ok(delta)) => {
                if let Some(seq) = delta.seq {
                    let root = mirror.read().root_of(delta.node);
                    if fences.iter().any(|&(r, taken)| Some(r) == root && seq <= taken) {
                        tracing::debug!(node = delta.node, seq, "delta already in snapshot");
                        continue;
                    }
                }
                tracing::trace!(node = delta.node, key = delta.change.key(), "delta");
                if let Err(e) = mirror.apply(delta) {
                    tracing::warn!("ignoring delta: {}", e);
                }
            }
            Some(Err(e)) if e.is_connection() => break e.to_string(),
            Some(Err(e)) => tracing::warn!("bad delta from manager: {}", e),
            None => break "delta stream closed".to_string(),
        }
    };
    tracing::warn!("lost connection to manager: {}", reason);
    status.send_replace(SessionStatus::Disconnected(reason));
    mirror.clear();
}

/// Logs planet-level events: extra flows, planet messages, worker login/logout.
struct PlanetWatcher {
    planet: NodeId,
    workers: Option<NodeId>,
}

impl StateListener for PlanetWatcher {
    fn state_append(
        &self,
        tree: &StateTree,
        node: NodeId,
        key: &str,
        value: &StateValue,
    ) -> ListenerControl {
        if node == self.planet && key == "flows" {
            let flows = tree.get(node).map(|n| n.list("flows").len()).unwrap_or(0);
            if flows > 1 {
                let name = value
                    .as_node()
                    .and_then(|id| tree.get(id))
                    .and_then(|f| f.get_str("name"))
                    .unwrap_or("?");
                tracing::warn!(flow = name, "only the first flow is handled, ignoring");
            }
        } else if Some(node) == self.workers && key == "names" {
            tracing::info!("Worker {} logged in.", value.as_str().unwrap_or("?"));
        }
        ListenerControl::Keep
    }

    fn state_remove(
        &self,
        _tree: &StateTree,
        node: NodeId,
        key: &str,
        value: &StateValue,
    ) -> ListenerControl {
        if Some(node) == self.workers && key == "names" {
            tracing::info!("Worker {} logged out.", value.as_str().unwrap_or("?"));
        }
        ListenerControl::Keep
    }

    fn state_set_item(
        &self,
        _tree: &StateTree,
        node: NodeId,
        key: &str,
        subkey: &str,
        value: &serde_json::Value,
    ) -> ListenerControl {
        if node == self.planet && key == "messages" {
            tracing::info!(id = subkey, "manager message: {}", value);
        }
        ListenerControl::Keep
    }

    fn state_del_item(
        &self,
        _tree: &StateTree,
        node: NodeId,
        key: &str,
        subkey: &str,
        _value: &serde_json::Value,
    ) -> ListenerControl {
        if node == self.planet && key == "messages" {
            tracing::debug!(id = subkey, "manager message cleared");
        }
        ListenerControl::Keep
    }
}
