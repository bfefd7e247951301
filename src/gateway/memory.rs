//! In-process manager.
//!
//! Keeps its own authoritative [`StateTree`], answers calls the way a manager
//! would (start/stop/delete move moods or remove components through deltas),
//! and fans every delta out to subscribers. Individual calls can be scripted
//! to fail or to take time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{ComponentRef, DeltaReceiver, GatewayError, RemoteGateway};
use crate::models::{Delta, Mood, NodeId, NodeKind, NodeSnapshot, Scope, Snapshot, StateValue};
use crate::state::planet::PlanetView;
use crate::state::StateTree;

const PLANET: NodeId = 1;
const ATMOSPHERE: NodeId = 2;
const WORKER_HEAVEN: NodeId = 3;
const SUBSCRIBER_BUFFER: usize = 1024;

/// How the manager answers one call.
#[derive(Debug, Clone)]
pub struct CallScript {
    pub result: Result<serde_json::Value, GatewayError>,
    /// Emitted after `delay`, before the reply.
    pub deltas: Vec<Delta>,
    pub delay: Duration,
}

impl CallScript {
    pub fn ok() -> Self {
        Self {
            result: Ok(serde_json::Value::Null),
            deltas: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn fail(error: GatewayError) -> Self {
        Self {
            result: Err(error),
            ..Self::ok()
        }
    }

    pub fn with_deltas(mut self, deltas: Vec<Delta>) -> Self {
        self.deltas = deltas;
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One call as the manager received it.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// `None` for manager-level calls.
    pub component: Option<ComponentRef>,
    pub method: String,
    pub args: Vec<serde_json::Value>,
}

struct Inner {
    tree: StateTree,
    subscribers: Vec<mpsc::Sender<Result<Delta, GatewayError>>>,
    scripts: HashMap<(String, String), CallScript>,
    manager_scripts: HashMap<String, CallScript>,
    calls: Vec<CallRecord>,
    refuse: bool,
    /// Number of the last emitted delta.
    seq: u64,
    /// Artificial latency added to every built-in component call.
    latency: Duration,
}

pub struct MemoryGateway {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    /// An empty planet with an atmosphere and no workers.
    pub fn new() -> Self {
        let mut tree = StateTree::new();
        let planet = Snapshot {
            root: PLANET,
            nodes: vec![
                NodeSnapshot::new(PLANET, NodeKind::Planet)
                    .attr("name", "planet")
                    .child("atmosphere", ATMOSPHERE)
                    .list("flows", Vec::new())
                    .dict("messages"),
                NodeSnapshot::new(ATMOSPHERE, NodeKind::Atmosphere)
                    .attr("name", "atmosphere")
                    .list("components", Vec::new()),
            ],
            seq: None,
        };
        let heaven = Snapshot {
            root: WORKER_HEAVEN,
            nodes: vec![NodeSnapshot::new(WORKER_HEAVEN, NodeKind::WorkerHeaven)
                .list("workers", Vec::new())
                .list("names", Vec::new())],
            seq: None,
        };
        tree.load(planet).expect("planet skeleton loads into an empty tree");
        tree.load(heaven).expect("worker heaven skeleton loads next to the planet");

        Self {
            inner: Mutex::new(Inner {
                tree,
                subscribers: Vec::new(),
                scripts: HashMap::new(),
                manager_scripts: HashMap::new(),
                calls: Vec::new(),
                refuse: false,
                seq: 0,
                latency: Duration::ZERO,
            }),
            next_id: AtomicU64::new(100),
        }
    }

    /// A small streaming setup: one flow, a porter in the atmosphere, one worker.
    pub fn demo() -> Self {
        let gateway = Self::new();
        gateway.add_worker("localhost", "127.0.0.1");
        gateway.add_component(&Scope::Atmosphere, "porter-http", "porter", Mood::Happy);
        gateway.add_flow("default");
        let flow = Scope::Flow("default".into());
        gateway.add_component(&flow, "producer-video", "videotest-producer", Mood::Happy);
        gateway.add_component(&flow, "encoder-video", "theora-encoder", Mood::Happy);
        gateway.add_component(&flow, "muxer-video", "ogg-muxer", Mood::Sad);
        gateway.add_component(&flow, "http-video", "http-streamer", Mood::Sleeping);
        gateway.set_message("welcome", json!({"level": "info", "text": "demo manager"}));
        gateway
    }

    fn allocate(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn planet_id(&self) -> NodeId {
        PLANET
    }

    pub fn worker_heaven_id(&self) -> NodeId {
        WORKER_HEAVEN
    }

    /// Apply a delta to the manager's tree and push it to every subscriber.
    ///
    /// Every delta is numbered; snapshots carry the number of the last one.
    pub fn emit(&self, delta: Delta) {
        let mut inner = self.inner.lock();
        let delta = delta.with_seq(inner.seq + 1);
        if let Err(e) = inner.tree.apply(delta.clone()) {
            tracing::warn!(?delta, "manager rejected its own delta: {}", e);
            return;
        }
        inner.seq += 1;
        inner.subscribers.retain(|tx| match tx.try_send(Ok(delta.clone())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("subscriber is not keeping up, dropping delta");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn add_flow(&self, name: &str) -> NodeId {
        let id = self.allocate();
        self.emit(
            Delta::append(PLANET, "flows", StateValue::Node(id)).with_nodes(vec![
                NodeSnapshot::new(id, NodeKind::Flow)
                    .attr("name", name)
                    .list("components", Vec::new()),
            ]),
        );
        id
    }

    /// Add a component to a flow (which must exist) or the atmosphere.
    pub fn add_component(&self, scope: &Scope, name: &str, kind: &str, mood: Mood) -> NodeId {
        let parent = match scope {
            Scope::Flow(flow) => {
                let inner = self.inner.lock();
                let found = PlanetView::new(&inner.tree, PLANET).ok().and_then(|p| {
                    p.flows()
                        .into_iter()
                        .find(|f| f.name() == Some(flow.as_str()))
                        .map(|f| f.node().id())
                });
                match found {
                    Some(id) => id,
                    None => {
                        tracing::warn!(flow = %flow, "no such flow, adding component to the atmosphere");
                        ATMOSPHERE
                    }
                }
            }
            Scope::Atmosphere | Scope::Root => ATMOSPHERE,
        };
        let id = self.allocate();
        self.emit(
            Delta::append(parent, "components", StateValue::Node(id)).with_nodes(vec![
                NodeSnapshot::new(id, NodeKind::Component)
                    .attr("name", name)
                    .attr("mood", mood.as_str())
                    .attr(
                        "config",
                        json!({"type": kind, "properties": {"name": name}}),
                    )
                    .dict("messages"),
            ]),
        );
        id
    }

    pub fn set_mood(&self, component: NodeId, mood: Mood) {
        self.emit(Delta::set(component, "mood", mood.as_str()));
    }

    pub fn remove_component(&self, component: NodeId) {
        let parent = self.inner.lock().tree.get(component).and_then(|n| n.parent());
        if let Some(parent) = parent {
            self.emit(Delta::remove(parent, "components", StateValue::Node(component)));
        }
    }

    pub fn add_worker(&self, name: &str, host: &str) -> NodeId {
        let id = self.allocate();
        self.emit(
            Delta::append(WORKER_HEAVEN, "workers", StateValue::Node(id)).with_nodes(vec![
                NodeSnapshot::new(id, NodeKind::Worker)
                    .attr("name", name)
                    .attr("host", host),
            ]),
        );
        self.emit(Delta::append(WORKER_HEAVEN, "names", name));
        id
    }

    pub fn remove_worker(&self, name: &str) {
        let worker = {
            let inner = self.inner.lock();
            inner.tree.get(WORKER_HEAVEN).and_then(|heaven| {
                heaven
                    .list("workers")
                    .iter()
                    .filter_map(StateValue::as_node)
                    .find(|id| inner.tree.get(*id).and_then(|w| w.get_str("name")) == Some(name))
            })
        };
        if let Some(id) = worker {
            self.emit(Delta::remove(WORKER_HEAVEN, "workers", StateValue::Node(id)));
        }
        self.emit(Delta::remove(WORKER_HEAVEN, "names", name));
    }

    pub fn set_message(&self, id: &str, message: serde_json::Value) {
        self.emit(Delta::set_item(PLANET, "messages", id, message));
    }

    pub fn clear_message(&self, id: &str) {
        self.emit(Delta::del_item(PLANET, "messages", id));
    }

    /// Override how `method` behaves for the component called `component`.
    pub fn script(&self, component: &str, method: &str, script: CallScript) {
        self.inner
            .lock()
            .scripts
            .insert((component.to_string(), method.to_string()), script);
    }

    pub fn script_manager(&self, method: &str, script: CallScript) {
        self.inner
            .lock()
            .manager_scripts
            .insert(method.to_string(), script);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.lock().refuse = refuse;
    }

    /// Drop every subscriber after telling it the connection failed.
    pub fn disconnect(&self) {
        let subscribers = std::mem::take(&mut self.inner.lock().subscribers);
        for tx in subscribers {
            let _ = tx.try_send(Err(GatewayError::ConnectionFailed(
                "manager went away".into(),
            )));
        }
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Current mood of a component according to the manager.
    pub fn mood_of(&self, component: NodeId) -> Option<Mood> {
        self.inner
            .lock()
            .tree
            .get(component)
            .and_then(|n| n.scalar("mood"))
            .and_then(Mood::from_value)
    }

    fn check_connection(&self) -> Result<(), GatewayError> {
        if self.inner.lock().refuse {
            Err(GatewayError::ConnectionRefused("manager refused the connection".into()))
        } else {
            Ok(())
        }
    }

    async fn run(&self, script: CallScript) -> Result<serde_json::Value, GatewayError> {
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        for delta in script.deltas {
            self.emit(delta);
        }
        script.result
    }
}

fn component_script(tree: &StateTree, component: &ComponentRef, method: &str) -> CallScript {
    let Some(node) = tree.get(component.node) else {
        return CallScript::fail(GatewayError::NotFound(component.avatar.to_string()));
    };
    let mood = node.scalar("mood").and_then(Mood::from_value);
    let busy = || CallScript::fail(GatewayError::BusyComponent(component.avatar.to_string()));
    let id = component.node;

    match method {
        "componentStart" if mood.is_some_and(|m| m.can_start()) => CallScript::ok()
            .with_deltas(vec![
                Delta::set(id, "mood", Mood::Waking.as_str()),
                Delta::set(id, "mood", Mood::Happy.as_str()),
            ]),
        "componentStop" if mood.is_some_and(|m| m.can_stop()) => {
            CallScript::ok().with_deltas(vec![Delta::set(id, "mood", Mood::Sleeping.as_str())])
        }
        "deleteComponent" if mood.is_some_and(|m| m.can_delete()) => match node.parent() {
            Some(parent) => CallScript::ok().with_deltas(vec![Delta::remove(
                parent,
                "components",
                StateValue::Node(id),
            )]),
            None => CallScript::fail(GatewayError::NotFound(component.avatar.to_string())),
        },
        "componentStart" | "componentStop" | "deleteComponent" => busy(),
        _ => CallScript::fail(GatewayError::NoMethod {
            target: component.avatar.to_string(),
            method: method.to_string(),
        }),
    }
}

fn manager_script(tree: &StateTree, method: &str) -> CallScript {
    match method {
        "loadConfiguration" => CallScript::ok(),
        "cleanComponents" => {
            let Ok(planet) = PlanetView::new(tree, PLANET) else {
                return CallScript::ok();
            };
            let mut removals = Vec::new();
            let mut busy = 0;
            for component in planet.components() {
                match (component.mood(), component.node().parent()) {
                    (Some(mood), Some(parent)) if mood.can_delete() => removals.push(
                        Delta::remove(parent, "components", StateValue::Node(component.id())),
                    ),
                    _ => busy += 1,
                }
            }
            let script = if busy > 0 {
                CallScript::fail(GatewayError::BusyComponent(format!(
                    "{} component(s) still running",
                    busy
                )))
            } else {
                CallScript::ok()
            };
            script.with_deltas(removals)
        }
        _ => CallScript::fail(GatewayError::NoMethod {
            target: "manager".into(),
            method: method.to_string(),
        }),
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn fetch_snapshot(&self) -> Result<Snapshot, GatewayError> {
        self.check_connection()?;
        let inner = self.inner.lock();
        inner
            .tree
            .snapshot(PLANET)
            .map(|snapshot| snapshot.with_seq(inner.seq))
            .map_err(|e| GatewayError::Remote(e.to_string()))
    }

    async fn list_workers(&self) -> Result<Snapshot, GatewayError> {
        self.check_connection()?;
        let inner = self.inner.lock();
        inner
            .tree
            .snapshot(WORKER_HEAVEN)
            .map(|snapshot| snapshot.with_seq(inner.seq))
            .map_err(|e| GatewayError::Remote(e.to_string()))
    }

    async fn subscribe(&self) -> Result<DeltaReceiver, GatewayError> {
        self.check_connection()?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.lock().subscribers.push(tx);
        Ok(rx)
    }

    async fn call(
        &self,
        component: &ComponentRef,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let script = {
            let mut inner = self.inner.lock();
            if inner.refuse {
                return Err(GatewayError::ConnectionFailed("manager unreachable".into()));
            }
            inner.calls.push(CallRecord {
                component: Some(component.clone()),
                method: method.to_string(),
                args,
            });
            let key = (component.avatar.name.clone(), method.to_string());
            match inner.scripts.get(&key) {
                Some(script) => script.clone(),
                None => component_script(&inner.tree, component, method).after(inner.latency),
            }
        };
        self.run(script).await
    }

    async fn call_manager(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let script = {
            let mut inner = self.inner.lock();
            if inner.refuse {
                return Err(GatewayError::ConnectionFailed("manager unreachable".into()));
            }
            inner.calls.push(CallRecord {
                component: None,
                method: method.to_string(),
                args,
            });
            match inner.manager_scripts.get(method) {
                Some(script) => script.clone(),
                None => manager_script(&inner.tree, method),
            }
        };
        self.run(script).await
    }
}
