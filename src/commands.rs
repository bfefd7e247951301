//! The admin commands. Each returns the text to print.

use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::action::{Action, ActionKind, ActionOptions, TargetError, TargetOutcome};
use crate::config::AdminConfig;
use crate::gateway::GatewayError;
use crate::models::{AvatarId, LogicalTarget, Mood, NodeId, NodeKind, StateValue};
use crate::render;
use crate::session::{QueryError, Session, SessionStatus};
use crate::state::planet::{ComponentView, PlanetView};
use crate::state::{ListenerControl, StateListener, StateTree};

fn planet_view<'a>(session: &Session, tree: &'a StateTree) -> Result<PlanetView<'a>> {
    PlanetView::new(tree, session.planet_root()).map_err(|_| QueryError::Disconnected.into())
}

pub fn show_planet(session: &Session) -> Result<String> {
    let tree = session.mirror().read();
    Ok(render::render_planet(&planet_view(session, &tree)?))
}

pub fn show_workers(session: &Session) -> String {
    render::render_workers(&session.workers())
}

pub fn show_component(session: &Session, path: &str) -> Result<String> {
    let component = session.resolve_avatar(path)?;
    let tree = session.mirror().read();
    let view = ComponentView::new(&tree, component.node).map_err(|_| QueryError::Disconnected)?;
    Ok(render::render_component(&view))
}

pub fn get_mood(session: &Session, path: &str) -> Result<String> {
    let avatar: AvatarId = path.parse()?;
    let mood = session.get_mood(&avatar)?;
    Ok(format!("{} is {}", avatar.name, mood))
}

pub fn get_property(session: &Session, path: &str, property: &str) -> Result<String> {
    let avatar: AvatarId = path.parse()?;
    let value = session.get_property(&avatar, property)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

pub fn list_properties(session: &Session, path: &str) -> Result<String> {
    let avatar: AvatarId = path.parse()?;
    Ok(session.list_properties(&avatar)?.join("\n"))
}

/// Call `method` on one component, whatever its mood.
pub async fn invoke(session: &Session, path: &str, method: &str) -> Result<String> {
    let avatar: AvatarId = path.parse()?;
    let report = session
        .orchestrator()
        .perform_action(
            &LogicalTarget::Component(avatar.clone()),
            &Action::invoke(method),
            &ActionOptions::default(),
        )
        .await?;

    match report.targets.first().map(|t| &t.outcome) {
        Some(TargetOutcome::Done { .. }) => {
            Ok(format!("Invoke of {} on {} was successful.", method, avatar.name))
        }
        Some(TargetOutcome::Failed(TargetError::NoMethod(_))) => {
            Ok(format!("No method '{}' on component '{}'", method, avatar))
        }
        Some(TargetOutcome::Failed(e)) => Err(anyhow::anyhow!(
            "Invoke of {} on {} failed: {}",
            method,
            avatar.name,
            e
        )),
        _ => Err(anyhow::anyhow!("Invoke of {} on {} was not attempted", method, avatar.name)),
    }
}

pub async fn perform(
    session: &Session,
    kind: ActionKind,
    path: &str,
    options: &ActionOptions,
) -> Result<String> {
    let target: LogicalTarget = path.parse()?;
    let report = session
        .orchestrator()
        .perform_action(&target, &kind.action(), options)
        .await?;
    Ok(report.to_string())
}

pub async fn load_configuration(
    session: &Session,
    file: &Path,
    save_as: Option<&str>,
) -> Result<String> {
    let mut output = format!("Loading configuration from file: {}\n", file.display());
    let xml = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let mut args = vec![serde_json::Value::String(xml)];
    if let Some(name) = save_as {
        args.push(serde_json::json!({ "saveAs": name }));
    }
    session.gateway().call_manager("loadConfiguration", args).await?;

    output.push_str("Configuration loaded successfully.");
    if save_as.is_some() {
        output.push_str("\nAdditionally, the configuration XML was saved on the manager.");
    }
    Ok(output)
}

/// Ask the manager to remove every stopped component.
pub async fn clean(session: &Session) -> Result<String> {
    match session.gateway().call_manager("cleanComponents", Vec::new()).await {
        Ok(_) => Ok("Removed all stopped components.".to_string()),
        Err(GatewayError::BusyComponent(detail)) => {
            tracing::debug!(%detail, "clean left busy components");
            Ok("Some component(s) are still busy and cannot be removed.".to_string())
        }
        Err(e) => Err(e.into()),
    }
}

pub fn recent(config: &AdminConfig) -> String {
    if config.recent_connections.is_empty() {
        return "No recent connections.".to_string();
    }
    config
        .recent_connections
        .iter()
        .map(|c| format!("{}  {}", c.last_used.format("%Y-%m-%d %H:%M"), c.url))
        .collect::<Vec<_>>()
        .join("\n")
}

enum WatchEvent {
    Line(String),
    /// A flow or component appeared and needs its own listener.
    Attach(NodeId),
}

/// Turns mirror changes into human-readable lines.
struct ChangePrinter {
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl ChangePrinter {
    fn send(&self, event: WatchEvent) -> ListenerControl {
        match self.tx.send(event) {
            Ok(()) => ListenerControl::Keep,
            Err(_) => ListenerControl::Detach,
        }
    }
}

fn describe(tree: &StateTree, id: NodeId) -> String {
    match ComponentView::new(tree, id) {
        Ok(c) if c.node().kind() == NodeKind::Component => c.avatar().to_string(),
        Ok(c) => c.name().unwrap_or("?").to_string(),
        Err(_) => format!("node {}", id),
    }
}

impl StateListener for ChangePrinter {
    fn state_set(
        &self,
        tree: &StateTree,
        node: NodeId,
        key: &str,
        value: &StateValue,
    ) -> ListenerControl {
        if key != "mood" {
            return ListenerControl::Keep;
        }
        let mood = value
            .as_scalar()
            .and_then(Mood::from_value)
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unknown".into());
        self.send(WatchEvent::Line(format!(
            "{} is now {}",
            describe(tree, node),
            mood
        )))
    }

    fn state_append(
        &self,
        tree: &StateTree,
        _node: NodeId,
        key: &str,
        value: &StateValue,
    ) -> ListenerControl {
        match (key, value.as_node()) {
            ("components", Some(id)) => {
                self.send(WatchEvent::Line(format!("{} added", describe(tree, id))));
                self.send(WatchEvent::Attach(id))
            }
            ("flows", Some(id)) => {
                self.send(WatchEvent::Line(format!("flow {} added", describe(tree, id))));
                self.send(WatchEvent::Attach(id))
            }
            ("names", None) => self.send(WatchEvent::Line(format!(
                "worker {} logged in",
                value.as_str().unwrap_or("?")
            ))),
            _ => ListenerControl::Keep,
        }
    }

    fn state_remove(
        &self,
        tree: &StateTree,
        _node: NodeId,
        key: &str,
        value: &StateValue,
    ) -> ListenerControl {
        match (key, value.as_node()) {
            ("components", Some(id)) | ("flows", Some(id)) => {
                self.send(WatchEvent::Line(format!("{} removed", describe(tree, id))))
            }
            ("names", None) => self.send(WatchEvent::Line(format!(
                "worker {} logged out",
                value.as_str().unwrap_or("?")
            ))),
            _ => ListenerControl::Keep,
        }
    }
}

/// Nodes a watcher listens on: the planet, its groups and components, the worker heaven.
fn watch_targets(session: &Session) -> Vec<NodeId> {
    let tree = session.mirror().read();
    let mut nodes = Vec::new();
    if let Ok(planet) = PlanetView::new(&tree, session.planet_root()) {
        nodes.push(planet.node().id());
        let groups = planet.flows().into_iter().chain(planet.atmosphere());
        for group in groups {
            nodes.push(group.node().id());
            nodes.extend(group.components().iter().map(|c| c.id()));
        }
    }
    nodes.extend(session.workers_root());
    nodes
}

/// Print mood, component and worker changes until `shutdown` resolves or the session drops.
pub async fn watch(
    session: &Session,
    shutdown: impl Future<Output = ()>,
    out: &mut impl Write,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer: Arc<dyn StateListener> = Arc::new(ChangePrinter { tx });
    let mirror = session.mirror();
    for node in watch_targets(session) {
        mirror.add_listener(node, printer.clone())?;
    }

    let mut status = session.status();
    tokio::pin!(shutdown);
    let result = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            changed = status.changed() => {
                let current = status.borrow_and_update().clone();
                match (changed, current) {
                    (Ok(()), SessionStatus::Connected) => {}
                    (_, SessionStatus::Disconnected(reason)) => {
                        break Err(anyhow::anyhow!("lost connection to manager: {}", reason))
                    }
                    _ => break Ok(()),
                }
            }
            event = rx.recv() => match event {
                Some(WatchEvent::Line(line)) => writeln!(out, "{}", line)?,
                Some(WatchEvent::Attach(node)) => {
                    // the new node's children arrived in the same delta
                    let mut nodes = vec![node];
                    if let Some(n) = mirror.read().get(node) {
                        nodes.extend(n.list("components").iter().filter_map(StateValue::as_node));
                    }
                    for node in nodes {
                        if let Err(e) = mirror.add_listener(node, printer.clone()) {
                            tracing::debug!("not watching node {}: {}", node, e);
                        }
                    }
                }
                None => break Ok(()),
            },
        }
    };

    for node in watch_targets(session) {
        mirror.remove_listener(node, &printer);
    }
    result
}
