//! Typed read-only projections over the planet and worker-heaven subtrees.
//!
//! Only the first flow of a planet is treated as active. Any further flows
//! stay in the mirror but are invisible to lookups and target resolution.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::models::{AvatarId, LogicalTarget, Mood, NodeId, NodeKind, Scope, StateValue};

use super::{Node, StateError, StateTree};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("The flow {0} is not found.")]
    FlowNotFound(String),

    #[error("Could not find component {0}")]
    ComponentNotFound(AvatarId),

    #[error("planet has no atmosphere")]
    NoAtmosphere,
}

fn children<'a>(tree: &'a StateTree, node: &'a Node, key: &str) -> impl Iterator<Item = &'a Node> {
    node.list(key)
        .iter()
        .filter_map(StateValue::as_node)
        .filter_map(move |id| tree.get(id))
}

#[derive(Debug, Clone, Copy)]
pub struct PlanetView<'a> {
    tree: &'a StateTree,
    node: &'a Node,
}

impl<'a> PlanetView<'a> {
    pub fn new(tree: &'a StateTree, root: NodeId) -> Result<Self, StateError> {
        Ok(Self {
            tree,
            node: tree.node(root)?,
        })
    }

    pub fn node(&self) -> &'a Node {
        self.node
    }

    pub fn name(&self) -> Option<&'a str> {
        self.node.get_str("name")
    }

    pub fn atmosphere(&self) -> Option<GroupView<'a>> {
        let id = self.node.get("atmosphere")?.as_node()?;
        Some(GroupView {
            tree: self.tree,
            node: self.tree.get(id)?,
        })
    }

    /// Every flow the manager reported, in order.
    pub fn flows(&self) -> Vec<GroupView<'a>> {
        children(self.tree, self.node, "flows")
            .map(|node| GroupView {
                tree: self.tree,
                node,
            })
            .collect()
    }

    pub fn active_flow(&self) -> Option<GroupView<'a>> {
        self.flows().into_iter().next()
    }

    /// Flows reported after the first; not acted upon.
    pub fn ignored_flows(&self) -> Vec<GroupView<'a>> {
        self.flows().into_iter().skip(1).collect()
    }

    pub fn messages(&self) -> Option<&'a BTreeMap<String, serde_json::Value>> {
        self.node.dict("messages")
    }

    /// Components of the active flow followed by those of the atmosphere.
    pub fn components(&self) -> Vec<ComponentView<'a>> {
        let mut components = Vec::new();
        if let Some(flow) = self.active_flow() {
            components.extend(flow.components());
        }
        if let Some(atmosphere) = self.atmosphere() {
            components.extend(atmosphere.components());
        }
        components
    }

    pub fn find_component(&self, avatar: &AvatarId) -> Option<ComponentView<'a>> {
        match &avatar.scope {
            Scope::Flow(flow) => self
                .active_flow()
                .filter(|f| f.name() == Some(flow.as_str()))?
                .component(&avatar.name),
            Scope::Atmosphere => self.atmosphere()?.component(&avatar.name),
            Scope::Root => self
                .components()
                .into_iter()
                .find(|c| c.name() == Some(avatar.name.as_str())),
        }
    }

    /// Turn a logical target into the concrete components it covers, in tree order.
    pub fn resolve(&self, target: &LogicalTarget) -> Result<Vec<ComponentView<'a>>, ResolveError> {
        match target {
            LogicalTarget::Component(avatar) => self
                .find_component(avatar)
                .map(|c| vec![c])
                .ok_or_else(|| ResolveError::ComponentNotFound(avatar.clone())),
            LogicalTarget::Flow(name) => {
                let flow = self
                    .active_flow()
                    .filter(|f| f.name() == Some(name.as_str()));
                match flow {
                    Some(flow) => Ok(flow.components()),
                    None => {
                        if self.ignored_flows().iter().any(|f| f.name() == Some(name.as_str())) {
                            tracing::warn!(flow = %name, "only the first flow is handled, ignoring");
                        }
                        Err(ResolveError::FlowNotFound(name.clone()))
                    }
                }
            }
            LogicalTarget::Atmosphere => self
                .atmosphere()
                .map(|a| a.components())
                .ok_or(ResolveError::NoAtmosphere),
            LogicalTarget::Root => Ok(self.components()),
        }
    }
}

/// A flow or the atmosphere.
#[derive(Debug, Clone, Copy)]
pub struct GroupView<'a> {
    tree: &'a StateTree,
    node: &'a Node,
}

impl<'a> GroupView<'a> {
    pub fn node(&self) -> &'a Node {
        self.node
    }

    pub fn name(&self) -> Option<&'a str> {
        self.node.get_str("name")
    }

    pub fn scope(&self) -> Scope {
        match self.node.kind() {
            NodeKind::Atmosphere => Scope::Atmosphere,
            _ => Scope::Flow(self.name().unwrap_or_default().to_string()),
        }
    }

    pub fn components(&self) -> Vec<ComponentView<'a>> {
        children(self.tree, self.node, "components")
            .map(|node| ComponentView {
                tree: self.tree,
                node,
            })
            .collect()
    }

    pub fn component(&self, name: &str) -> Option<ComponentView<'a>> {
        self.components()
            .into_iter()
            .find(|c| c.name() == Some(name))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ComponentView<'a> {
    tree: &'a StateTree,
    node: &'a Node,
}

impl<'a> ComponentView<'a> {
    pub fn new(tree: &'a StateTree, id: NodeId) -> Result<Self, StateError> {
        Ok(Self {
            tree,
            node: tree.node(id)?,
        })
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn node(&self) -> &'a Node {
        self.node
    }

    pub fn name(&self) -> Option<&'a str> {
        self.node.get_str("name")
    }

    /// `None` when the manager has not reported a recognisable mood.
    pub fn mood(&self) -> Option<Mood> {
        self.node.scalar("mood").and_then(Mood::from_value)
    }

    pub fn config(&self) -> Option<&'a serde_json::Value> {
        self.node.scalar("config")
    }

    pub fn component_type(&self) -> Option<&'a str> {
        self.config()?.get("type")?.as_str()
    }

    pub fn properties(&self) -> Option<&'a serde_json::Map<String, serde_json::Value>> {
        self.config()?.get("properties")?.as_object()
    }

    pub fn messages(&self) -> Option<&'a BTreeMap<String, serde_json::Value>> {
        self.node.dict("messages")
    }

    /// Where this component lives, read through the parent back-reference.
    pub fn scope(&self) -> Scope {
        let parent = self.node.parent().and_then(|id| self.tree.get(id));
        match parent {
            Some(p) if p.kind() == NodeKind::Atmosphere => Scope::Atmosphere,
            Some(p) if p.kind() == NodeKind::Flow => {
                Scope::Flow(p.get_str("name").unwrap_or_default().to_string())
            }
            _ => Scope::Root,
        }
    }

    pub fn avatar(&self) -> AvatarId {
        AvatarId::new(self.scope(), self.name().unwrap_or_default())
    }
}

/// A worker currently logged into the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: String,
    pub host: Option<String>,
}

/// List the workers under a worker-heaven node.
pub fn workers(tree: &StateTree, heaven: NodeId) -> Result<Vec<WorkerInfo>, StateError> {
    let node = tree.node(heaven)?;
    Ok(children(tree, node, "workers")
        .map(|worker| WorkerInfo {
            name: worker.get_str("name").unwrap_or_default().to_string(),
            host: worker.get_str("host").map(str::to_string),
        })
        .collect())
}
