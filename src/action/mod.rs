//! Mood-gated lifecycle actions on groups of components.
//!
//! An action is resolved against the mirror, gated per component on its
//! current mood, fanned out as concurrent remote calls, and (for start/stop)
//! followed by a wait until each component reaches a terminal mood. Results
//! are always itemised; a failing component never aborts its siblings.

mod report;
mod waiter;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::gateway::{ComponentRef, RemoteGateway};
use crate::models::{AvatarId, LogicalTarget, Mood, NodeId};
use crate::session::SessionStatus;
use crate::state::planet::{PlanetView, ResolveError};
use crate::state::Mirror;

pub use report::*;
pub use waiter::*;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    TargetNotFound(#[from] ResolveError),

    #[error("not connected to the manager: {0}")]
    Disconnected(String),

    #[error("failed to collect results: {0}")]
    Aggregation(String),
}

/// The built-in lifecycle actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Start,
    Stop,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Self::Start => Action::start(),
            Self::Stop => Action::stop(),
            Self::Delete => Action::delete(),
        }
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// What to call on each component, when it is allowed, and what mood means "done".
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub past: String,
    pub method: String,
    pub wait_for: Option<Vec<Mood>>,
    pub gate: fn(&Mood) -> bool,
}

impl Action {
    pub fn start() -> Self {
        Self {
            name: "start".into(),
            past: "started".into(),
            method: "componentStart".into(),
            wait_for: Some(vec![Mood::Happy, Mood::Sad]),
            gate: Mood::can_start,
        }
    }

    pub fn stop() -> Self {
        Self {
            name: "stop".into(),
            past: "stopped".into(),
            method: "componentStop".into(),
            wait_for: Some(vec![Mood::Sleeping]),
            gate: Mood::can_stop,
        }
    }

    pub fn delete() -> Self {
        Self {
            name: "delete".into(),
            past: "deleted".into(),
            method: "deleteComponent".into(),
            wait_for: None,
            gate: Mood::can_delete,
        }
    }

    /// Call an arbitrary component method, whatever the mood.
    pub fn invoke(method: impl Into<String>) -> Self {
        Self {
            name: "invoke".into(),
            past: "invoked".into(),
            method: method.into(),
            wait_for: None,
            gate: |_| true,
        }
    }

    /// A component with an unknown mood is never eligible.
    pub fn permits(&self, mood: Option<Mood>) -> bool {
        mood.is_some_and(|m| (self.gate)(&m))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ActionOptions {
    /// Per-component bound on call plus mood wait. `None` waits forever.
    pub timeout: Option<Duration>,
}

struct Planned {
    node: NodeId,
    avatar: AvatarId,
    mood: Option<Mood>,
}

#[derive(Clone)]
pub struct ActionOrchestrator {
    gateway: Arc<dyn RemoteGateway>,
    mirror: Mirror,
    planet: NodeId,
    status: watch::Receiver<SessionStatus>,
}

impl ActionOrchestrator {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        mirror: Mirror,
        planet: NodeId,
        status: watch::Receiver<SessionStatus>,
    ) -> Self {
        Self {
            gateway,
            mirror,
            planet,
            status,
        }
    }

    /// Run `action` on every component `target` covers.
    ///
    /// Fails as a whole only when the target cannot be resolved, the session
    /// is disconnected, or a worker task dies. Dropping the returned future
    /// abandons every outstanding mood wait; calls already sent stay sent.
    pub async fn perform_action(
        &self,
        target: &LogicalTarget,
        action: &Action,
        options: &ActionOptions,
    ) -> Result<ActionReport, ActionError> {
        if let Some(reason) = self.disconnect_reason() {
            return Err(ActionError::Disconnected(reason));
        }

        let planned: Vec<Planned> = {
            let tree = self.mirror.read();
            let planet = PlanetView::new(&tree, self.planet)
                .map_err(|e| ActionError::Disconnected(e.to_string()))?;
            planet
                .resolve(target)?
                .into_iter()
                .map(|c| Planned {
                    node: c.id(),
                    avatar: c.avatar(),
                    mood: c.mood(),
                })
                .collect()
        };
        tracing::debug!(action = %action.name, %target, count = planned.len(), "resolved targets");

        let mut outcomes: Vec<Option<TargetOutcome>> = planned.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();
        let mut calls_issued = 0;

        for (index, planned) in planned.iter().enumerate() {
            if !action.permits(planned.mood) {
                tracing::info!(
                    "Cannot {} component {}, it is in mood: {}",
                    action.name,
                    planned.avatar,
                    planned.mood.map(|m| m.as_str()).unwrap_or("unknown")
                );
                outcomes[index] = Some(TargetOutcome::Skipped { mood: planned.mood });
                continue;
            }

            let wait = match &action.wait_for {
                Some(moods) => match MoodWait::attach(&self.mirror, planned.node, moods) {
                    Ok(wait) => Some(wait),
                    Err(e) => {
                        tracing::warn!(avatar = %planned.avatar, "component vanished before the call: {}", e);
                        outcomes[index] = Some(TargetOutcome::Failed(TargetError::TargetGone));
                        continue;
                    }
                },
                None => None,
            };

            let component = ComponentRef {
                node: planned.node,
                avatar: planned.avatar.clone(),
            };
            let gateway = self.gateway.clone();
            let method = action.method.clone();
            let timeout = options.timeout;
            calls_issued += 1;
            tasks.spawn(async move {
                (index, run_target(gateway, component, method, wait, timeout).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = joined.map_err(|e| ActionError::Aggregation(e.to_string()))?;
            outcomes[index] = Some(outcome);
        }

        let targets = planned
            .into_iter()
            .zip(outcomes)
            .map(|(planned, outcome)| TargetReport {
                avatar: planned.avatar,
                outcome: outcome.unwrap_or_else(|| {
                    TargetOutcome::Failed(TargetError::Remote("no result recorded".into()))
                }),
            })
            .collect();

        let report = ActionReport {
            action: action.name.clone(),
            past: action.past.clone(),
            target: target.clone(),
            targets,
            calls_issued,
        };
        tracing::info!(
            action = %report.action,
            %target,
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "action finished"
        );
        Ok(report)
    }

    fn disconnect_reason(&self) -> Option<String> {
        match &*self.status.borrow() {
            SessionStatus::Connected => None,
            SessionStatus::Disconnected(reason) => Some(reason.clone()),
            SessionStatus::Closed => Some("session closed".into()),
        }
    }
}

/// Call, then wait for the mood if asked to. The wait is released on every exit path.
async fn run_target(
    gateway: Arc<dyn RemoteGateway>,
    component: ComponentRef,
    method: String,
    wait: Option<MoodWait>,
    timeout: Option<Duration>,
) -> TargetOutcome {
    let avatar = component.avatar.clone();
    let branch = call_and_wait(gateway, component, method, wait);

    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, branch)
            .await
            .unwrap_or(Err(TargetError::TimedOut(limit))),
        None => branch.await,
    };

    match result {
        Ok(mood) => TargetOutcome::Done { mood },
        Err(e) => {
            tracing::warn!(%avatar, "{}", e);
            TargetOutcome::Failed(e)
        }
    }
}

async fn call_and_wait(
    gateway: Arc<dyn RemoteGateway>,
    component: ComponentRef,
    method: String,
    wait: Option<MoodWait>,
) -> Result<Option<Mood>, TargetError> {
    gateway.call(&component, &method, Vec::new()).await?;
    match wait {
        Some(wait) => Ok(Some(wait.wait().await?)),
        None => Ok(None),
    }
}
