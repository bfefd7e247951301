use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::models::{AvatarId, LogicalTarget, Mood};

use super::WaitError;

/// Why one component's part of an action failed. Never aborts sibling targets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("component is busy: {0}")]
    Busy(String),

    #[error("no method '{0}' on component")]
    NoMethod(String),

    #[error("component went away before reaching the expected mood")]
    TargetGone,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("connection problem: {0}")]
    Transport(String),

    #[error("{0}")]
    Remote(String),
}

impl From<GatewayError> for TargetError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::BusyComponent(msg) => Self::Busy(msg),
            GatewayError::NoMethod { method, .. } => Self::NoMethod(method),
            GatewayError::NotFound(_) => Self::TargetGone,
            GatewayError::ConnectionRefused(msg) | GatewayError::ConnectionFailed(msg) => {
                Self::Transport(msg)
            }
            GatewayError::Remote(msg) | GatewayError::Protocol(msg) => Self::Remote(msg),
        }
    }
}

impl From<WaitError> for TargetError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::TargetGone(_) => Self::TargetGone,
        }
    }
}

/// Terminal state of one action on one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// The mood gate refused the action; no call was made.
    Skipped { mood: Option<Mood> },
    /// The call succeeded and, when the action waits, the mood was reached.
    Done { mood: Option<Mood> },
    Failed(TargetError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub avatar: AvatarId,
    pub outcome: TargetOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSummary {
    NoEligibleTargets,
    AllSucceeded,
    SomeFailed,
}

/// Itemised result of one `perform_action` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub action: String,
    pub past: String,
    pub target: LogicalTarget,
    pub targets: Vec<TargetReport>,
    pub calls_issued: usize,
}

impl ActionReport {
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Skipped { .. }))
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Done { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.targets.iter().filter(|t| pred(&t.outcome)).count()
    }

    pub fn outcome_of(&self, avatar: &AvatarId) -> Option<&TargetOutcome> {
        self.targets
            .iter()
            .find(|t| &t.avatar == avatar)
            .map(|t| &t.outcome)
    }

    /// Targets that passed the mood gate, whether or not a call went out.
    pub fn eligible(&self) -> usize {
        self.targets.len() - self.skipped()
    }

    pub fn summary(&self) -> ActionSummary {
        if self.eligible() == 0 {
            ActionSummary::NoEligibleTargets
        } else if self.failed() > 0 {
            ActionSummary::SomeFailed
        } else {
            ActionSummary::AllSucceeded
        }
    }

    /// One line per component.
    pub fn lines(&self) -> Vec<String> {
        self.targets
            .iter()
            .map(|t| match &t.outcome {
                TargetOutcome::Skipped { mood } => format!(
                    "Cannot {} component {}, it is in mood: {}.",
                    self.action,
                    t.avatar,
                    mood.map(|m| m.as_str()).unwrap_or("unknown")
                ),
                TargetOutcome::Done { mood: Some(mood) } => {
                    format!("{} component {} (now {}).", capitalize(&self.past), t.avatar, mood)
                }
                TargetOutcome::Done { mood: None } => {
                    format!("{} component {}.", capitalize(&self.past), t.avatar)
                }
                TargetOutcome::Failed(e) => {
                    format!("Failed to {} component {}: {}.", self.action, t.avatar, e)
                }
            })
            .collect()
    }

    pub fn summary_line(&self) -> String {
        let scope = match &self.target {
            LogicalTarget::Component(_) => "Component".to_string(),
            LogicalTarget::Flow(name) => format!("Components in flow {}", name),
            LogicalTarget::Atmosphere => "Components in atmosphere".to_string(),
            LogicalTarget::Root => "Components in /".to_string(),
        };
        match self.summary() {
            ActionSummary::NoEligibleTargets => format!(
                "No eligible components to {} in {}.",
                self.action,
                self.target.describe()
            ),
            ActionSummary::AllSucceeded => {
                format!("{} now completed action {}.", scope, self.action)
            }
            ActionSummary::SomeFailed => format!(
                "Failed to {} some components: {} of {} failed.",
                self.action,
                self.failed(),
                self.eligible()
            ),
        }
    }
}

impl fmt::Display for ActionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{}", line)?;
        }
        write!(f, "{}", self.summary_line())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
