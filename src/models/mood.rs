use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The lifecycle state of a component, as reported by the manager.
///
/// ```text
/// Waking ──> Happy <──> Sad
///   │          │         │
///   └──────────┴────┬────┘
///                   v
///               Sleeping ──> Waking (restart)
///
/// any ──> Lost
/// ```
///
/// `Sleeping` and `Lost` are terminal: nothing further happens to a component
/// in either mood until someone acts on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Happy,
    Waking,
    Sleeping,
    Lost,
    Sad,
}

#[derive(Debug, Error)]
#[error("unknown mood '{0}'")]
pub struct ParseMoodError(pub String);

impl Mood {
    pub const ALL: [Mood; 5] = [
        Mood::Happy,
        Mood::Waking,
        Mood::Sleeping,
        Mood::Lost,
        Mood::Sad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Happy => "happy",
            Self::Waking => "waking",
            Self::Sleeping => "sleeping",
            Self::Lost => "lost",
            Self::Sad => "sad",
        }
    }

    /// Legacy numeric code used by older managers.
    pub fn code(&self) -> u64 {
        match self {
            Self::Happy => 0,
            Self::Waking => 2,
            Self::Sleeping => 3,
            Self::Lost => 4,
            Self::Sad => 5,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Happy),
            2 => Some(Self::Waking),
            3 => Some(Self::Sleeping),
            4 => Some(Self::Lost),
            5 => Some(Self::Sad),
            _ => None,
        }
    }

    /// Decode a mood attribute value, accepting either the name or the numeric code.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(Self::from_code),
            _ => None,
        }
    }

    /// Display ordering only; higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Happy => 0,
            Self::Waking => 1,
            Self::Sleeping => 2,
            Self::Sad => 3,
            Self::Lost => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sleeping | Self::Lost)
    }

    /// Whether the manager is expected to move a component from `self` to `next`.
    pub fn can_transition_to(&self, next: Mood) -> bool {
        if next == Self::Lost {
            return *self != Self::Lost;
        }
        match self {
            Self::Waking => matches!(next, Self::Happy | Self::Sad | Self::Sleeping),
            Self::Happy => matches!(next, Self::Sad | Self::Sleeping),
            Self::Sad => matches!(next, Self::Happy | Self::Sleeping),
            Self::Sleeping => next == Self::Waking,
            Self::Lost => false,
        }
    }

    /// Only a fully stopped component may be started.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Sleeping)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Waking | Self::Happy | Self::Sad)
    }

    /// Deletion requires a quiesced component.
    pub fn can_delete(&self) -> bool {
        !self.can_stop()
    }
}

impl FromStr for Mood {
    type Err = ParseMoodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "happy" => Ok(Self::Happy),
            "waking" => Ok(Self::Waking),
            "sleeping" => Ok(Self::Sleeping),
            "lost" => Ok(Self::Lost),
            "sad" => Ok(Self::Sad),
            _ => Err(ParseMoodError(s.to_string())),
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
