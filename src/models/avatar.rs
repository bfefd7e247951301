use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The grouping a component lives in.
///
/// `Root` means "wherever it is": lookups search the active flow first and
/// then the atmosphere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Flow(String),
    Atmosphere,
    Root,
}

impl Scope {
    fn parse(s: &str) -> Self {
        match s {
            "atmosphere" => Self::Atmosphere,
            "root" => Self::Root,
            other => Self::Flow(other.strip_prefix("flow:").unwrap_or(other).to_string()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flow(name) => f.write_str(name),
            Self::Atmosphere => f.write_str("atmosphere"),
            Self::Root => f.write_str("root"),
        }
    }
}

/// Addresses one component: names are only unique within their flow or the atmosphere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AvatarId {
    pub scope: Scope,
    pub name: String,
}

impl AvatarId {
    pub fn new(scope: Scope, name: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
        }
    }

    pub fn in_flow(flow: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Scope::Flow(flow.into()), name)
    }

    pub fn in_atmosphere(name: impl Into<String>) -> Self {
        Self::new(Scope::Atmosphere, name)
    }
}

impl fmt::Display for AvatarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.scope, self.name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty component path")]
    Empty,

    #[error("'{0}' is not a component path, expected /<flow|atmosphere>/<component>")]
    NotAComponent(String),

    #[error("'{0}' has too many segments")]
    TooDeep(String),
}

fn segments(s: &str) -> Vec<&str> {
    s.trim()
        .trim_matches('/')
        .split('/')
        .filter(|seg| !seg.is_empty())
        .collect()
}

impl FromStr for AvatarId {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match segments(s).as_slice() {
            [] => Err(PathError::Empty),
            [scope, name] => Ok(Self::new(Scope::parse(scope), *name)),
            [_] => Err(PathError::NotAComponent(s.to_string())),
            _ => Err(PathError::TooDeep(s.to_string())),
        }
    }
}

/// What an action is aimed at, before it is resolved against the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalTarget {
    Component(AvatarId),
    Flow(String),
    Atmosphere,
    Root,
}

impl LogicalTarget {
    /// Short description used in completion messages ("flow default", "/").
    pub fn describe(&self) -> String {
        match self {
            Self::Component(avatar) => format!("component {}", avatar),
            Self::Flow(name) => format!("flow {}", name),
            Self::Atmosphere => "atmosphere".to_string(),
            Self::Root => "/".to_string(),
        }
    }
}

impl fmt::Display for LogicalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Component(avatar) => write!(f, "{}", avatar),
            Self::Flow(name) => write!(f, "/{}", name),
            Self::Atmosphere => f.write_str("/atmosphere"),
            Self::Root => f.write_str("/"),
        }
    }
}

/// Accepted forms:
/// - `/` or `root`: everything
/// - `/atmosphere`: the atmosphere's components
/// - `/<flow>` or `flow:<flow>`: one flow's components
/// - `/<scope>/<component>`: a single component
impl FromStr for LogicalTarget {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "root" {
            return Ok(Self::Root);
        }
        match segments(trimmed).as_slice() {
            [] if trimmed.starts_with('/') => Ok(Self::Root),
            [] => Err(PathError::Empty),
            [single] => Ok(match Scope::parse(single) {
                Scope::Atmosphere => Self::Atmosphere,
                Scope::Root => Self::Root,
                Scope::Flow(name) => Self::Flow(name),
            }),
            [scope, name] => Ok(Self::Component(AvatarId::new(Scope::parse(scope), *name))),
            _ => Err(PathError::TooDeep(s.to_string())),
        }
    }
}
