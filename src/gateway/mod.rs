//! Contract with the manager: snapshots, the delta stream, and remote calls.
//!
//! Two implementations ship with the crate: [`HttpGateway`] talks to a real
//! manager over HTTP + server-sent events, [`MemoryGateway`] is an in-process
//! manager used by tests and `--demo`.

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{AvatarId, Delta, NodeId, Snapshot};

pub use http::HttpGateway;
pub use memory::{CallRecord, CallScript, MemoryGateway};

/// Gateway errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("no method '{method}' on component {target}")]
    NoMethod { target: String, method: String },

    #[error("component busy: {0}")]
    BusyComponent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Whether the session itself is unusable, as opposed to one call failing.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::ConnectionRefused(_) | Self::ConnectionFailed(_))
    }
}

/// How a call addresses a component: its node in the mirror plus its avatar id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub node: NodeId,
    pub avatar: AvatarId,
}

/// Deltas in manager order. A final `Err` (or the channel closing) means the stream is gone.
pub type DeltaReceiver = mpsc::Receiver<Result<Delta, GatewayError>>;

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// The planet tree, fetched once per session.
    async fn fetch_snapshot(&self) -> Result<Snapshot, GatewayError>;

    /// The worker heaven tree.
    async fn list_workers(&self) -> Result<Snapshot, GatewayError>;

    /// Every delta for the planet and worker trees from now on.
    async fn subscribe(&self) -> Result<DeltaReceiver, GatewayError>;

    /// Call `method` on the manager on behalf of `component`.
    async fn call(
        &self,
        component: &ComponentRef,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError>;

    /// Call a manager-level method (e.g. `loadConfiguration`).
    async fn call_manager(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError>;
}
