//! Domain models for the planet admin client.
//!
//! # Core Concepts
//!
//! - [`Mood`]: the lifecycle state of a component and the gates deciding which
//!   actions are currently legal on it.
//! - [`AvatarId`] / [`LogicalTarget`]: how callers address one component or a
//!   group of components.
//! - [`Snapshot`] / [`Delta`]: the wire form of the manager's state tree and
//!   its incremental changes.

mod avatar;
mod mood;
mod wire;

pub use avatar::*;
pub use mood::*;
pub use wire::*;
