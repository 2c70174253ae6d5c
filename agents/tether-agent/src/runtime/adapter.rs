//! Runtime Host Trait
//!
//! Defines the interface the agent drives to install, update and run units
//! inside a managed runtime host.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::refresh::RefreshSignal;

/// Host-assigned unit identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u64);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Uninstalled,
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
}

impl UnitState {
    /// Whether a unit in this state must be restarted after being quiesced
    pub fn is_active(&self) -> bool {
        matches!(self, UnitState::Active | UnitState::Starting)
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Uninstalled => write!(f, "uninstalled"),
            UnitState::Installed => write!(f, "installed"),
            UnitState::Resolved => write!(f, "resolved"),
            UnitState::Starting => write!(f, "starting"),
            UnitState::Active => write!(f, "active"),
            UnitState::Stopping => write!(f, "stopping"),
        }
    }
}

/// A managed unit as seen by the runtime host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub location: String,
    pub state: UnitState,
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.location, self.id)
    }
}

/// Runtime host trait - common interface for all unit runtimes
///
/// Calls are issued sequentially by the agent; implementations need not
/// support concurrent transitions of related units.
#[async_trait]
pub trait RuntimeHost: Send + Sync {
    /// Get the runtime type name
    fn runtime_type(&self) -> &str;

    /// Install a new unit at `location` from the artifact content
    async fn install(&self, location: &str, content: Bytes) -> Result<Unit>;

    /// Replace the content of an existing unit in place
    async fn update(&self, id: UnitId, content: Bytes) -> Result<()>;

    async fn start(&self, id: UnitId) -> Result<()>;

    async fn stop(&self, id: UnitId) -> Result<()>;

    async fn uninstall(&self, id: UnitId) -> Result<()>;

    /// List all units known to the host
    async fn list(&self) -> Result<Vec<Unit>>;

    /// Look up a unit by location
    async fn get(&self, location: &str) -> Result<Option<Unit>>;

    /// Look up a unit by id
    async fn get_by_id(&self, id: UnitId) -> Result<Option<Unit>>;

    /// Whether the host can re-resolve unit wiring after a change
    fn supports_refresh(&self) -> bool {
        false
    }

    /// Request a host-level refresh. The host must complete `done` once the
    /// refresh has been applied.
    async fn request_refresh(&self, done: RefreshSignal) -> Result<()> {
        done.complete();
        Ok(())
    }

    /// Subscribe to host-level notifications, if the host emits any
    fn subscribe_events(&self) -> Option<broadcast::Receiver<i32>> {
        None
    }
}
