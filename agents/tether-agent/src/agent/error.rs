//! Agent Errors
//!
//! Typed failures raised by the reconciliation core. Per-unit failures are
//! rendered into a [`BatchReport`](crate::agent::report::BatchReport) instead
//! of being returned; only the variants that abort a whole call surface as `Err`.

use std::time::Duration;

use thiserror::Error;

use crate::runtime::adapter::UnitId;

/// Lifecycle operation names used in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleOp {
    Install,
    Update,
    Uninstall,
    Start,
    Stop,
}

impl std::fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleOp::Install => write!(f, "install"),
            LifecycleOp::Update => write!(f, "update"),
            LifecycleOp::Uninstall => write!(f, "uninstall"),
            LifecycleOp::Start => write!(f, "start"),
            LifecycleOp::Stop => write!(f, "stop"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    /// Content hash could not be resolved through the cache or any source
    #[error("Could not find content with hash {hash} for {location}")]
    FetchMiss { hash: String, location: String },

    /// The runtime host rejected a lifecycle transition
    #[error("Trying to {op} {target}: {message}")]
    Lifecycle {
        op: LifecycleOp,
        target: String,
        message: String,
    },

    /// An outstanding refresh did not complete within the configured budget
    #[error("Refresh did not complete within {0:?}")]
    RefreshTimeout(Duration),

    #[error("No unit with id {0}")]
    UnknownUnit(UnitId),

    /// Teardown failed; the agent is closed regardless
    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("Control link is closed")]
    LinkClosed,

    #[error("Control link outbox is full")]
    LinkSaturated,
}

impl AgentError {
    /// Wrap a host-side error for the given operation and target
    pub fn lifecycle(op: LifecycleOp, target: impl ToString, err: &anyhow::Error) -> Self {
        AgentError::Lifecycle {
            op,
            target: target.to_string(),
            message: format!("{:#}", err),
        }
    }
}
