//! Tether Agent Library
//!
//! This crate provides the core functionality for the Tether management
//! agent: desired-state reconciliation of deployable units, batch lifecycle
//! operations, output redirection and the supervisor control link.

pub mod agent;
pub mod cache;
pub mod cli;
pub mod connection;
pub mod runtime;

// Re-exports for convenience
pub use agent::controller::{AgentController, EXIT_ABORTED, EXIT_CLOSED};
pub use agent::error::AgentError;
pub use agent::reconcile::{DesiredState, Reconciler, TrackedState};
pub use agent::registry::AgentRegistry;
pub use agent::report::BatchReport;
pub use cache::{ArtifactSource, ContentCache};
pub use cli::config::Config;
pub use connection::link::{ControlLink, LinkHandle};
pub use connection::protocol::{AgentMessage, ControlPlaneMessage};
pub use connection::websocket::{WebSocketClient, WebSocketClientBuilder};
pub use runtime::adapter::{RuntimeHost, Unit, UnitId, UnitState};
pub use runtime::docker::DockerHost;
pub use runtime::memory::InMemoryHost;
