//! Agent module
//!
//! Reconciliation, batch lifecycle operations, refresh coordination, output
//! redirection and the controller that ties them together.

pub mod controller;
pub mod error;
pub mod reconcile;
pub mod redirect;
pub mod refresh;
pub mod registry;
pub mod report;
pub mod state;
