//! Docker Runtime Module
//!
//! Runs each unit as a labelled container.

pub mod adapter;

pub use adapter::{DockerHost, UnitDescriptor};
