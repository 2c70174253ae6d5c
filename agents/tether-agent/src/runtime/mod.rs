//! Runtime module
//!
//! This module provides abstraction over the hosts that run deployable units
//! through a common RuntimeHost trait.

pub mod adapter;
pub mod docker;
pub mod memory;
