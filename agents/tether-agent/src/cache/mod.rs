//! Artifact cache module
//!
//! Content-addressed storage for unit artifacts and the sources it falls
//! back to on a miss.

pub mod source;
pub mod store;

pub use source::{ArtifactSource, HttpSource, MemorySource};
pub use store::{content_hash, ContentCache};
