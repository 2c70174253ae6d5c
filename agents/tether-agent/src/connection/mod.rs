//! Connection module
//!
//! This module handles all communication with the supervisor,
//! including the outbound link, message protocol and WebSocket transport.

pub mod link;
pub mod protocol;
pub mod websocket;
