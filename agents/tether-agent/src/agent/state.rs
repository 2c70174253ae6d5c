//! Link State Management
//!
//! Tracks the state of the control link to the supervisor. `Closed` is
//! terminal: once the agent has been torn down the link never reconnects.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Torn down, never leaves this state
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Reconnecting => write!(f, "Reconnecting"),
            LinkState::Closed => write!(f, "Closed"),
        }
    }
}

struct LinkStateInner {
    current: LinkState,
    last_connected: Option<DateTime<Utc>>,
    connection_attempts: u32,
    closed_at: Option<DateTime<Utc>>,
}

/// Thread-safe link state manager
#[derive(Clone)]
pub struct LinkStateManager {
    inner: Arc<RwLock<LinkStateInner>>,
}

impl LinkStateManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(LinkStateInner {
                current: LinkState::Disconnected,
                last_connected: None,
                connection_attempts: 0,
                closed_at: None,
            })),
        }
    }

    pub fn current_state(&self) -> LinkState {
        self.inner.read().current
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_connected
    }

    pub fn connection_attempts(&self) -> u32 {
        self.inner.read().connection_attempts
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().closed_at
    }

    /// Transition to a new state, returning false if the transition is refused
    pub fn transition_to(&self, new_state: LinkState, reason: Option<&str>) -> bool {
        let mut inner = self.inner.write();
        let old_state = inner.current;

        if old_state == LinkState::Closed {
            return new_state == LinkState::Closed;
        }
        if old_state == new_state {
            return true;
        }

        inner.current = new_state;
        match new_state {
            LinkState::Connected => {
                inner.last_connected = Some(Utc::now());
                inner.connection_attempts = 0;
            }
            LinkState::Connecting => {
                inner.connection_attempts += 1;
            }
            LinkState::Closed => {
                inner.closed_at = Some(Utc::now());
            }
            LinkState::Disconnected | LinkState::Reconnecting => {}
        }

        tracing::info!(
            from = %old_state,
            to = %new_state,
            attempts = inner.connection_attempts,
            reason = reason.unwrap_or(""),
            "Link state transition"
        );

        true
    }

    pub fn set_connecting(&self) -> bool {
        self.transition_to(LinkState::Connecting, Some("Initiating connection"))
    }

    pub fn set_connected(&self) -> bool {
        self.transition_to(LinkState::Connected, Some("Connection established"))
    }

    pub fn set_disconnected(&self, reason: &str) -> bool {
        self.transition_to(LinkState::Disconnected, Some(reason))
    }

    pub fn set_reconnecting(&self) -> bool {
        self.transition_to(LinkState::Reconnecting, Some("Connection lost, reconnecting"))
    }

    pub fn set_closed(&self) -> bool {
        self.transition_to(LinkState::Closed, Some("Agent closed"))
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == LinkState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.current_state() == LinkState::Closed
    }
}

impl Default for LinkStateManager {
    fn default() -> Self {
        Self::new()
    }
}
