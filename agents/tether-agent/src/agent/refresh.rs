//! Refresh Coordination
//!
//! Serializes host-level refreshes against reconciliation. At most one
//! [`RefreshToken`] is outstanding; a reconcile run waits on the current
//! token before it computes its plan, so a refresh triggered by run N is
//! fully applied before run N+1 looks at the unit set.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::error::AgentError;
use crate::runtime::adapter::RuntimeHost;

/// Completion callback handed to the runtime host with a refresh request
#[derive(Debug)]
pub struct RefreshSignal {
    tx: watch::Sender<bool>,
}

impl RefreshSignal {
    /// Signal that the refresh has been applied
    pub fn complete(self) {
        let _ = self.tx.send(true);
    }
}

/// Completion token for an in-flight refresh. Not cancellable.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    rx: watch::Receiver<bool>,
}

impl RefreshToken {
    /// A token that has already been signaled
    pub fn completed() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    /// Arm a new token together with the signal that completes it
    pub fn arm() -> (RefreshSignal, RefreshToken) {
        let (tx, rx) = watch::channel(false);
        (RefreshSignal { tx }, RefreshToken { rx })
    }

    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the token is signaled.
    ///
    /// A signal dropped by the host without completing counts as completion,
    /// otherwise every later reconcile would wait forever.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|done| *done).await.is_err() {
            warn!("Refresh signal dropped without completion");
        }
    }
}

/// Serializes refresh requests issued to a runtime host
pub struct RefreshCoordinator {
    host: Arc<dyn RuntimeHost>,
    current: Mutex<RefreshToken>,
    timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(host: Arc<dyn RuntimeHost>, timeout: Duration) -> Self {
        Self {
            host,
            current: Mutex::new(RefreshToken::completed()),
            timeout,
        }
    }

    /// The most recently armed token
    pub fn current(&self) -> RefreshToken {
        self.current.lock().clone()
    }

    /// Wait for the outstanding refresh, bounded by the refresh budget
    pub async fn await_current(&self) -> Result<(), AgentError> {
        let token = self.current();
        if token.is_complete() {
            return Ok(());
        }

        debug!("Waiting for outstanding refresh");
        tokio::time::timeout(self.timeout, token.wait())
            .await
            .map_err(|_| AgentError::RefreshTimeout(self.timeout))
    }

    /// Request a host-level refresh.
    ///
    /// With `async_mode` the call returns as soon as the request is issued;
    /// otherwise it blocks until the host signals completion. No-op when the
    /// host has no refresh capability.
    pub async fn refresh(&self, async_mode: bool) -> Result<(), AgentError> {
        if !self.host.supports_refresh() {
            debug!(runtime = %self.host.runtime_type(), "Host has no refresh capability");
            return Ok(());
        }

        self.await_current().await?;

        let (signal, token) = RefreshToken::arm();
        *self.current.lock() = token.clone();

        info!(async_mode, "Requesting host refresh");
        if let Err(e) = self.host.request_refresh(signal).await {
            // The signal was consumed, so the token resolves as dropped
            warn!(error = %e, "Host refresh request failed");
            return Ok(());
        }

        if async_mode {
            return Ok(());
        }

        tokio::time::timeout(self.timeout, token.wait())
            .await
            .map_err(|_| AgentError::RefreshTimeout(self.timeout))
    }
}
