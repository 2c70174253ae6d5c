//! Control Link Handle
//!
//! Outbound side of the supervisor link. Messages are queued on a bounded
//! channel drained by the WebSocket client; pushing never blocks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::error::AgentError;
use crate::agent::state::LinkStateManager;
use crate::cache::source::ArtifactSource;
use crate::connection::protocol::{AgentMessage, FetchArtifactPayload};

/// Outbound half of the control link
pub trait ControlLink: Send + Sync {
    /// Queue a message for the supervisor without blocking
    fn push(&self, message: AgentMessage) -> Result<(), AgentError>;

    /// Close the link. It does not reconnect afterwards.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Channel-backed control link shared by the agent and the WebSocket client
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<AgentMessage>,
    state: LinkStateManager,
    shutdown: Arc<Notify>,
}

impl LinkHandle {
    /// Create a handle and the outbox the WebSocket client drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AgentMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                state: LinkStateManager::new(),
                shutdown: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    pub fn state(&self) -> &LinkStateManager {
        &self.state
    }

    /// Resolves once [`ControlLink::close`] has been called
    pub async fn closed(&self) {
        if self.state.is_closed() {
            return;
        }
        self.shutdown.notified().await;
    }
}

impl ControlLink for LinkHandle {
    fn push(&self, message: AgentMessage) -> Result<(), AgentError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Link outbox is full, dropping message");
                AgentError::LinkSaturated
            }
            mpsc::error::TrySendError::Closed(_) => AgentError::LinkClosed,
        })
    }

    fn close(&self) {
        if self.state.set_closed() {
            self.shutdown.notify_one();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

/// Artifact source that asks the supervisor for content over the link
pub struct LinkArtifactSource {
    link: Arc<dyn ControlLink>,
    pending: DashMap<String, oneshot::Sender<Option<Bytes>>>,
    timeout: Duration,
}

impl LinkArtifactSource {
    pub fn new(link: Arc<dyn ControlLink>, timeout: Duration) -> Self {
        Self {
            link,
            pending: DashMap::new(),
            timeout,
        }
    }

    /// Deliver the supervisor's answer for `request_id`. Returns false if no
    /// fetch is waiting for it.
    pub fn resolve(&self, request_id: &str, content: Option<Bytes>) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => tx.send(content).is_ok(),
            None => {
                debug!(request_id = %request_id, "No pending fetch for artifact answer");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ArtifactSource for LinkArtifactSource {
    fn is_fast(&self) -> bool {
        false
    }

    async fn fetch(&self, hash: &str) -> Result<Option<Bytes>> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let request = AgentMessage::FetchArtifact(FetchArtifactPayload {
            request_id: request_id.clone(),
            hash: hash.to_string(),
        });
        if let Err(e) = self.link.push(request) {
            self.pending.remove(&request_id);
            return Err(e).context("Failed to request artifact from supervisor");
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                self.pending.remove(&request_id);
                anyhow::bail!("Supervisor did not answer artifact request within {:?}", self.timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_fails_when_outbox_full() {
        let (link, _outbox) = LinkHandle::channel(1);
        link.push(AgentMessage::output("a")).unwrap();
        assert!(matches!(
            link.push(AgentMessage::output("b")),
            Err(AgentError::LinkSaturated)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let (link, _outbox) = LinkHandle::channel(4);
        let waiter = {
            let link = link.clone();
            tokio::spawn(async move { link.closed().await })
        };

        link.close();
        waiter.await.unwrap();
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn test_artifact_fetch_is_answered_over_link() {
        let (link, mut outbox) = LinkHandle::channel(4);
        let source = Arc::new(LinkArtifactSource::new(
            Arc::new(link),
            Duration::from_secs(1),
        ));

        let fetch = {
            let source = source.clone();
            tokio::spawn(async move { source.fetch("abc").await })
        };

        let request_id = match outbox.recv().await.unwrap() {
            AgentMessage::FetchArtifact(payload) => {
                assert_eq!(payload.hash, "abc");
                payload.request_id
            }
            other => panic!("Expected FetchArtifact, got {:?}", other),
        };

        assert!(source.resolve(&request_id, Some(Bytes::from_static(b"content"))));
        let content = fetch.await.unwrap().unwrap();
        assert_eq!(content, Some(Bytes::from_static(b"content")));
        assert_eq!(source.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_fetch_times_out() {
        let (link, _outbox) = LinkHandle::channel(4);
        let source = LinkArtifactSource::new(Arc::new(link), Duration::from_millis(20));

        assert!(source.fetch("abc").await.is_err());
        assert_eq!(source.pending_count(), 0);
    }
}
