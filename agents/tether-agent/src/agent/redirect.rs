//! Output Redirection
//!
//! Keeps at most one active output target. Switching targets closes the
//! previous one before the new one is installed; `RedirectTarget::None`
//! detaches capture entirely.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::link::ControlLink;
use crate::connection::protocol::AgentMessage;

/// Requested output target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RedirectTarget {
    /// Output capture detached
    None,
    /// Output pushed to the supervisor over the control link
    Console,
    /// Output written to a local TCP listener
    Socket { port: u16 },
}

impl std::fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedirectTarget::None => write!(f, "none"),
            RedirectTarget::Console => write!(f, "console"),
            RedirectTarget::Socket { port } => write!(f, "socket:{}", port),
        }
    }
}

enum Redirector {
    Null,
    Console,
    Socket { port: u16, stream: TcpStream },
}

impl Redirector {
    fn target(&self) -> RedirectTarget {
        match self {
            Redirector::Null => RedirectTarget::None,
            Redirector::Console => RedirectTarget::Console,
            Redirector::Socket { port, .. } => RedirectTarget::Socket { port: *port },
        }
    }

    async fn close(self) {
        if let Redirector::Socket { port, mut stream } = self {
            if let Err(e) = stream.shutdown().await {
                debug!(port, error = %e, "Socket redirector already closed");
            }
        }
    }
}

/// Single active output redirector
pub struct OutputRedirector {
    active: Mutex<Redirector>,
    link: Arc<dyn ControlLink>,
}

impl OutputRedirector {
    pub fn new(link: Arc<dyn ControlLink>) -> Self {
        Self {
            active: Mutex::new(Redirector::Null),
            link,
        }
    }

    /// The currently active target
    pub async fn current(&self) -> RedirectTarget {
        self.active.lock().await.target()
    }

    /// Switch to `target`. Returns false when it is already active.
    ///
    /// If the new target cannot be attached the previous one stays closed and
    /// output capture is left detached.
    pub async fn redirect(&self, target: RedirectTarget) -> Result<bool> {
        let mut active = self.active.lock().await;
        if active.target() == target {
            return Ok(false);
        }

        let previous = std::mem::replace(&mut *active, Redirector::Null);
        let previous_target = previous.target();
        previous.close().await;

        *active = match target {
            RedirectTarget::None => Redirector::Null,
            RedirectTarget::Console => Redirector::Console,
            RedirectTarget::Socket { port } => {
                let stream = TcpStream::connect(("127.0.0.1", port))
                    .await
                    .with_context(|| format!("Failed to attach output to port {}", port))?;
                Redirector::Socket { port, stream }
            }
        };

        info!(from = %previous_target, to = %target, "Output redirected");
        Ok(true)
    }

    /// Write text to the active target. Failures detach a broken socket.
    pub async fn write(&self, text: &str) {
        let mut active = self.active.lock().await;
        match &mut *active {
            Redirector::Null => {}
            Redirector::Console => {
                if let Err(e) = self.link.push(AgentMessage::output(text)) {
                    debug!(error = %e, "Dropped console output");
                }
            }
            Redirector::Socket { port, stream } => {
                let port = *port;
                let mut line = text.to_string();
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                if let Err(e) = stream.write_all(line.as_bytes()).await {
                    warn!(port, error = %e, "Socket redirector failed, detaching");
                    *active = Redirector::Null;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::link::LinkHandle;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn redirector() -> (OutputRedirector, tokio::sync::mpsc::Receiver<AgentMessage>) {
        let (link, outbox) = LinkHandle::channel(16);
        (OutputRedirector::new(Arc::new(link)), outbox)
    }

    #[tokio::test]
    async fn test_same_target_is_noop() {
        let (redirector, _outbox) = redirector();
        assert!(!redirector.redirect(RedirectTarget::None).await.unwrap());
        assert!(redirector.redirect(RedirectTarget::Console).await.unwrap());
        assert!(!redirector.redirect(RedirectTarget::Console).await.unwrap());
    }

    #[tokio::test]
    async fn test_console_output_goes_over_link() {
        let (redirector, mut outbox) = redirector();
        redirector.write("dropped").await;
        redirector.redirect(RedirectTarget::Console).await.unwrap();
        redirector.write("hello").await;

        match outbox.try_recv().unwrap() {
            AgentMessage::Output(payload) => assert_eq!(payload.text, "hello"),
            other => panic!("Expected Output, got {:?}", other),
        }
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_socket_target_receives_lines_and_is_closed_on_switch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (redirector, _outbox) = redirector();

        redirector
            .redirect(RedirectTarget::Socket { port })
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        redirector.write("line one").await;
        redirector.redirect(RedirectTarget::None).await.unwrap();

        let mut received = String::new();
        peer.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "line one\n");
        assert_eq!(redirector.current().await, RedirectTarget::None);
    }

    #[tokio::test]
    async fn test_failed_attach_leaves_output_detached() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (redirector, _outbox) = redirector();
        redirector.redirect(RedirectTarget::Console).await.unwrap();
        assert!(redirector
            .redirect(RedirectTarget::Socket { port })
            .await
            .is_err());
        assert_eq!(redirector.current().await, RedirectTarget::None);
    }
}
