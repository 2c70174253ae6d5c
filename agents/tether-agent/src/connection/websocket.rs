//! WebSocket Client
//!
//! Connects the agent to the supervisor, dispatches inbound requests to the
//! controller and drains the link outbox. Reconnects until the link is closed.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::agent::controller::{AgentController, EXIT_ABORTED, EXIT_CLOSED};
use crate::agent::error::AgentError;
use crate::agent::report::BatchReport;
use crate::connection::link::{ControlLink, LinkArtifactSource, LinkHandle};
use crate::connection::protocol::{
    AbortPayload, AgentMessage, CloseRequestPayload, ControlPlaneMessage, InstallFromUrlPayload,
    InstallPayload, ReconcilePayload, UnitIdsPayload, UnitsPayload, UpdateFromUrlPayload,
    UpdatePayload,
};
use crate::runtime::adapter::RuntimeHost;

/// WebSocket client for supervisor communication
pub struct WebSocketClient {
    url: String,
    api_key: Option<String>,
    reconnect_interval_ms: u64,
    heartbeat_interval_secs: u64,
    agent_id: String,
    controller: Arc<AgentController>,
    host: Arc<dyn RuntimeHost>,
    link: LinkHandle,
    artifacts: Arc<LinkArtifactSource>,
}

impl WebSocketClient {
    /// Run the client with auto-reconnect until the link is closed
    pub async fn run(&self, mut outbox: mpsc::Receiver<AgentMessage>) -> Result<()> {
        loop {
            match self.connect_and_run(&mut outbox).await {
                Ok(()) => info!("WebSocket connection closed gracefully"),
                Err(e) => error!(error = %e, "WebSocket connection error"),
            }

            if self.link.is_closed() {
                break;
            }

            self.link.state().set_reconnecting();
            info!(
                interval_ms = self.reconnect_interval_ms,
                "Waiting before reconnection attempt"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.reconnect_interval_ms)) => {}
                _ = self.link.closed() => break,
            }
        }

        info!("Control link closed");
        Ok(())
    }

    async fn connect_and_run(&self, outbox: &mut mpsc::Receiver<AgentMessage>) -> Result<()> {
        self.link.state().set_connecting();
        info!(url = %self.url, "Connecting to supervisor");

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("Invalid supervisor URL")?;
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .context("Invalid API key")?;
            request.headers_mut().insert("Authorization", value);
        }

        let connect_timeout = Duration::from_secs(30);
        let ws_stream = timeout(connect_timeout, connect_async(request))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to WebSocket")?
            .0;

        info!("WebSocket connection established");
        self.link.state().set_connected();

        let (mut write, mut read) = ws_stream.split();

        let register_msg = AgentMessage::register(
            &self.agent_id,
            self.controller.name(),
            self.host.runtime_type(),
        );
        write.send(Message::Text(register_msg.to_json()?)).await?;
        debug!("Registration message sent");

        let mut heartbeat_interval = interval(Duration::from_secs(self.heartbeat_interval_secs));
        let mut uptime_secs: u64 = 0;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_message(&text) {
                                warn!(error = %e, "Failed to handle message");
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "Received close frame");
                            self.link.state().set_disconnected("Supervisor closed connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            self.link.state().set_disconnected(&format!("WebSocket error: {}", e));
                            return Err(e.into());
                        }
                        None => {
                            self.link.state().set_disconnected("Stream ended");
                            break;
                        }
                    }
                }

                outgoing = outbox.recv() => {
                    if let Some(msg) = outgoing {
                        write.send(Message::Text(msg.to_json()?)).await?;
                    }
                }

                _ = heartbeat_interval.tick() => {
                    uptime_secs += self.heartbeat_interval_secs;
                    let unit_count = self
                        .host
                        .list()
                        .await
                        .map(|units| units.len() as u32)
                        .unwrap_or(0);
                    let heartbeat = AgentMessage::heartbeat(&self.agent_id, uptime_secs, unit_count);
                    write.send(Message::Text(heartbeat.to_json()?)).await?;
                }

                _ = self.link.closed() => {
                    // Flush what teardown queued, the exit event in particular
                    while let Ok(msg) = outbox.try_recv() {
                        write.send(Message::Text(msg.to_json()?)).await?;
                    }
                    write.send(Message::Close(None)).await?;
                    info!("Sent close frame to supervisor");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Spawn `op` and answer `request_id` with the batch report it produces
    fn spawn_batch<F>(&self, request_id: String, op: F)
    where
        F: Future<Output = Result<BatchReport, AgentError>> + Send + 'static,
    {
        let link = self.link.clone();
        tokio::spawn(async move {
            let reply = match op.await {
                Ok(report) => AgentMessage::reply(&request_id, report.into_option()),
                Err(e) => AgentMessage::reply_error(&request_id, e.to_string()),
            };
            if let Err(e) = link.push(reply) {
                warn!(request_id = %request_id, error = %e, "Failed to send reply");
            }
        });
    }

    /// Teardown answers `request_id` itself, before the link closes
    fn spawn_teardown(controller: Arc<AgentController>, request_id: String, code: i32) {
        tokio::spawn(async move {
            if let Err(e) = controller.teardown_request(&request_id, code).await {
                debug!(request_id = %request_id, error = %e, "Teardown reported failure");
            }
        });
    }

    /// Handle an incoming message from the supervisor
    fn handle_message(&self, text: &str) -> Result<()> {
        let message = ControlPlaneMessage::from_json(text)
            .context("Failed to parse supervisor message")?;
        let controller = self.controller.clone();

        match message {
            ControlPlaneMessage::Welcome(payload) => {
                info!(
                    agent_id = %payload.agent_id,
                    session_id = %payload.session_id,
                    "Received welcome from supervisor"
                );
            }
            ControlPlaneMessage::Ping(payload) => {
                if let Some(request_id) = payload.request_id {
                    let reply = if controller.ping() {
                        AgentMessage::reply(&request_id, None)
                    } else {
                        AgentMessage::reply_error(&request_id, AgentError::LinkClosed.to_string())
                    };
                    self.link
                        .push(reply)
                        .map_err(anyhow::Error::from)
                        .context("Failed to answer ping")?;
                }
            }

            ControlPlaneMessage::Reconcile(ReconcilePayload { request_id, units }) => {
                info!(
                    request_id = %request_id,
                    units = units.as_ref().map(|u| u.len()).unwrap_or(0),
                    "Received reconcile request"
                );
                self.spawn_batch(request_id, async move { controller.reconcile(units).await });
            }
            ControlPlaneMessage::Install(InstallPayload { request_id, units }) => {
                self.spawn_batch(request_id, async move { Ok(controller.install(units).await) });
            }
            ControlPlaneMessage::InstallFromUrl(InstallFromUrlPayload {
                request_id,
                location,
                url,
            }) => {
                self.spawn_batch(request_id, async move {
                    Ok(controller.install_from_url(&location, &url).await)
                });
            }
            ControlPlaneMessage::Update(UpdatePayload { request_id, units }) => {
                self.spawn_batch(request_id, async move { Ok(controller.update(units).await) });
            }
            ControlPlaneMessage::UpdateFromUrl(UpdateFromUrlPayload { request_id, id, url }) => {
                self.spawn_batch(request_id, async move {
                    Ok(controller.update_from_url(id, &url).await)
                });
            }
            ControlPlaneMessage::Uninstall(UnitIdsPayload { request_id, ids }) => {
                self.spawn_batch(request_id, async move { Ok(controller.uninstall(&ids).await) });
            }
            ControlPlaneMessage::Start(UnitIdsPayload { request_id, ids }) => {
                self.spawn_batch(request_id, async move { Ok(controller.start_units(&ids).await) });
            }
            ControlPlaneMessage::Stop(UnitIdsPayload { request_id, ids }) => {
                self.spawn_batch(request_id, async move { Ok(controller.stop_units(&ids).await) });
            }
            ControlPlaneMessage::ListUnits(payload) => {
                let link = self.link.clone();
                tokio::spawn(async move {
                    let message = match controller.list_units(&payload.ids).await {
                        Ok(units) => AgentMessage::Units(UnitsPayload {
                            request_id: payload.request_id,
                            units,
                        }),
                        Err(e) => AgentMessage::reply_error(&payload.request_id, format!("{:#}", e)),
                    };
                    if let Err(e) = link.push(message) {
                        warn!(error = %e, "Failed to send unit list");
                    }
                });
            }
            ControlPlaneMessage::Redirect(payload) => {
                let link = self.link.clone();
                tokio::spawn(async move {
                    let reply = match controller.redirect(payload.target).await {
                        Ok(switched) => {
                            debug!(redirect_target = %payload.target, switched, "Redirect handled");
                            AgentMessage::reply(&payload.request_id, None)
                        }
                        Err(e) => AgentMessage::reply_error(&payload.request_id, format!("{:#}", e)),
                    };
                    if let Err(e) = link.push(reply) {
                        warn!(error = %e, "Failed to send redirect reply");
                    }
                });
            }
            ControlPlaneMessage::Close(CloseRequestPayload { request_id }) => {
                info!(request_id = %request_id, "Received close request");
                Self::spawn_teardown(controller, request_id, EXIT_CLOSED);
            }
            ControlPlaneMessage::Abort(AbortPayload { request_id, code }) => {
                let code = code.unwrap_or(EXIT_ABORTED);
                info!(request_id = %request_id, code, "Received abort request");
                Self::spawn_teardown(controller, request_id, code);
            }
            ControlPlaneMessage::Artifact(payload) => match payload.decode() {
                Ok(content) => {
                    self.artifacts.resolve(&payload.request_id, content);
                }
                Err(e) => {
                    warn!(
                        request_id = %payload.request_id,
                        error = %e,
                        "Undecodable artifact answer, treating as missing"
                    );
                    self.artifacts.resolve(&payload.request_id, None);
                }
            },
            ControlPlaneMessage::Error(payload) => {
                error!(
                    code = %payload.code,
                    message = %payload.message,
                    "Received error from supervisor"
                );
            }
        }

        Ok(())
    }
}

/// Builder for WebSocketClient
pub struct WebSocketClientBuilder {
    url: String,
    agent_id: String,
    api_key: Option<String>,
    reconnect_interval_ms: u64,
    heartbeat_interval_secs: u64,
    controller: Arc<AgentController>,
    host: Arc<dyn RuntimeHost>,
    link: LinkHandle,
    artifacts: Arc<LinkArtifactSource>,
}

impl WebSocketClientBuilder {
    pub fn new(
        url: &str,
        agent_id: &str,
        controller: Arc<AgentController>,
        host: Arc<dyn RuntimeHost>,
        link: LinkHandle,
        artifacts: Arc<LinkArtifactSource>,
    ) -> Self {
        Self {
            url: url.to_string(),
            agent_id: agent_id.to_string(),
            api_key: None,
            reconnect_interval_ms: 5000,
            heartbeat_interval_secs: 30,
            controller,
            host,
            link,
            artifacts,
        }
    }

    pub fn api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn reconnect_interval_ms(mut self, ms: u64) -> Self {
        self.reconnect_interval_ms = ms;
        self
    }

    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    pub fn build(self) -> WebSocketClient {
        WebSocketClient {
            url: self.url,
            api_key: self.api_key,
            reconnect_interval_ms: self.reconnect_interval_ms,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            agent_id: self.agent_id,
            controller: self.controller,
            host: self.host,
            link: self.link,
            artifacts: self.artifacts,
        }
    }
}
