//! Agent Controller
//!
//! Top-level agent object. Owns the tracked state and exposes every
//! operation the supervisor can invoke: reconcile, the direct batch lifecycle
//! operations, output redirection and teardown. All operations that change
//! units run one at a time under the tracked-state lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::error::{AgentError, LifecycleOp};
use crate::agent::reconcile::{DesiredState, Reconciler, TrackedState};
use crate::agent::redirect::{OutputRedirector, RedirectTarget};
use crate::agent::refresh::RefreshCoordinator;
use crate::agent::registry::AgentRegistry;
use crate::agent::report::BatchReport;
use crate::cache::store::ContentCache;
use crate::connection::link::ControlLink;
use crate::connection::protocol::{AgentMessage, Event, InstallUnit, UpdateUnit};
use crate::runtime::adapter::{RuntimeHost, Unit, UnitId};

/// Exit code pushed when the agent is closed normally
pub const EXIT_CLOSED: i32 = -2;

/// Exit code pushed when the agent is aborted without an explicit code
pub const EXIT_ABORTED: i32 = -3;

const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AgentController {
    name: String,
    host: Arc<dyn RuntimeHost>,
    reconciler: Reconciler,
    refresh: RefreshCoordinator,
    redirector: OutputRedirector,
    link: Arc<dyn ControlLink>,
    tracked: Mutex<TrackedState>,
    closed: AtomicBool,
    registry: Option<AgentRegistry>,
    http: reqwest::Client,
}

impl AgentController {
    pub fn new(
        name: &str,
        host: Arc<dyn RuntimeHost>,
        cache: Arc<ContentCache>,
        link: Arc<dyn ControlLink>,
    ) -> Self {
        Self {
            name: name.to_string(),
            reconciler: Reconciler::new(host.clone(), cache),
            refresh: RefreshCoordinator::new(host.clone(), DEFAULT_REFRESH_TIMEOUT),
            redirector: OutputRedirector::new(link.clone()),
            host,
            link,
            tracked: Mutex::new(TrackedState::new()),
            closed: AtomicBool::new(false),
            registry: None,
            http: reqwest::Client::new(),
        }
    }

    /// Bound every wait on an outstanding refresh
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh = RefreshCoordinator::new(self.host.clone(), timeout);
        self
    }

    /// Register in `registry` when started, deregister on teardown
    pub fn with_registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share the controller and register it
    pub fn start(self) -> Arc<Self> {
        let controller = Arc::new(self);
        if let Some(registry) = &controller.registry {
            registry.register(controller.clone());
        }
        info!(agent = %controller.name, runtime = %controller.host.runtime_type(), "Agent started");
        controller
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True while the agent has not been torn down
    pub fn ping(&self) -> bool {
        !self.is_closed()
    }

    /// Snapshot of the tracked state
    pub async fn tracked(&self) -> TrackedState {
        self.tracked.lock().await.clone()
    }

    /// Bring the host in line with `desired`; `None` removes everything.
    ///
    /// Waits for any outstanding refresh first. An all-success run triggers
    /// an asynchronous refresh; a run with failures never does.
    pub async fn reconcile(&self, desired: Option<DesiredState>) -> Result<BatchReport, AgentError> {
        let mut tracked = self.tracked.lock().await;
        self.refresh.await_current().await?;

        let desired = desired.unwrap_or_default();
        let report = self.reconciler.reconcile(&desired, &mut tracked).await;

        if report.is_empty() {
            if let Err(e) = self.refresh.refresh(true).await {
                warn!(error = %e, "Post-reconcile refresh was not issued");
            }
        }
        Ok(self.finish_batch(report).await)
    }

    /// Request a host refresh, optionally waiting for it to complete
    pub async fn refresh(&self, async_mode: bool) -> Result<(), AgentError> {
        self.refresh.refresh(async_mode).await
    }

    /// Install each `(location, hash)` pair independently
    pub async fn install(&self, units: Vec<InstallUnit>) -> BatchReport {
        let mut tracked = self.tracked.lock().await;
        let mut report = BatchReport::new();

        for InstallUnit { location, hash } in units {
            let Some(content) = self.reconciler.fetch(&location, &hash, &mut report).await else {
                continue;
            };
            match self.host.install(&location, content).await {
                Ok(unit) => {
                    info!(location = %location, unit_id = %unit.id, "Unit installed");
                    tracked.insert(location, hash);
                }
                Err(e) => report.record(AgentError::lifecycle(LifecycleOp::Install, &location, &e)),
            }
        }

        self.finish_batch(report).await
    }

    /// Download `url` and install it at `location`
    pub async fn install_from_url(&self, location: &str, url: &str) -> BatchReport {
        let mut tracked = self.tracked.lock().await;
        let mut report = BatchReport::new();

        match self.download(url).await {
            Ok(content) => match self.host.install(location, content).await {
                Ok(unit) => {
                    info!(location = %location, unit_id = %unit.id, url = %url, "Unit installed from URL");
                    tracked.insert(location.to_string(), url.to_string());
                }
                Err(e) => report.record(AgentError::lifecycle(LifecycleOp::Install, location, &e)),
            },
            Err(e) => report.push(format!("Trying to download {} for {}: {:#}", url, location, e)),
        }

        self.finish_batch(report).await
    }

    /// Update each unit to the content for its hash
    pub async fn update(&self, units: Vec<UpdateUnit>) -> BatchReport {
        let mut tracked = self.tracked.lock().await;
        let mut report = BatchReport::new();
        let mut updated = 0usize;

        for UpdateUnit { id, hash } in units {
            let Some(unit) = self.unit_by_id(id, &mut report).await else {
                continue;
            };
            let Some(content) = self.reconciler.fetch(&unit.location, &hash, &mut report).await else {
                continue;
            };
            if self.apply_update(unit, content, hash, &mut tracked, &mut report).await {
                updated += 1;
            }
        }

        self.finish_update(report, updated).await
    }

    /// Download `url` and update the unit `id` with it
    pub async fn update_from_url(&self, id: UnitId, url: &str) -> BatchReport {
        let mut tracked = self.tracked.lock().await;
        let mut report = BatchReport::new();
        let mut updated = 0usize;

        if let Some(unit) = self.unit_by_id(id, &mut report).await {
            match self.download(url).await {
                Ok(content) => {
                    if self
                        .apply_update(unit, content, url.to_string(), &mut tracked, &mut report)
                        .await
                    {
                        updated += 1;
                    }
                }
                Err(e) => report.push(format!(
                    "Trying to download {} for {}: {:#}",
                    url, unit.location, e
                )),
            }
        }

        self.finish_update(report, updated).await
    }

    /// Replace the content of `unit`, tracking it under `hash` on success
    async fn apply_update(
        &self,
        unit: Unit,
        content: bytes::Bytes,
        hash: String,
        tracked: &mut TrackedState,
        report: &mut BatchReport,
    ) -> bool {
        match self.host.update(unit.id, content).await {
            Ok(()) => {
                info!(location = %unit.location, unit_id = %unit.id, hash = %hash, "Unit updated");
                tracked.insert(unit.location, hash);
                true
            }
            Err(e) => {
                report.record(AgentError::lifecycle(LifecycleOp::Update, &unit, &e));
                false
            }
        }
    }

    /// Refresh after an update batch that fully succeeded
    async fn finish_update(&self, report: BatchReport, updated: usize) -> BatchReport {
        if report.is_empty() && updated > 0 {
            if let Err(e) = self.refresh.refresh(true).await {
                warn!(error = %e, "Post-update refresh was not issued");
            }
        }
        self.finish_batch(report).await
    }

    pub async fn uninstall(&self, ids: &[UnitId]) -> BatchReport {
        let mut tracked = self.tracked.lock().await;
        let mut report = BatchReport::new();

        for id in ids {
            let Some(unit) = self.unit_by_id(*id, &mut report).await else {
                continue;
            };
            match self.host.uninstall(unit.id).await {
                Ok(()) => {
                    info!(location = %unit.location, unit_id = %unit.id, "Unit uninstalled");
                    tracked.shift_remove(&unit.location);
                }
                Err(e) => report.record(AgentError::lifecycle(LifecycleOp::Uninstall, &unit, &e)),
            }
        }

        self.finish_batch(report).await
    }

    pub async fn start_units(&self, ids: &[UnitId]) -> BatchReport {
        self.transition(ids, LifecycleOp::Start).await
    }

    pub async fn stop_units(&self, ids: &[UnitId]) -> BatchReport {
        self.transition(ids, LifecycleOp::Stop).await
    }

    async fn transition(&self, ids: &[UnitId], op: LifecycleOp) -> BatchReport {
        let _tracked = self.tracked.lock().await;
        let mut report = BatchReport::new();

        for id in ids {
            let Some(unit) = self.unit_by_id(*id, &mut report).await else {
                continue;
            };
            let result = match op {
                LifecycleOp::Stop => self.host.stop(unit.id).await,
                _ => self.host.start(unit.id).await,
            };
            if let Err(e) = result {
                report.record(AgentError::lifecycle(op, &unit, &e));
            }
        }

        self.finish_batch(report).await
    }

    /// Describe the given units, or all units when `ids` is empty
    pub async fn list_units(&self, ids: &[UnitId]) -> Result<Vec<Unit>> {
        if ids.is_empty() {
            return self.host.list().await;
        }

        let mut units = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(unit) = self.host.get_by_id(*id).await? {
                units.push(unit);
            }
        }
        Ok(units)
    }

    /// Switch output redirection. Returns false if `target` is already active.
    pub async fn redirect(&self, target: RedirectTarget) -> Result<bool> {
        self.redirector.redirect(target).await
    }

    /// Push an event to the supervisor. Delivery failures are only logged.
    pub fn push_event(&self, event: Event) {
        if let Err(e) = self.link.push(AgentMessage::event(event)) {
            warn!(kind = ?event.kind, code = event.code, error = %e, "Failed to push event");
        }
    }

    /// Translate a host notification into a host event
    pub fn on_host_event(&self, code: i32) {
        debug!(code, "Host event");
        self.push_event(Event::host(code));
    }

    /// Forward host notifications until the agent is closed
    pub fn forward_host_events(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut events = self.host.subscribe_events()?;
        let controller: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(code) => {
                        let Some(controller) = controller.upgrade() else {
                            break;
                        };
                        if controller.is_closed() {
                            break;
                        }
                        controller.on_host_event(code);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Host events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Host event forwarding stopped");
        }))
    }

    /// Tear the agent down with the regular exit code
    pub async fn close(&self) -> Result<(), AgentError> {
        self.teardown(EXIT_CLOSED, None).await
    }

    /// Tear the agent down with `code`
    pub async fn abort(&self, code: i32) -> Result<(), AgentError> {
        self.teardown(code, None).await
    }

    /// Tear down on behalf of supervisor request `request_id`. The reply is
    /// queued after the exit event and before the link closes, so it is
    /// flushed with it.
    pub async fn teardown_request(&self, request_id: &str, code: i32) -> Result<(), AgentError> {
        self.teardown(code, Some(request_id)).await
    }

    /// One-shot teardown: remove every unit, detach output, push the exit
    /// event and close the link. Later calls are no-ops. The agent counts as
    /// closed even when a step fails.
    async fn teardown(&self, code: i32, request_id: Option<&str>) -> Result<(), AgentError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(agent = %self.name, "Agent already closed");
            if let Some(request_id) = request_id {
                self.reply(AgentMessage::reply(request_id, None));
            }
            return Ok(());
        }

        info!(agent = %self.name, code, "Tearing down agent");
        if let Some(registry) = &self.registry {
            registry.deregister(&self.name);
        }

        let mut failure: Option<String> = None;
        match self.reconcile(None).await {
            Ok(report) if !report.is_empty() => {
                warn!(failures = report.len(), "Units left behind during teardown");
            }
            Ok(_) => {}
            Err(e) => failure = Some(e.to_string()),
        }

        if let Err(e) = self.redirector.redirect(RedirectTarget::None).await {
            failure.get_or_insert_with(|| format!("{:#}", e));
        }

        self.push_event(Event::exit(code));

        let result = match failure {
            Some(message) => {
                error!(agent = %self.name, error = %message, "Teardown failed");
                Err(AgentError::Teardown(message))
            }
            None => Ok(()),
        };

        if let Some(request_id) = request_id {
            self.reply(match &result {
                Ok(()) => AgentMessage::reply(request_id, None),
                Err(e) => AgentMessage::reply_error(request_id, e.to_string()),
            });
        }
        self.link.close();

        result
    }

    fn reply(&self, message: AgentMessage) {
        if let Err(e) = self.link.push(message) {
            warn!(error = %e, "Failed to send teardown reply");
        }
    }

    async fn unit_by_id(&self, id: UnitId, report: &mut BatchReport) -> Option<Unit> {
        match self.host.get_by_id(id).await {
            Ok(Some(unit)) => Some(unit),
            Ok(None) => {
                report.record(AgentError::UnknownUnit(id));
                None
            }
            Err(e) => {
                report.push(format!("Could not look up unit {}: {:#}", id, e));
                None
            }
        }
    }

    async fn download(&self, url: &str) -> Result<bytes::Bytes> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()
            .with_context(|| format!("Server rejected {}", url))?;
        response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {}", url))
    }

    /// Mirror a failed batch to the active output target
    async fn finish_batch(&self, report: BatchReport) -> BatchReport {
        if !report.is_empty() {
            self.redirector.write(&report.to_string()).await;
        }
        report
    }
}
