//! In-memory runtime host.
//!
//! Keeps units in process memory. Every lifecycle call is recorded, and
//! individual operations can be made to fail for a given location, which
//! makes this host the backing runtime for dry runs and tests.

use std::collections::HashSet;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::agent::error::LifecycleOp;
use crate::agent::refresh::RefreshSignal;
use crate::runtime::adapter::{RuntimeHost, Unit, UnitId, UnitState};

/// How the host answers refresh requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// No refresh capability
    Unsupported,
    /// Refresh completes before `request_refresh` returns
    Immediate,
    /// Refresh completes only when [`InMemoryHost::complete_refreshes`] is called
    Manual,
}

/// A recorded host call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Install(String),
    Update(String),
    Uninstall(String),
    Start(String),
    Stop(String),
    Refresh,
}

struct StoredUnit {
    unit: Unit,
    content: Bytes,
}

#[derive(Default)]
struct MemoryHostInner {
    units: IndexMap<UnitId, StoredUnit>,
    next_id: u64,
    calls: Vec<HostCall>,
    faults: HashSet<(LifecycleOp, String)>,
    discard_on_stop: HashSet<String>,
    pending_refreshes: Vec<RefreshSignal>,
}

impl MemoryHostInner {
    fn find(&self, location: &str) -> Option<&StoredUnit> {
        self.units.values().find(|u| u.unit.location == location)
    }

    fn stored_mut(&mut self, id: UnitId) -> Result<&mut StoredUnit> {
        self.units
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unit {} does not exist", id))
    }

    fn check_fault(&self, op: LifecycleOp, location: &str) -> Result<()> {
        if self.faults.contains(&(op, location.to_string())) {
            bail!("{} rejected for {}", op, location);
        }
        Ok(())
    }
}

/// In-process runtime host
pub struct InMemoryHost {
    inner: Mutex<MemoryHostInner>,
    refresh_mode: RefreshMode,
    events: broadcast::Sender<i32>,
}

impl InMemoryHost {
    /// Create a host without refresh capability
    pub fn new() -> Self {
        Self::with_refresh(RefreshMode::Unsupported)
    }

    pub fn with_refresh(refresh_mode: RefreshMode) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(MemoryHostInner {
                next_id: 1,
                ..Default::default()
            }),
            refresh_mode,
            events,
        }
    }

    /// Make `op` fail for the unit at `location`
    pub fn fail_on(&self, op: LifecycleOp, location: &str) {
        self.inner.lock().faults.insert((op, location.to_string()));
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    /// Make a stop of the unit at `location` leave it `Uninstalled`, as hosts
    /// that discard units on stop do
    pub fn discard_on_stop(&self, location: &str) {
        self.inner.lock().discard_on_stop.insert(location.to_string());
    }

    /// All calls recorded so far, in issue order
    pub fn calls(&self) -> Vec<HostCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// Number of refresh requests received
    pub fn refresh_count(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| **c == HostCall::Refresh)
            .count()
    }

    /// Complete every outstanding refresh, returning how many were pending
    pub fn complete_refreshes(&self) -> usize {
        let pending: Vec<RefreshSignal> = {
            let mut inner = self.inner.lock();
            Self::resolve_installed(&mut inner);
            inner.pending_refreshes.drain(..).collect()
        };
        let count = pending.len();
        for signal in pending {
            signal.complete();
        }
        count
    }

    /// Content currently held by the unit at `location`
    pub fn content_of(&self, location: &str) -> Option<Bytes> {
        self.inner.lock().find(location).map(|u| u.content.clone())
    }

    /// Force the state of the unit at `location`
    pub fn set_state(&self, location: &str, state: UnitState) {
        let mut inner = self.inner.lock();
        if let Some(stored) = inner
            .units
            .values_mut()
            .find(|u| u.unit.location == location)
        {
            stored.unit.state = state;
        }
    }

    /// Emit a host notification to subscribers
    pub fn emit(&self, code: i32) {
        // No subscribers is fine
        let _ = self.events.send(code);
    }

    fn resolve_installed(inner: &mut MemoryHostInner) {
        for stored in inner.units.values_mut() {
            if stored.unit.state == UnitState::Installed {
                stored.unit.state = UnitState::Resolved;
            }
        }
    }

    fn location_of(inner: &MemoryHostInner, id: UnitId) -> String {
        inner
            .units
            .get(&id)
            .map(|u| u.unit.location.clone())
            .unwrap_or_else(|| format!("#{}", id))
    }
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeHost for InMemoryHost {
    fn runtime_type(&self) -> &str {
        "memory"
    }

    async fn install(&self, location: &str, content: Bytes) -> Result<Unit> {
        let mut inner = self.inner.lock();
        inner.calls.push(HostCall::Install(location.to_string()));
        inner.check_fault(LifecycleOp::Install, location)?;

        let existing = inner.find(location).map(|u| (u.unit.id, u.unit.state));
        match existing {
            Some((_, state)) if state != UnitState::Uninstalled => {
                bail!("location {} is already installed", location);
            }
            Some((stale, _)) => {
                inner.units.shift_remove(&stale);
            }
            None => {}
        }

        let id = UnitId(inner.next_id);
        inner.next_id += 1;
        let unit = Unit {
            id,
            location: location.to_string(),
            state: UnitState::Installed,
        };
        inner.units.insert(
            id,
            StoredUnit {
                unit: unit.clone(),
                content,
            },
        );
        debug!(location = %location, unit_id = %id, "Unit installed in memory");
        Ok(unit)
    }

    async fn update(&self, id: UnitId, content: Bytes) -> Result<()> {
        let mut inner = self.inner.lock();
        let location = Self::location_of(&inner, id);
        inner.calls.push(HostCall::Update(location.clone()));
        inner.check_fault(LifecycleOp::Update, &location)?;

        let stored = inner.stored_mut(id)?;
        stored.content = content;
        if stored.unit.state == UnitState::Resolved {
            stored.unit.state = UnitState::Installed;
        }
        Ok(())
    }

    async fn start(&self, id: UnitId) -> Result<()> {
        let mut inner = self.inner.lock();
        let location = Self::location_of(&inner, id);
        inner.calls.push(HostCall::Start(location.clone()));
        inner.check_fault(LifecycleOp::Start, &location)?;

        let stored = inner.stored_mut(id)?;
        if stored.unit.state == UnitState::Uninstalled {
            bail!("unit {} is uninstalled", location);
        }
        stored.unit.state = UnitState::Active;
        Ok(())
    }

    async fn stop(&self, id: UnitId) -> Result<()> {
        let mut inner = self.inner.lock();
        let location = Self::location_of(&inner, id);
        inner.calls.push(HostCall::Stop(location.clone()));
        inner.check_fault(LifecycleOp::Stop, &location)?;

        let discard = inner.discard_on_stop.contains(&location);
        let stored = inner.stored_mut(id)?;
        if discard {
            stored.unit.state = UnitState::Uninstalled;
        } else if stored.unit.state.is_active() {
            stored.unit.state = UnitState::Resolved;
        }
        Ok(())
    }

    async fn uninstall(&self, id: UnitId) -> Result<()> {
        let mut inner = self.inner.lock();
        let location = Self::location_of(&inner, id);
        inner.calls.push(HostCall::Uninstall(location.clone()));
        inner.check_fault(LifecycleOp::Uninstall, &location)?;

        inner
            .units
            .shift_remove(&id)
            .ok_or_else(|| anyhow!("unit {} does not exist", id))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Unit>> {
        Ok(self
            .inner
            .lock()
            .units
            .values()
            .map(|u| u.unit.clone())
            .collect())
    }

    async fn get(&self, location: &str) -> Result<Option<Unit>> {
        Ok(self.inner.lock().find(location).map(|u| u.unit.clone()))
    }

    async fn get_by_id(&self, id: UnitId) -> Result<Option<Unit>> {
        Ok(self.inner.lock().units.get(&id).map(|u| u.unit.clone()))
    }

    fn supports_refresh(&self) -> bool {
        self.refresh_mode != RefreshMode::Unsupported
    }

    async fn request_refresh(&self, done: RefreshSignal) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(HostCall::Refresh);
        match self.refresh_mode {
            RefreshMode::Unsupported => bail!("refresh is not supported by this host"),
            RefreshMode::Immediate => {
                Self::resolve_installed(&mut inner);
                done.complete();
            }
            RefreshMode::Manual => inner.pending_refreshes.push(done),
        }
        Ok(())
    }

    fn subscribe_events(&self) -> Option<broadcast::Receiver<i32>> {
        Some(self.events.subscribe())
    }
}
