//! Reconciliation
//!
//! Computes the difference between the supervisor's desired state and the
//! tracked state, then drives the runtime host through five phases:
//! quiesce, remove, install, update and restart. Every per-unit failure is
//! recorded in the batch report and the run continues with the next unit.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::agent::error::{AgentError, LifecycleOp};
use crate::agent::report::BatchReport;
use crate::cache::store::ContentCache;
use crate::runtime::adapter::{RuntimeHost, Unit, UnitId, UnitState};

/// location -> content hash requested by the supervisor, in its order
pub type DesiredState = IndexMap<String, String>;

/// location -> content hash of what the agent has installed
pub type TrackedState = IndexMap<String, String>;

/// Units to restart in the final phase, with their locations for diagnostics
type RestartSet = IndexMap<UnitId, String>;

/// The transitions needed to move tracked state to desired state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Tracked locations absent from the desired state
    pub to_delete: Vec<String>,
    /// Desired locations not yet tracked, in desired order
    pub to_install: Vec<String>,
    /// Tracked locations whose desired hash is new
    pub changed: IndexMap<String, String>,
}

impl ReconcilePlan {
    /// Compute the plan.
    ///
    /// A unit counts as changed when its desired hash does not occur anywhere
    /// among the tracked hashes. A tracked unit whose hash differs from its
    /// desired hash but matches the hash of some other tracked unit is
    /// therefore treated as unchanged; that case is logged.
    pub fn compute(desired: &DesiredState, tracked: &TrackedState) -> Self {
        let to_delete = tracked
            .keys()
            .filter(|location| !desired.contains_key(*location))
            .cloned()
            .collect();

        let to_install = desired
            .keys()
            .filter(|location| !tracked.contains_key(*location))
            .cloned()
            .collect();

        let tracked_hashes: HashSet<&str> = tracked.values().map(String::as_str).collect();
        let mut changed = IndexMap::new();
        for (location, hash) in desired {
            let Some(current) = tracked.get(location) else {
                continue;
            };
            if !tracked_hashes.contains(hash.as_str()) {
                changed.insert(location.clone(), hash.clone());
            } else if current != hash {
                warn!(
                    location = %location,
                    tracked = %current,
                    desired = %hash,
                    "Desired hash matches another tracked unit, treating as unchanged"
                );
            }
        }

        Self {
            to_delete,
            to_install,
            changed,
        }
    }

    /// Locations that must be stopped before anything else happens
    pub fn affected(&self) -> Vec<String> {
        self.to_delete
            .iter()
            .chain(self.changed.keys())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_install.is_empty() && self.changed.is_empty()
    }
}

/// Drives the runtime host from tracked state to desired state
pub struct Reconciler {
    host: Arc<dyn RuntimeHost>,
    cache: Arc<ContentCache>,
}

impl Reconciler {
    pub fn new(host: Arc<dyn RuntimeHost>, cache: Arc<ContentCache>) -> Self {
        Self { host, cache }
    }

    /// Apply `desired` to the host, updating `tracked` as transitions succeed.
    ///
    /// Callers must have waited on any outstanding refresh before calling.
    pub async fn reconcile(&self, desired: &DesiredState, tracked: &mut TrackedState) -> BatchReport {
        let plan = ReconcilePlan::compute(desired, tracked);
        info!(
            to_delete = plan.to_delete.len(),
            to_install = plan.to_install.len(),
            changed = plan.changed.len(),
            "Reconciling units"
        );

        let mut report = BatchReport::new();
        if plan.is_empty() {
            return report;
        }

        let mut restart = RestartSet::new();
        self.quiesce(&plan, &mut restart, &mut report).await;
        self.remove(&plan, tracked, &mut restart, &mut report).await;
        self.install(&plan, desired, tracked, &mut restart, &mut report).await;
        self.update(&plan, tracked, &mut restart, &mut report).await;
        self.restart(&restart, &mut report).await;

        info!(failures = report.len(), "Reconcile finished");
        report
    }

    async fn lookup(&self, location: &str, purpose: &str, report: &mut BatchReport) -> Option<Unit> {
        match self.host.get(location).await {
            Ok(Some(unit)) => Some(unit),
            Ok(None) => {
                report.push(format!("Could not locate unit {} to {}", location, purpose));
                None
            }
            Err(e) => {
                report.push(format!("Could not locate unit {} to {}: {:#}", location, purpose, e));
                None
            }
        }
    }

    /// Stop every deleted or changed unit, remembering which ones were running
    async fn quiesce(&self, plan: &ReconcilePlan, restart: &mut RestartSet, report: &mut BatchReport) {
        for location in plan.affected() {
            let Some(unit) = self.lookup(&location, "stop it", report).await else {
                continue;
            };

            if unit.state.is_active() {
                restart.insert(unit.id, location.clone());
            }

            debug!(location = %location, unit_id = %unit.id, "Stopping unit");
            if let Err(e) = self.host.stop(unit.id).await {
                report.record(AgentError::lifecycle(LifecycleOp::Stop, &location, &e));
            }
        }
    }

    async fn remove(
        &self,
        plan: &ReconcilePlan,
        tracked: &mut TrackedState,
        restart: &mut RestartSet,
        report: &mut BatchReport,
    ) {
        for location in &plan.to_delete {
            let Some(unit) = self.lookup(location, "uninstall it", report).await else {
                continue;
            };

            match self.host.uninstall(unit.id).await {
                Ok(()) => {
                    info!(location = %location, unit_id = %unit.id, "Unit uninstalled");
                    tracked.shift_remove(location);
                    restart.shift_remove(&unit.id);
                }
                Err(e) => report.record(AgentError::lifecycle(LifecycleOp::Uninstall, location, &e)),
            }
        }
    }

    async fn install(
        &self,
        plan: &ReconcilePlan,
        desired: &DesiredState,
        tracked: &mut TrackedState,
        restart: &mut RestartSet,
        report: &mut BatchReport,
    ) {
        for location in &plan.to_install {
            let Some(hash) = desired.get(location) else {
                continue;
            };
            let Some(content) = self.fetch(location, hash, report).await else {
                continue;
            };

            match self.host.install(location, content).await {
                Ok(unit) => {
                    info!(location = %location, unit_id = %unit.id, hash = %hash, "Unit installed");
                    tracked.insert(location.clone(), hash.clone());
                    restart.insert(unit.id, location.clone());
                }
                Err(e) => report.record(AgentError::lifecycle(LifecycleOp::Install, location, &e)),
            }
        }
    }

    async fn update(
        &self,
        plan: &ReconcilePlan,
        tracked: &mut TrackedState,
        restart: &mut RestartSet,
        report: &mut BatchReport,
    ) {
        for (location, hash) in &plan.changed {
            let Some(content) = self.fetch(location, hash, report).await else {
                continue;
            };
            let Some(unit) = self.lookup(location, "update it", report).await else {
                continue;
            };

            let result = if unit.state == UnitState::Uninstalled {
                // Gone during quiesce, put it back under the same location
                self.host.install(location, content).await.map(|installed| {
                    if restart.shift_remove(&unit.id).is_some() {
                        restart.insert(installed.id, location.clone());
                    }
                })
            } else {
                self.host.update(unit.id, content).await
            };

            match result {
                Ok(()) => {
                    info!(location = %location, hash = %hash, "Unit updated");
                    tracked.insert(location.clone(), hash.clone());
                }
                Err(e) => report.record(AgentError::lifecycle(LifecycleOp::Update, location, &e)),
            }
        }
    }

    async fn restart(&self, restart: &RestartSet, report: &mut BatchReport) {
        for (id, location) in restart {
            debug!(location = %location, unit_id = %id, "Starting unit");
            if let Err(e) = self.host.start(*id).await {
                report.record(AgentError::lifecycle(LifecycleOp::Start, location, &e));
            }
        }
    }

    pub(crate) async fn fetch(
        &self,
        location: &str,
        hash: &str,
        report: &mut BatchReport,
    ) -> Option<bytes::Bytes> {
        match self.cache.fetch(hash).await {
            Ok(Some(content)) => Some(content),
            Ok(None) => {
                report.record(AgentError::FetchMiss {
                    hash: hash.to_string(),
                    location: location.to_string(),
                });
                None
            }
            Err(e) => {
                report.push(format!("Trying to fetch {} for {}: {:#}", hash, location, e));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(entries: &[(&str, &str)]) -> IndexMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plan_scenario_delete_and_install() {
        let tracked = state(&[("b", "h2"), ("c", "h3")]);
        let desired = state(&[("a", "h1"), ("b", "h2")]);

        let plan = ReconcilePlan::compute(&desired, &tracked);
        assert_eq!(plan.to_delete, vec!["c"]);
        assert_eq!(plan.to_install, vec!["a"]);
        assert!(plan.changed.is_empty());
        assert_eq!(plan.affected(), vec!["c"]);
    }

    #[test]
    fn test_plan_scenario_changed_hash() {
        let tracked = state(&[("a", "h1")]);
        let desired = state(&[("a", "h2")]);

        let plan = ReconcilePlan::compute(&desired, &tracked);
        assert!(plan.to_delete.is_empty());
        assert!(plan.to_install.is_empty());
        assert_eq!(plan.changed, state(&[("a", "h2")]));
    }

    #[test]
    fn test_plan_install_order_follows_desired() {
        let desired = state(&[("z", "h1"), ("a", "h2"), ("m", "h3")]);
        let plan = ReconcilePlan::compute(&desired, &TrackedState::new());
        assert_eq!(plan.to_install, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_plan_hash_swap_is_treated_as_unchanged() {
        // Value-based change detection: both hashes already occur in tracked
        let tracked = state(&[("a", "h1"), ("b", "h2")]);
        let desired = state(&[("a", "h2"), ("b", "h1")]);

        let plan = ReconcilePlan::compute(&desired, &tracked);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_partitions_all_keys() {
        let cases = [
            (
                state(&[("a", "h1"), ("b", "h2"), ("c", "h3")]),
                state(&[("b", "h2"), ("c", "h9"), ("d", "h4")]),
            ),
            (state(&[]), state(&[("x", "h1")])),
            (state(&[("x", "h1")]), state(&[])),
            (state(&[("a", "h1"), ("b", "h1")]), state(&[("a", "h2"), ("c", "h1")])),
        ];

        for (tracked, desired) in cases {
            let plan = ReconcilePlan::compute(&desired, &tracked);
            let unchanged: Vec<&String> = desired
                .keys()
                .filter(|k| tracked.contains_key(*k) && !plan.changed.contains_key(*k))
                .collect();

            let mut seen = HashSet::new();
            for key in plan
                .to_delete
                .iter()
                .chain(plan.to_install.iter())
                .chain(plan.changed.keys())
                .chain(unchanged.into_iter())
            {
                assert!(seen.insert(key.clone()), "{} classified twice", key);
            }

            let all: HashSet<String> = desired.keys().chain(tracked.keys()).cloned().collect();
            assert_eq!(seen, all);
        }
    }
}
