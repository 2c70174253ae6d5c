//! Agent Registry
//!
//! Explicit name -> controller registry owned by the process entry point.
//! Controllers register when started and deregister during teardown.

use std::sync::Arc;

use dashmap::DashMap;

use crate::agent::controller::AgentController;

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<DashMap<String, Arc<AgentController>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `controller` under its name, replacing any previous entry
    pub fn register(&self, controller: Arc<AgentController>) -> Option<Arc<AgentController>> {
        let name = controller.name().to_string();
        tracing::debug!(agent = %name, "Registering agent");
        self.agents.insert(name, controller)
    }

    pub fn deregister(&self, name: &str) -> Option<Arc<AgentController>> {
        tracing::debug!(agent = %name, "Deregistering agent");
        self.agents.remove(name).map(|(_, controller)| controller)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentController>> {
        self.agents.get(name).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
