//! Coordinator-local state: workers this process owns and their registry ids
//!
//! Never shared across processes and lost on restart.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::worker::{CapabilityWorker, WorkerHealth};

/// Snapshot of one locally hosted capability
#[derive(Debug, Clone, Serialize)]
pub struct LocalAgentSnapshot {
    pub capability: String,
    /// `None` while running local-only (registration failed)
    pub agent_id: Option<String>,
    pub health: WorkerHealth,
}

#[derive(Default)]
pub(crate) struct LocalAgents {
    workers: HashMap<String, Arc<dyn CapabilityWorker>>,
    agent_ids: HashMap<String, String>,
}

impl LocalAgents {
    pub fn worker(&self, capability: &str) -> Option<Arc<dyn CapabilityWorker>> {
        self.workers.get(capability).cloned()
    }

    pub fn agent_id(&self, capability: &str) -> Option<&str> {
        self.agent_ids.get(capability).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &String> {
        self.workers.keys()
    }

    /// Install a worker and (optionally) its id, returning the id it replaces
    pub fn insert(
        &mut self,
        capability: &str,
        worker: Arc<dyn CapabilityWorker>,
        agent_id: Option<String>,
    ) -> Option<String> {
        self.workers.insert(capability.to_string(), worker);
        let previous = self.agent_ids.remove(capability);
        if let Some(id) = agent_id {
            self.agent_ids.insert(capability.to_string(), id);
        }
        previous
    }

    /// Drop a worker, returning whether it existed and its id
    pub fn remove(&mut self, capability: &str) -> (bool, Option<String>) {
        let existed = self.workers.remove(capability).is_some();
        (existed, self.agent_ids.remove(capability))
    }

    /// Swap in a fresh id, but only if `expected` is still the current one
    pub fn replace_id(&mut self, capability: &str, expected: Option<&str>, new_id: String) -> bool {
        if !self.workers.contains_key(capability)
            || self.agent_ids.get(capability).map(String::as_str) != expected
        {
            return false;
        }
        self.agent_ids.insert(capability.to_string(), new_id);
        true
    }

    /// Capabilities with a registry id, for heartbeating
    pub fn registered(&self) -> Vec<(String, String)> {
        self.agent_ids
            .iter()
            .map(|(cap, id)| (cap.clone(), id.clone()))
            .collect()
    }

    /// Capabilities still running local-only
    pub fn unregistered(&self) -> Vec<String> {
        self.workers
            .keys()
            .filter(|cap| !self.agent_ids.contains_key(*cap))
            .cloned()
            .collect()
    }

    pub fn snapshots(&self) -> Vec<LocalAgentSnapshot> {
        let mut snapshots: Vec<LocalAgentSnapshot> = self
            .workers
            .iter()
            .map(|(capability, worker)| LocalAgentSnapshot {
                capability: capability.clone(),
                agent_id: self.agent_ids.get(capability).cloned(),
                health: worker.health(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.capability.cmp(&b.capability));
        snapshots
    }
}
