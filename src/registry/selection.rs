//! Agent selection among healthy candidates

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::record::AgentRecord;

/// How `get_agent` picks one record when several are healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// First healthy record in stable order (oldest registration first)
    #[default]
    FirstHealthy,
    /// Rotate through healthy records, one cursor per capability per process
    RoundRobin,
    /// Uniformly random healthy record
    Random,
}

impl std::fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionPolicy::FirstHealthy => write!(f, "first_healthy"),
            SelectionPolicy::RoundRobin => write!(f, "round_robin"),
            SelectionPolicy::Random => write!(f, "random"),
        }
    }
}

/// Applies a `SelectionPolicy`, holding round-robin cursors
#[derive(Debug, Default)]
pub struct Selector {
    cursors: DashMap<String, AtomicUsize>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick one of `candidates`, which must already be healthy and in stable order
    pub fn pick(
        &self,
        capability: &str,
        policy: SelectionPolicy,
        mut candidates: Vec<AgentRecord>,
    ) -> Option<AgentRecord> {
        if candidates.is_empty() {
            return None;
        }
        let idx = match policy {
            SelectionPolicy::FirstHealthy => 0,
            SelectionPolicy::RoundRobin => {
                let cursor = self
                    .cursors
                    .entry(capability.to_string())
                    .or_insert_with(|| AtomicUsize::new(0));
                cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            SelectionPolicy::Random => rand::thread_rng().gen_range(0..candidates.len()),
        };
        Some(candidates.swap_remove(idx))
    }
}
