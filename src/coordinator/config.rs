//! Coordinator Configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for one coordinator instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Stable id for this process. Generated at startup when absent.
    pub instance_id: Option<String>,
    /// Bound on one worker invocation during dispatch (ms)
    pub invocation_timeout_ms: u64,
    /// Per-capability overrides of `invocation_timeout_ms`
    pub capability_timeout_ms: HashMap<String, u64>,
    /// Bound on one `report_feedback` call (ms)
    pub feedback_timeout_ms: u64,
    /// Run a stale-agent sweep after every heartbeat tick
    pub cleanup_on_heartbeat: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            invocation_timeout_ms: 10_000,
            capability_timeout_ms: HashMap::new(),
            feedback_timeout_ms: 2_000,
            cleanup_on_heartbeat: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn invocation_timeout(&self, capability: &str) -> Duration {
        let ms = self
            .capability_timeout_ms
            .get(capability)
            .copied()
            .unwrap_or(self.invocation_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_millis(self.feedback_timeout_ms)
    }

    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self
            .instance_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            errors.push("coordinator.instance_id must not be blank".to_string());
        }
        if self.invocation_timeout_ms == 0 {
            errors.push("coordinator.invocation_timeout_ms must be positive".to_string());
        }
        for (capability, ms) in &self.capability_timeout_ms {
            if *ms == 0 {
                errors.push(format!(
                    "coordinator.capability_timeout_ms.{capability} must be positive"
                ));
            }
        }
        if self.feedback_timeout_ms == 0 {
            errors.push("coordinator.feedback_timeout_ms must be positive".to_string());
        }
        errors
    }
}
