//! Agent Registry Configuration

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::record::HealthThresholds;
use super::selection::SelectionPolicy;

const MAX_STALE_THRESHOLD_SECS: u64 = 365 * 86_400;

/// Configuration for the agent registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Key prefix shared by every instance that should see each other
    pub namespace: String,
    /// Expected heartbeat period (s). Agents silent for twice this are unhealthy.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age (s) after which an agent is presumed dead
    pub stale_threshold_secs: u64,
    /// Selection policy for capabilities without an override
    pub default_selection: SelectionPolicy,
    /// Per-capability selection overrides
    pub selection: HashMap<String, SelectionPolicy>,
    /// Keys requested per cleanup scan page
    pub scan_batch: usize,
    /// Seconds to wait before probing a store that was found unavailable.
    /// Defaults to the heartbeat interval; `None` means one connection
    /// attempt per process lifetime.
    pub reconnect_cooldown_secs: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: "bullpen".to_string(),
            heartbeat_interval_secs: 30,
            stale_threshold_secs: 120,
            default_selection: SelectionPolicy::FirstHealthy,
            selection: HashMap::new(),
            scan_batch: 100,
            reconnect_cooldown_secs: Some(30),
        }
    }
}

impl RegistryConfig {
    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            heartbeat_interval: secs(self.heartbeat_interval_secs),
            stale_threshold: secs(self.stale_threshold_secs),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_cooldown(&self) -> Option<ChronoDuration> {
        self.reconnect_cooldown_secs.map(secs)
    }

    pub fn policy_for(&self, capability: &str) -> SelectionPolicy {
        self.selection
            .get(capability)
            .copied()
            .unwrap_or(self.default_selection)
    }

    /// Constraint violations, empty when valid
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.namespace.trim().is_empty() {
            errors.push("registry.namespace must not be empty".to_string());
        }
        if self.heartbeat_interval_secs == 0 {
            errors.push("registry.heartbeat_interval_secs must be positive".to_string());
        }
        if self.stale_threshold_secs <= self.heartbeat_interval_secs.saturating_mul(2) {
            errors.push(format!(
                "registry.stale_threshold_secs ({}) must exceed twice heartbeat_interval_secs ({})",
                self.stale_threshold_secs, self.heartbeat_interval_secs
            ));
        }
        if self.stale_threshold_secs > MAX_STALE_THRESHOLD_SECS {
            errors.push(format!(
                "registry.stale_threshold_secs must be at most {MAX_STALE_THRESHOLD_SECS}"
            ));
        }
        if self.scan_batch == 0 {
            errors.push("registry.scan_batch must be positive".to_string());
        }
        errors
    }
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1_000))
}
