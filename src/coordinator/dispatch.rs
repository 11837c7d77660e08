//! Dispatch request/outcome types and fan-out statistics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::combine::CombinedResult;
use crate::error::WorkerError;
use crate::worker::WorkerResult;

/// One logical request fanned out to several capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    #[serde(default = "new_request_id")]
    pub request_id: String,
    pub capabilities: Vec<String>,
    /// Passed unchanged to every worker
    #[serde(default)]
    pub params: serde_json::Value,
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl DispatchRequest {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request_id: new_request_id(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Why a capability was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableKind {
    /// Local worker reported not healthy
    Unhealthy,
    /// No local worker and no healthy agent in the registry
    NoHealthyAgent,
}

/// Why an attempted capability produced no result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Error,
    Panicked,
}

/// Per-capability result of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CapabilityOutcome {
    Succeeded {
        /// Registry id of the local agent, if it is registered
        agent_id: Option<String>,
        result: WorkerResult,
    },
    Unavailable {
        kind: UnavailableKind,
        reason: String,
    },
    /// Hosted only by another instance; counted as available, not invoked
    Remote {
        agent_id: String,
        instance_id: String,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl CapabilityOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CapabilityOutcome::Succeeded { .. })
    }

    pub fn result(&self) -> Option<&WorkerResult> {
        match self {
            CapabilityOutcome::Succeeded { result, .. } => Some(result),
            _ => None,
        }
    }

    pub(crate) fn from_worker_error(err: &WorkerError) -> Self {
        let kind = match err {
            WorkerError::Timeout { .. } => FailureKind::Timeout,
            WorkerError::Panicked(_) => FailureKind::Panicked,
            WorkerError::Unhealthy(reason) => {
                return CapabilityOutcome::Unavailable {
                    kind: UnavailableKind::Unhealthy,
                    reason: reason.clone(),
                }
            }
            WorkerError::Failed(_) | WorkerError::Other(_) => FailureKind::Error,
        };
        CapabilityOutcome::Failed {
            kind,
            message: err.to_string(),
        }
    }
}

/// Combined result plus the raw per-capability outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub request_id: String,
    pub combined: CombinedResult,
    pub outcomes: BTreeMap<String, CapabilityOutcome>,
}

impl DispatchOutcome {
    /// Capabilities that did not contribute, with their outcome
    pub fn failures(&self) -> impl Iterator<Item = (&String, &CapabilityOutcome)> {
        self.outcomes.iter().filter(|(_, o)| !o.is_success())
    }

    pub fn is_partial(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// Fan-out counters for one coordinator
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub unavailable: u64,
    pub remote: u64,
    pub nothing_to_combine: u64,
}

impl DispatchStats {
    pub(crate) fn record(&mut self, outcome: &CapabilityOutcome) {
        match outcome {
            CapabilityOutcome::Succeeded { .. } => self.succeeded += 1,
            CapabilityOutcome::Unavailable { .. } => self.unavailable += 1,
            CapabilityOutcome::Remote { .. } => self.remote += 1,
            CapabilityOutcome::Failed { kind, .. } => {
                self.failed += 1;
                if *kind == FailureKind::Timeout {
                    self.timed_out += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ConfidenceTier;

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: DispatchRequest =
            serde_json::from_str(r#"{"capabilities": ["nba", "nfl"]}"#).unwrap();
        assert_eq!(req.capabilities, vec!["nba", "nfl"]);
        assert!(!req.request_id.is_empty());
        assert!(req.params.is_null());
    }

    #[test]
    fn test_worker_error_mapping() {
        let timeout = CapabilityOutcome::from_worker_error(&WorkerError::Timeout { elapsed_ms: 5 });
        assert!(matches!(
            timeout,
            CapabilityOutcome::Failed {
                kind: FailureKind::Timeout,
                ..
            }
        ));

        let unhealthy = CapabilityOutcome::from_worker_error(&WorkerError::Unhealthy("down".into()));
        assert!(matches!(
            unhealthy,
            CapabilityOutcome::Unavailable {
                kind: UnavailableKind::Unhealthy,
                ..
            }
        ));

        let other = CapabilityOutcome::from_worker_error(&WorkerError::Other(anyhow::anyhow!("boom")));
        assert!(matches!(
            other,
            CapabilityOutcome::Failed {
                kind: FailureKind::Error,
                ..
            }
        ));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = CapabilityOutcome::Succeeded {
            agent_id: None,
            result: WorkerResult::new(ConfidenceTier::Low, "x"),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "succeeded");
    }

    #[test]
    fn test_stats_count_timeouts_as_failures() {
        let mut stats = DispatchStats::default();
        stats.record(&CapabilityOutcome::Failed {
            kind: FailureKind::Timeout,
            message: "slow".into(),
        });
        stats.record(&CapabilityOutcome::Remote {
            agent_id: "a".into(),
            instance_id: "i2".into(),
        });
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.remote, 1);
    }
}
