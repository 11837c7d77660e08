//! CapabilityWorker trait: the contract every capability implementation meets
//!
//! The coordinator selects a worker from its capability map and only ever
//! talks to it through these methods.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::types::{FeedbackOutcome, WorkerHealth, WorkerResult};
use crate::error::WorkerError;

#[async_trait]
pub trait CapabilityWorker: Send + Sync + 'static {
    /// Produce a result for one request.
    ///
    /// The coordinator enforces its own timeout, but implementations should
    /// still bound their internal waits.
    async fn produce_result(
        &self,
        params: &serde_json::Value,
    ) -> std::result::Result<WorkerResult, WorkerError>;

    /// Best-effort learning hook. Errors are logged by the caller, never surfaced.
    async fn report_feedback(
        &self,
        result_id: &str,
        outcome: FeedbackOutcome,
    ) -> std::result::Result<(), WorkerError>;

    /// Cheap status check, called before every invocation
    fn health(&self) -> WorkerHealth;

    /// Opaque attributes published with the agent record (version, model, ...)
    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}
