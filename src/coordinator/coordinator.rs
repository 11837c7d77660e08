//! Coordinator: hosts local capability workers and fans requests out to them
//!
//! One `Coordinator` per process. It owns the capability → worker map, keeps
//! the matching registry records alive through the heartbeat task and answers
//! `dispatch` by invoking every requested capability concurrently:
//!   - local worker present → health check, then `produce_result` under a timeout
//!   - hosted elsewhere     → counted as `Remote`, never invoked
//!   - hosted nowhere       → `Unavailable`
//!
//! Per-capability failures never abort the request; only an empty set of
//! successes surfaces as `NothingToCombine`.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::combine::{combine, ConfidenceWeights};
use crate::error::{BullpenError, RegistryError, Result, WorkerError};
use crate::registry::registry::validate_capability;
use crate::registry::AgentRegistry;
use crate::worker::{CapabilityWorker, FeedbackOutcome, WorkerResult};

use super::config::CoordinatorConfig;
use super::dispatch::{
    CapabilityOutcome, DispatchOutcome, DispatchRequest, DispatchStats, FailureKind,
    UnavailableKind,
};
use super::heartbeat::{HeartbeatContext, HeartbeatHandle};
use super::state::{LocalAgentSnapshot, LocalAgents};

pub struct Coordinator {
    instance_id: String,
    config: CoordinatorConfig,
    weights: ConfidenceWeights,
    registry: Arc<AgentRegistry>,
    local: Arc<RwLock<LocalAgents>>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
    stats: Arc<RwLock<DispatchStats>>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        config: CoordinatorConfig,
        weights: ConfidenceWeights,
    ) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(generate_instance_id);
        info!(instance_id = %instance_id, "coordinator created");

        Self {
            instance_id,
            config,
            weights,
            registry,
            local: Arc::new(RwLock::new(LocalAgents::default())),
            heartbeat: Mutex::new(None),
            stats: Arc::new(RwLock::new(DispatchStats::default())),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ==================== Local Capabilities ====================

    /// Host `worker` for `capability` and publish it to the registry.
    ///
    /// Returns the new agent id, or `None` when the store is unreachable and
    /// the capability runs local-only until a heartbeat tick can register it.
    /// Re-registering a capability replaces the previous worker and retires
    /// its agent id.
    pub async fn register_capability(
        &self,
        capability: &str,
        worker: Arc<dyn CapabilityWorker>,
    ) -> Result<Option<String>> {
        validate_capability(capability)?;

        let metadata = worker_metadata(worker.as_ref()).unwrap_or_else(|e| {
            warn!(capability = %capability, error = %e, "worker metadata unavailable");
            BTreeMap::new()
        });
        let agent_id = match self
            .registry
            .register(capability, &self.instance_id, metadata)
            .await
        {
            Ok(id) => Some(id),
            Err(RegistryError::StoreUnavailable(reason)) => {
                warn!(
                    capability = %capability,
                    reason = %reason,
                    "registry unavailable; capability running local-only"
                );
                None
            }
            Err(e) => return Err(e.into()),
        };

        let previous = self
            .local
            .write()
            .await
            .insert(capability, worker, agent_id.clone());
        if let Some(previous) = previous {
            debug!(capability = %capability, agent_id = %previous, "retiring replaced agent");
            self.registry.unregister(&previous).await;
        }

        self.ensure_heartbeat().await;

        info!(
            capability = %capability,
            agent_id = agent_id.as_deref().unwrap_or("-"),
            "capability registered"
        );
        Ok(agent_id)
    }

    /// Stop hosting `capability`. Returns false if it was not hosted here.
    ///
    /// Stops the heartbeat task, and waits for it, once nothing local remains.
    pub async fn unregister_capability(&self, capability: &str) -> bool {
        let (existed, agent_id) = self.local.write().await.remove(capability);
        if let Some(agent_id) = &agent_id {
            let outcome = self.registry.unregister(agent_id).await;
            if !outcome.is_success() {
                warn!(
                    capability = %capability,
                    agent_id = %agent_id,
                    "could not remove agent record; it will expire"
                );
            }
        }

        let mut heartbeat = self.heartbeat.lock().await;
        if self.local.read().await.is_empty() {
            if let Some(handle) = heartbeat.take() {
                handle.stop().await;
            }
        }
        drop(heartbeat);

        if existed {
            info!(capability = %capability, "capability unregistered");
        }
        existed
    }

    /// Local capabilities plus every capability with a live agent elsewhere
    pub async fn list_available_capabilities(&self) -> BTreeSet<String> {
        let mut capabilities: BTreeSet<String> =
            self.local.read().await.capabilities().cloned().collect();
        capabilities.extend(self.registry.list_capabilities().await);
        capabilities
    }

    pub async fn local_agents(&self) -> Vec<LocalAgentSnapshot> {
        self.local.read().await.snapshots()
    }

    pub async fn is_heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .await
            .as_ref()
            .is_some_and(HeartbeatHandle::is_running)
    }

    async fn ensure_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.as_ref().is_some_and(HeartbeatHandle::is_running) {
            return;
        }
        if self.local.read().await.is_empty() {
            return;
        }
        *heartbeat = Some(HeartbeatHandle::spawn(HeartbeatContext {
            registry: self.registry.clone(),
            local: self.local.clone(),
            instance_id: self.instance_id.clone(),
            interval: self.registry.config().heartbeat_interval(),
            cleanup: self.config.cleanup_on_heartbeat,
        }));
    }

    // ==================== Dispatch ====================

    /// Fan `request` out to its capabilities and combine what succeeds
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let capabilities = validate_request(&request)?;
        let params = Arc::new(request.params);

        debug!(
            request_id = %request.request_id,
            capabilities = capabilities.len(),
            "dispatching"
        );

        // Placeholders survive only if a fan-out task dies before reporting
        let mut outcomes: BTreeMap<String, CapabilityOutcome> = capabilities
            .iter()
            .map(|cap| {
                (
                    cap.clone(),
                    CapabilityOutcome::Failed {
                        kind: FailureKind::Error,
                        message: "invocation did not complete".to_string(),
                    },
                )
            })
            .collect();

        let mut tasks = JoinSet::new();
        {
            let local = self.local.read().await;
            for capability in capabilities {
                let worker = local.worker(&capability);
                let agent_id = local.agent_id(&capability).map(str::to_string);
                let limit = self.config.invocation_timeout(&capability);
                let registry = self.registry.clone();
                let params = params.clone();

                tasks.spawn(async move {
                    let outcome = match worker {
                        Some(worker) => match invoke_worker(worker, params, limit).await {
                            Ok(result) => CapabilityOutcome::Succeeded { agent_id, result },
                            Err(e) => CapabilityOutcome::from_worker_error(&e),
                        },
                        None => remote_outcome(&registry, &capability).await,
                    };
                    (capability, outcome)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((capability, outcome)) => {
                    if !outcome.is_success() {
                        debug!(
                            request_id = %request.request_id,
                            capability = %capability,
                            outcome = ?outcome,
                            "capability did not contribute"
                        );
                    }
                    outcomes.insert(capability, outcome);
                }
                Err(e) => error!(request_id = %request.request_id, error = %e, "fan-out task failed"),
            }
        }

        let successes: BTreeMap<String, WorkerResult> = outcomes
            .iter()
            .filter_map(|(cap, o)| o.result().map(|r| (cap.clone(), r.clone())))
            .collect();
        let combined = combine(&successes, &self.weights);

        {
            let mut stats = self.stats.write().await;
            stats.requests += 1;
            for outcome in outcomes.values() {
                stats.record(outcome);
            }
            if combined.is_err() {
                stats.nothing_to_combine += 1;
            }
        }

        match combined {
            Ok(combined) => {
                info!(
                    request_id = %request.request_id,
                    contributors = combined.contributors.len(),
                    requested = outcomes.len(),
                    confidence = %combined.confidence,
                    "dispatch complete"
                );
                Ok(DispatchOutcome {
                    request_id: request.request_id,
                    combined,
                    outcomes,
                })
            }
            Err(_) => {
                warn!(request_id = %request.request_id, "no capability produced a result");
                Err(BullpenError::NothingToCombine { outcomes })
            }
        }
    }

    /// Forward feedback to the local worker for `capability`.
    ///
    /// Best-effort: returns whether the worker accepted it; failures are
    /// logged and never propagated.
    pub async fn report_feedback(
        &self,
        capability: &str,
        result_id: &str,
        outcome: FeedbackOutcome,
    ) -> bool {
        let Some(worker) = self.local.read().await.worker(capability) else {
            debug!(capability = %capability, "feedback for capability not hosted here");
            return false;
        };

        let limit = self.config.feedback_timeout();
        let result_id_owned = result_id.to_string();
        let err = match run_isolated(
            async move { worker.report_feedback(&result_id_owned, outcome).await },
            limit,
        )
        .await
        {
            Ok(()) => return true,
            Err(e) => e,
        };
        warn!(
            capability = %capability,
            result_id = %result_id,
            error = %err,
            "feedback delivery failed"
        );
        false
    }

    pub async fn stats(&self) -> DispatchStats {
        self.stats.read().await.clone()
    }

    // ==================== Shutdown ====================

    /// Unregister every local capability, remove any records this instance
    /// still owns and stop the heartbeat task
    pub async fn shutdown(&self) {
        let capabilities: Vec<String> =
            self.local.read().await.capabilities().cloned().collect();
        for capability in &capabilities {
            self.unregister_capability(capability).await;
        }

        for record in self.registry.get_instance_agents(&self.instance_id).await {
            debug!(agent_id = %record.agent_id, "removing leftover agent record");
            self.registry.unregister(&record.agent_id).await;
        }

        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.stop().await;
        }
        info!(
            instance_id = %self.instance_id,
            capabilities = capabilities.len(),
            "coordinator shut down"
        );
    }
}

fn generate_instance_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("coord-{}", &uuid[..12])
}

/// Deduplicated, validated capability list
fn validate_request(request: &DispatchRequest) -> Result<BTreeSet<String>> {
    if request.capabilities.is_empty() {
        return Err(BullpenError::InvalidRequest(
            "no capabilities requested".to_string(),
        ));
    }
    let mut capabilities = BTreeSet::new();
    for capability in &request.capabilities {
        validate_capability(capability)
            .map_err(|e| BullpenError::InvalidRequest(e.to_string()))?;
        capabilities.insert(capability.clone());
    }
    Ok(capabilities)
}

/// Health check then `produce_result`, isolated on its own task so a panic
/// or a hang stays contained
async fn invoke_worker(
    worker: Arc<dyn CapabilityWorker>,
    params: Arc<serde_json::Value>,
    limit: Duration,
) -> std::result::Result<WorkerResult, WorkerError> {
    run_isolated(
        async move {
            let health = worker.health();
            if !health.healthy {
                return Err(WorkerError::Unhealthy(
                    health
                        .message
                        .unwrap_or_else(|| "health check failed".to_string()),
                ));
            }
            worker.produce_result(&params).await
        },
        limit,
    )
    .await
}

/// Worker task that is aborted when its owner goes away
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run worker code on its own task under `limit`. Panics become
/// `Panicked`, overruns become `Timeout`, and dropping the returned future
/// cancels the worker.
async fn run_isolated<F, T>(work: F, limit: Duration) -> std::result::Result<T, WorkerError>
where
    F: Future<Output = std::result::Result<T, WorkerError>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = AbortOnDrop(tokio::spawn(work));
    match tokio::time::timeout(limit, &mut task.0).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(WorkerError::Panicked(join_error_message(join_err))),
        Err(_) => Err(WorkerError::Timeout {
            elapsed_ms: millis(limit),
        }),
    }
}

/// `worker.metadata()` with panics caught
pub(super) fn worker_metadata(
    worker: &dyn CapabilityWorker,
) -> std::result::Result<BTreeMap<String, String>, WorkerError> {
    panic::catch_unwind(AssertUnwindSafe(|| worker.metadata()))
        .map_err(|payload| WorkerError::Panicked(panic_payload_message(payload)))
}

async fn remote_outcome(registry: &AgentRegistry, capability: &str) -> CapabilityOutcome {
    match registry.get_agent(capability).await {
        Some(record) => CapabilityOutcome::Remote {
            agent_id: record.agent_id,
            instance_id: record.instance_id,
        },
        None => CapabilityOutcome::Unavailable {
            kind: UnavailableKind::NoHealthyAgent,
            reason: format!("no healthy agent for {capability}"),
        },
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    panic_payload_message(err.into_panic())
}

fn panic_payload_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
