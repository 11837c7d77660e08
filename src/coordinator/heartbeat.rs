//! Background heartbeat task
//!
//! One per coordinator. Every interval it refreshes each locally owned agent,
//! re-registers agents whose record is gone, retries local-only capabilities
//! and optionally sweeps stale agents. Stopping is cooperative: the shutdown
//! signal is only observed between ticks, so a tick in progress always
//! completes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::coordinator::worker_metadata;
use super::state::LocalAgents;
use crate::error::RegistryError;
use crate::registry::{AgentRegistry, HeartbeatOutcome};

#[derive(Clone)]
pub(crate) struct HeartbeatContext {
    pub registry: Arc<AgentRegistry>,
    pub local: Arc<RwLock<LocalAgents>>,
    pub instance_id: String,
    pub interval: Duration,
    pub cleanup: bool,
}

/// Running heartbeat task plus its stop signal
pub(crate) struct HeartbeatHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn spawn(ctx: HeartbeatContext) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(
            instance_id = %ctx.instance_id,
            interval_secs = ctx.interval.as_secs(),
            "heartbeat loop started"
        );
        let task = tokio::spawn(run(ctx, shutdown_rx));
        Self { shutdown_tx, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the loop and wait for it to exit
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "heartbeat task ended abnormally");
        }
    }
}

async fn run(ctx: HeartbeatContext, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + ctx.interval, ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                ctx.beat().await;
            }
        }
    }

    info!(instance_id = %ctx.instance_id, "heartbeat loop stopped");
}

impl HeartbeatContext {
    /// One heartbeat pass over every local agent
    pub async fn beat(&self) {
        let (registered, local_only) = {
            let local = self.local.read().await;
            (local.registered(), local.unregistered())
        };

        let mut refreshed = 0usize;
        for (capability, agent_id) in registered {
            match self.registry.heartbeat(&agent_id).await {
                HeartbeatOutcome::Refreshed => refreshed += 1,
                HeartbeatOutcome::Gone => {
                    warn!(
                        capability = %capability,
                        agent_id = %agent_id,
                        "agent record gone; re-registering"
                    );
                    self.reregister(&capability, Some(&agent_id)).await;
                }
                HeartbeatOutcome::Unavailable => {
                    debug!(agent_id = %agent_id, "heartbeat skipped; store unavailable");
                }
            }
        }

        for capability in local_only {
            self.reregister(&capability, None).await;
        }

        if self.cleanup {
            self.registry.cleanup_stale_agents().await;
        }
        debug!(instance_id = %self.instance_id, refreshed, "heartbeat tick");
    }

    /// Mint a fresh id for `capability`, unless it was unregistered or
    /// re-registered by someone else in the meantime
    pub async fn reregister(&self, capability: &str, stale_id: Option<&str>) {
        let Some(worker) = self.local.read().await.worker(capability) else {
            return;
        };
        let metadata = match worker_metadata(worker.as_ref()) {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(capability = %capability, error = %e, "re-registration skipped");
                return;
            }
        };

        let new_id = match self
            .registry
            .register(capability, &self.instance_id, metadata)
            .await
        {
            Ok(id) => id,
            Err(RegistryError::StoreUnavailable(_)) => {
                debug!(capability = %capability, "re-registration deferred; store unavailable");
                return;
            }
            Err(e) => {
                warn!(capability = %capability, error = %e, "re-registration failed");
                return;
            }
        };

        let installed = self
            .local
            .write()
            .await
            .replace_id(capability, stale_id, new_id.clone());
        if installed {
            info!(capability = %capability, agent_id = %new_id, "capability re-registered");
        } else {
            debug!(capability = %capability, agent_id = %new_id, "re-registration raced; discarding");
            self.registry.unregister(&new_id).await;
        }
    }
}
