#![allow(dead_code)]

use async_trait::async_trait;
use bullpen::{
    AgentRegistry, CapabilityWorker, ConfidenceTier, ConfidenceWeights, Coordinator,
    CoordinatorConfig, FeedbackOutcome, MemoryStore, RegistryConfig, WorkerError, WorkerHealth,
    WorkerResult,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Worker with a fixed answer, optionally delayed
pub struct FixedWorker {
    pub tier: ConfidenceTier,
    pub delay: Duration,
    pub fail: bool,
}

impl FixedWorker {
    pub fn answering(tier: ConfidenceTier) -> Arc<Self> {
        Arc::new(Self {
            tier,
            delay: Duration::ZERO,
            fail: false,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tier: ConfidenceTier::High,
            delay,
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            tier: ConfidenceTier::Low,
            delay: Duration::ZERO,
            fail: true,
        })
    }
}

#[async_trait]
impl CapabilityWorker for FixedWorker {
    async fn produce_result(
        &self,
        params: &serde_json::Value,
    ) -> Result<WorkerResult, WorkerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(anyhow::anyhow!("upstream feed rejected {params}").into());
        }
        Ok(WorkerResult::new(self.tier, format!("{} pick", self.tier))
            .with_payload(params.clone()))
    }

    async fn report_feedback(
        &self,
        _result_id: &str,
        _outcome: FeedbackOutcome,
    ) -> Result<(), WorkerError> {
        Ok(())
    }

    fn health(&self) -> WorkerHealth {
        WorkerHealth::healthy()
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("version".to_string(), "1.0".to_string())])
    }
}

pub fn coordinator(store: Arc<MemoryStore>, instance_id: &str, timeout_ms: u64) -> Coordinator {
    let registry = Arc::new(AgentRegistry::new(store, RegistryConfig::default()));
    Coordinator::new(
        registry,
        CoordinatorConfig {
            instance_id: Some(instance_id.to_string()),
            invocation_timeout_ms: timeout_ms,
            ..Default::default()
        },
        ConfidenceWeights::default(),
    )
}
