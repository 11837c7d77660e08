pub mod clock;
pub mod combine;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod registry;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use combine::{combine, CombineError, CombinedResult, ConfidenceWeights};
pub use config::{BullpenConfig, LoggingConfig};
pub use coordinator::{
    CapabilityOutcome, Coordinator, CoordinatorConfig, DispatchOutcome, DispatchRequest,
    DispatchStats, FailureKind, LocalAgentSnapshot, UnavailableKind,
};
pub use error::{BullpenError, RegistryError, Result, WorkerError};
pub use logging::init_logging;
pub use registry::{
    AgentHealth, AgentRecord, AgentRegistry, HealthThresholds, HeartbeatOutcome, KeySpace,
    MemoryStore, RegistryConfig, RegistryStore, ScanPage, SelectionPolicy, StoreError,
    UnregisterOutcome,
};
pub use worker::{CapabilityWorker, ConfidenceTier, FeedbackOutcome, WorkerHealth, WorkerResult};
