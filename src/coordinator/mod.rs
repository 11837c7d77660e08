//! Coordinator
//!
//! Per-process orchestrator: hosts local capability workers, keeps their
//! registry records alive with a background heartbeat and fans dispatch
//! requests out across capabilities with per-capability failure isolation.

pub mod config;
#[allow(clippy::module_inception)]
pub mod coordinator;
pub mod dispatch;
mod heartbeat;
pub mod state;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use dispatch::{
    CapabilityOutcome, DispatchOutcome, DispatchRequest, DispatchStats, FailureKind,
    UnavailableKind,
};
pub use state::LocalAgentSnapshot;
