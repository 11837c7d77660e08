//! Agent Registry
//!
//! Cross-process discovery of capability agents: identity minting, liveness
//! via heartbeats, health-filtered lookup and stale-entry reclamation, all
//! over an injected `RegistryStore`.

pub mod config;
pub mod keys;
pub mod memory;
pub mod record;
#[allow(clippy::module_inception)]
pub mod registry;
pub mod selection;
pub mod store;

pub use config::RegistryConfig;
pub use keys::KeySpace;
pub use memory::MemoryStore;
pub use record::{AgentHealth, AgentRecord, HealthThresholds};
pub use registry::{AgentRegistry, HeartbeatOutcome, UnregisterOutcome};
pub use selection::{SelectionPolicy, Selector};
pub use store::{RegistryStore, ScanPage, StoreError, StoreResult};
