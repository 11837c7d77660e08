//! Capability Workers: in-process implementations of a capability
//!
//! Each worker implements `CapabilityWorker`; the Coordinator owns them in a
//! capability → worker map and fans requests out across them.

pub mod traits;
pub mod types;

pub use crate::error::WorkerError;
pub use traits::CapabilityWorker;
pub use types::{ConfidenceTier, FeedbackOutcome, WorkerHealth, WorkerResult};
