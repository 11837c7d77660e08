use std::collections::BTreeMap;

use thiserror::Error;

use crate::coordinator::CapabilityOutcome;

/// Main error type for request-level failures
#[derive(Error, Debug)]
pub enum BullpenError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Nothing to combine: all {} requested capabilities failed or were unavailable", .outcomes.len())]
    NothingToCombine {
        outcomes: BTreeMap<String, CapabilityOutcome>,
    },

    // Registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Result type alias for BullpenError
pub type Result<T> = std::result::Result<T, BullpenError>;

/// Errors surfaced by the agent registry.
///
/// Only `register` returns these; every other registry operation degrades to
/// an empty or negative answer instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid capability name: {0:?}")]
    InvalidCapability(String),

    #[error("Invalid instance id: {0:?}")]
    InvalidInstance(String),
}

/// Errors produced while invoking a capability worker
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker failed: {0}")]
    Failed(String),

    #[error("Timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Worker unhealthy: {0}")]
    Unhealthy(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
