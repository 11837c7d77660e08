//! Registry Store interface
//!
//! The narrow slice of an expiring key-value service the registry needs:
//! hashes, sets, per-key TTL and cursor scans. Semantics follow the usual
//! Redis conventions (missing hash reads as empty, empty sets disappear,
//! `scan` cursor `0` both starts and terminates an iteration).

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("wrong value type at key {key}")]
    WrongType { key: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Connectivity failures, as opposed to data/usage errors
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One page of a cursor scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; `0` when the iteration is complete
    pub cursor: u64,
    pub keys: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryStore: Send + Sync + 'static {
    /// Establish (or verify) connectivity
    async fn connect(&self) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remove a key of any type. Returns whether it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Set a TTL on an existing key. Returns false if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Write (merge) fields into a hash, creating it if needed
    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()>;

    /// Read a whole hash; empty when the key is missing
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Add a member to a set. Returns whether it was newly added.
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set. Returns whether it was present.
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>>;

    async fn scard(&self, key: &str) -> StoreResult<usize>;

    /// Iterate keys matching a glob pattern, `count` keys per page (a hint)
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<ScanPage>;
}
