//! In-process Registry Store
//!
//! Backs single-process deployments and tests. Expiry is evaluated against
//! the injected `Clock`, so a `ManualClock` makes TTL behaviour deterministic.
//! Outages can be simulated with `set_available(false)`. Scans visit keys in
//! sorted order, so keys deleted mid-iteration never cause others to be skipped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::store::{RegistryStore, ScanPage, StoreError, StoreResult};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Expiring hash/set store held in memory
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    connect_calls: AtomicU64,
    // Scan cursor id -> last key returned; keys are visited in sorted order
    scan_cursors: DashMap<u64, String>,
    next_cursor: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
            connect_calls: AtomicU64::new(0),
            scan_cursors: DashMap::new(),
            next_cursor: AtomicU64::new(1),
        }
    }

    /// Simulate the store going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `connect` calls seen so far
    pub fn connect_calls(&self) -> u64 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Remaining TTL for a key, if it has one
    pub fn ttl(&self, key: &str) -> Option<chrono::Duration> {
        let now = self.clock.now();
        self.live_entry(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn live_entry(&self, key: &str, now: DateTime<Utc>) -> Option<Entry> {
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            debug!(key, "expired key purged");
            return None;
        }
        Some(entry)
    }

    fn purge_if_expired(&self, key: &str) {
        let now = self.clock.now();
        self.entries.remove_if(key, |_, e| e.is_expired(now));
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn connect(&self) -> StoreResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.live_entry(key, self.clock.now()).is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        self.purge_if_expired(key);
        Ok(self.entries.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        self.purge_if_expired(key);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Backend(format!("ttl out of range: {e}")))?;
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(self.clock.now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hset(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()> {
        self.check_available()?;
        self.purge_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(hash) => {
                hash.extend(fields);
                Ok(())
            }
            Value::Set(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check_available()?;
        match self.live_entry(key, self.clock.now()) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(HashMap::new()),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        self.purge_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            Value::Hash(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        self.purge_if_expired(key);
        let removed = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::Set(set) => set.remove(member),
                Value::Hash(_) => {
                    return Err(StoreError::WrongType {
                        key: key.to_string(),
                    })
                }
            },
            None => return Ok(false),
        };
        // Empty sets cease to exist
        self.entries
            .remove_if(key, |_, e| matches!(&e.value, Value::Set(s) if s.is_empty()));
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>> {
        self.check_available()?;
        match self.live_entry(key, self.clock.now()) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(HashSet::new()),
        }
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        Ok(self.smembers(key).await?.len())
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<ScanPage> {
        self.check_available()?;
        let after = if cursor == 0 {
            None
        } else {
            let (_, last) = self
                .scan_cursors
                .remove(&cursor)
                .ok_or_else(|| StoreError::Backend(format!("unknown scan cursor {cursor}")))?;
            Some(last)
        };

        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && glob_match(pattern, e.key()))
            .filter(|e| after.as_deref().map_or(true, |last| e.key().as_str() > last))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();

        let take = count.max(1);
        if keys.len() <= take {
            return Ok(ScanPage { cursor: 0, keys });
        }
        keys.truncate(take);
        let next = self.next_cursor.fetch_add(1, Ordering::SeqCst);
        if let Some(last) = keys.last() {
            self.scan_cursors.insert(next, last.clone());
        }
        Ok(ScanPage { cursor: next, keys })
    }
}

/// Glob matching with `*` (any run) and `?` (any single char)
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
