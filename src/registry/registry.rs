//! Agent Registry: shared discovery and liveness over a `RegistryStore`
//!
//! Stateless apart from connection bookkeeping and round-robin cursors: every
//! answer is read back from the store and every status is derived at read
//! time. Store failures never escape as errors except from `register`; reads
//! degrade to "no data" and writes to a negative outcome, so callers can keep
//! running in local-only mode.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::RegistryConfig;
use super::keys::KeySpace;
use super::record::{
    capability_from_fields, heartbeat_fields, heartbeat_from_fields, instance_from_fields,
    mint_agent_id, AgentHealth, AgentRecord, HealthThresholds,
};
use super::selection::Selector;
use super::store::{RegistryStore, StoreError, StoreResult};
use crate::clock::{Clock, SystemClock};
use crate::error::RegistryError;

/// Result of `unregister`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterOutcome {
    Removed,
    AlreadyGone,
    /// Store unreachable; nothing was changed
    Unavailable,
}

impl UnregisterOutcome {
    /// True unless the store could not be reached
    pub fn is_success(&self) -> bool {
        !matches!(self, UnregisterOutcome::Unavailable)
    }
}

/// Result of `heartbeat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Refreshed,
    /// No live record: expired, unregistered or already stale. Re-register.
    Gone,
    /// Store unreachable; liveness unknown
    Unavailable,
}

impl HeartbeatOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, HeartbeatOutcome::Refreshed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Cold,
    Connected,
    Unavailable { since: DateTime<Utc> },
}

/// Shared agent registry
pub struct AgentRegistry {
    store: Arc<dyn RegistryStore>,
    config: RegistryConfig,
    keys: KeySpace,
    thresholds: HealthThresholds,
    clock: Arc<dyn Clock>,
    selector: Selector,
    connection: Mutex<ConnectionState>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, config: RegistryConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn RegistryStore>,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            keys: KeySpace::new(config.namespace.clone()),
            thresholds: config.thresholds(),
            store,
            config,
            clock,
            selector: Selector::new(),
            connection: Mutex::new(ConnectionState::Cold),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Whether the last known store state is reachable
    pub async fn is_available(&self) -> bool {
        matches!(*self.connection.lock().await, ConnectionState::Connected)
    }

    // ==================== Registration ====================

    /// Register a new agent for `capability` owned by `instance_id`.
    ///
    /// Always mints a fresh agent id. `Err(StoreUnavailable)` means the caller
    /// should continue in local-only mode.
    pub async fn register(
        &self,
        capability: &str,
        instance_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<String, RegistryError> {
        validate_capability(capability)?;
        if instance_id.trim().is_empty() {
            return Err(RegistryError::InvalidInstance(instance_id.to_string()));
        }
        if !self.ensure_connected().await {
            return Err(RegistryError::StoreUnavailable(
                "registry store unavailable".into(),
            ));
        }

        let agent_id = mint_agent_id(instance_id, capability);
        let record = AgentRecord::new(
            agent_id.clone(),
            capability,
            instance_id,
            metadata,
            self.clock.now(),
        );

        if let Err(e) = self.write_registration(&record).await {
            self.note_store_error("register", &e).await;
            return Err(RegistryError::StoreUnavailable(e.to_string()));
        }

        info!(
            agent_id = %agent_id,
            capability = %capability,
            instance_id = %instance_id,
            "agent registered"
        );
        Ok(agent_id)
    }

    async fn write_registration(&self, record: &AgentRecord) -> StoreResult<()> {
        let record_key = self.keys.agent(&record.agent_id);
        self.store.hset(&record_key, record.to_fields()).await?;
        self.store.expire(&record_key, self.record_ttl()).await?;
        self.store
            .sadd(&self.keys.capability_members(&record.capability), &record.agent_id)
            .await?;
        self.store
            .sadd(&self.keys.instance_members(&record.instance_id), &record.agent_id)
            .await?;
        self.store
            .sadd(&self.keys.capability_index(), &record.capability)
            .await?;
        Ok(())
    }

    /// Remove an agent. Idempotent: a missing record is `AlreadyGone`.
    pub async fn unregister(&self, agent_id: &str) -> UnregisterOutcome {
        if !self.ensure_connected().await {
            return UnregisterOutcome::Unavailable;
        }
        let fields = match self.store.hgetall(&self.keys.agent(agent_id)).await {
            Ok(fields) => fields,
            Err(e) => {
                self.note_store_error("unregister", &e).await;
                return UnregisterOutcome::Unavailable;
            }
        };
        if fields.is_empty() {
            debug!(agent_id = %agent_id, "unregister: agent already gone");
            return UnregisterOutcome::AlreadyGone;
        }

        let capability = capability_from_fields(&fields).map(str::to_string);
        let instance_id = instance_from_fields(&fields).map(str::to_string);
        match self
            .remove_agent(agent_id, capability.as_deref(), instance_id.as_deref())
            .await
        {
            Ok(true) => {
                info!(agent_id = %agent_id, "agent unregistered");
                UnregisterOutcome::Removed
            }
            Ok(false) => UnregisterOutcome::AlreadyGone,
            Err(e) => {
                self.note_store_error("unregister", &e).await;
                UnregisterOutcome::Unavailable
            }
        }
    }

    /// Shared removal path for `unregister`, stale heartbeats and cleanup.
    ///
    /// Returns whether this call deleted the record.
    async fn remove_agent(
        &self,
        agent_id: &str,
        capability: Option<&str>,
        instance_id: Option<&str>,
    ) -> StoreResult<bool> {
        let existed = self.store.del(&self.keys.agent(agent_id)).await?;
        if let Some(capability) = capability {
            self.store
                .srem(&self.keys.capability_members(capability), agent_id)
                .await?;
        }
        if let Some(instance_id) = instance_id {
            self.store
                .srem(&self.keys.instance_members(instance_id), agent_id)
                .await?;
        }
        Ok(existed)
    }

    // ==================== Liveness ====================

    /// Refresh an agent's heartbeat and its self-destruct TTL.
    ///
    /// A record that is already stale is removed rather than revived; the
    /// owner must re-register under a new id.
    pub async fn heartbeat(&self, agent_id: &str) -> HeartbeatOutcome {
        if !self.ensure_connected().await {
            return HeartbeatOutcome::Unavailable;
        }
        match self.try_heartbeat(agent_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.note_store_error("heartbeat", &e).await;
                HeartbeatOutcome::Unavailable
            }
        }
    }

    async fn try_heartbeat(&self, agent_id: &str) -> StoreResult<HeartbeatOutcome> {
        let key = self.keys.agent(agent_id);
        let fields = self.store.hgetall(&key).await?;
        if fields.is_empty() {
            debug!(agent_id = %agent_id, "heartbeat for unknown agent");
            return Ok(HeartbeatOutcome::Gone);
        }

        let now = self.clock.now();
        let stale = heartbeat_from_fields(&fields)
            .map(|ts| self.thresholds.status_for(ts, now).is_stale())
            .unwrap_or(true);
        if stale {
            warn!(agent_id = %agent_id, "heartbeat for stale agent; removing record");
            self.remove_agent(
                agent_id,
                capability_from_fields(&fields),
                instance_from_fields(&fields),
            )
            .await?;
            return Ok(HeartbeatOutcome::Gone);
        }

        // expire before hset: hset would recreate a key deleted since the read
        if !self.store.expire(&key, self.record_ttl()).await? {
            debug!(agent_id = %agent_id, "agent removed during heartbeat");
            return Ok(HeartbeatOutcome::Gone);
        }
        self.store.hset(&key, heartbeat_fields(now)).await?;

        // Deleted between expire and hset: only our heartbeat field survives
        let written = self.store.hgetall(&key).await?;
        if capability_from_fields(&written).is_none() {
            self.store.del(&key).await?;
            debug!(agent_id = %agent_id, "discarded partial record left by racing removal");
            return Ok(HeartbeatOutcome::Gone);
        }
        debug!(agent_id = %agent_id, "heartbeat refreshed");
        Ok(HeartbeatOutcome::Refreshed)
    }

    // ==================== Discovery ====================

    /// One healthy agent for `capability`, chosen by the configured policy
    pub async fn get_agent(&self, capability: &str) -> Option<AgentRecord> {
        let healthy: Vec<AgentRecord> = self
            .get_all_agents(capability)
            .await
            .into_iter()
            .filter(|record| record.status.is_healthy())
            .collect();
        self.selector
            .pick(capability, self.config.policy_for(capability), healthy)
    }

    /// Every record for `capability`, oldest registration first
    pub async fn get_all_agents(&self, capability: &str) -> Vec<AgentRecord> {
        self.records_in_set(&self.keys.capability_members(capability), "get_all_agents")
            .await
    }

    /// Every record owned by `instance_id`
    pub async fn get_instance_agents(&self, instance_id: &str) -> Vec<AgentRecord> {
        self.records_in_set(&self.keys.instance_members(instance_id), "get_instance_agents")
            .await
    }

    /// Point lookup with freshly derived status
    pub async fn get_agent_info(&self, agent_id: &str) -> Option<AgentRecord> {
        if !self.ensure_connected().await {
            return None;
        }
        match self.store.hgetall(&self.keys.agent(agent_id)).await {
            Ok(fields) => AgentRecord::from_fields(&fields, &self.thresholds, self.clock.now()),
            Err(e) => {
                self.note_store_error("get_agent_info", &e).await;
                None
            }
        }
    }

    /// Capabilities with at least one agent that is not stale
    pub async fn list_capabilities(&self) -> BTreeSet<String> {
        if !self.ensure_connected().await {
            return BTreeSet::new();
        }
        let capabilities = match self.store.smembers(&self.keys.capability_index()).await {
            Ok(members) => members,
            Err(e) => {
                self.note_store_error("list_capabilities", &e).await;
                return BTreeSet::new();
            }
        };

        let mut live = BTreeSet::new();
        for capability in capabilities {
            let agents = self.get_all_agents(&capability).await;
            if agents.iter().any(|a| !a.status.is_stale()) {
                live.insert(capability);
            }
        }
        live
    }

    async fn records_in_set(&self, set_key: &str, op: &'static str) -> Vec<AgentRecord> {
        if !self.ensure_connected().await {
            return Vec::new();
        }
        match self.try_records_in_set(set_key).await {
            Ok(records) => records,
            Err(e) => {
                self.note_store_error(op, &e).await;
                Vec::new()
            }
        }
    }

    async fn try_records_in_set(&self, set_key: &str) -> StoreResult<Vec<AgentRecord>> {
        let members = self.store.smembers(set_key).await?;
        let now = self.clock.now();
        let mut records = Vec::with_capacity(members.len());
        for agent_id in members {
            let fields = self.store.hgetall(&self.keys.agent(&agent_id)).await?;
            match AgentRecord::from_fields(&fields, &self.thresholds, now) {
                Some(record) => records.push(record),
                None => debug!(agent_id = %agent_id, "member without a readable record"),
            }
        }
        records.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        Ok(records)
    }

    // ==================== Cleanup ====================

    /// Remove every stale agent record, then prune set members whose record is
    /// gone. Returns the number of stale agents removed by this call.
    ///
    /// Safe to run concurrently from several instances.
    pub async fn cleanup_stale_agents(&self) -> usize {
        if !self.ensure_connected().await {
            return 0;
        }

        let removed = match self.sweep_stale_records().await {
            Ok(removed) => removed,
            Err((removed, e)) => {
                self.note_store_error("cleanup_stale_agents", &e).await;
                return removed;
            }
        };

        match self.prune_orphans().await {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "pruned orphaned registry members"),
            Err(e) => self.note_store_error("cleanup_stale_agents", &e).await,
        }

        if removed > 0 {
            info!(removed, "removed stale agents");
        }
        removed
    }

    async fn sweep_stale_records(&self) -> Result<usize, (usize, StoreError)> {
        let pattern = self.keys.agent_pattern();
        let mut cursor = 0;
        let mut removed = 0;
        loop {
            let page = self
                .store
                .scan(cursor, &pattern, self.config.scan_batch)
                .await
                .map_err(|e| (removed, e))?;

            for key in &page.keys {
                let Some(agent_id) = self.keys.agent_id_from_key(key) else {
                    continue;
                };
                if self
                    .remove_if_stale(agent_id, key)
                    .await
                    .map_err(|e| (removed, e))?
                {
                    removed += 1;
                }
            }

            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    async fn remove_if_stale(&self, agent_id: &str, key: &str) -> StoreResult<bool> {
        let fields = self.store.hgetall(key).await?;
        if fields.is_empty() {
            return Ok(false);
        }
        let status = match heartbeat_from_fields(&fields) {
            Some(ts) => self.thresholds.status_for(ts, self.clock.now()),
            None => AgentHealth::Stale,
        };
        if !status.is_stale() {
            return Ok(false);
        }
        let removed = self
            .remove_agent(
                agent_id,
                capability_from_fields(&fields),
                instance_from_fields(&fields),
            )
            .await?;
        if removed {
            debug!(agent_id = %agent_id, "stale agent removed");
        }
        Ok(removed)
    }

    /// Drop set members with no backing record, and capabilities with no members
    async fn prune_orphans(&self) -> StoreResult<usize> {
        let mut pruned = 0;

        let index_key = self.keys.capability_index();
        for capability in self.store.smembers(&index_key).await? {
            let set_key = self.keys.capability_members(&capability);
            pruned += self.prune_set(&set_key).await?;
            if self.store.scard(&set_key).await? == 0 {
                self.store.srem(&index_key, &capability).await?;
                // A registration may have landed in between
                if self.store.scard(&set_key).await? > 0 {
                    self.store.sadd(&index_key, &capability).await?;
                }
            }
        }

        let pattern = format!("{}:instance:*:agents", self.keys.namespace());
        let mut cursor = 0;
        loop {
            let page = self
                .store
                .scan(cursor, &pattern, self.config.scan_batch)
                .await?;
            for set_key in &page.keys {
                pruned += self.prune_set(set_key).await?;
            }
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(pruned)
    }

    async fn prune_set(&self, set_key: &str) -> StoreResult<usize> {
        let mut pruned = 0;
        for agent_id in self.store.smembers(set_key).await? {
            if !self.store.exists(&self.keys.agent(&agent_id)).await?
                && self.store.srem(set_key, &agent_id).await?
            {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    // ==================== Connection state ====================

    fn record_ttl(&self) -> std::time::Duration {
        self.thresholds
            .record_ttl()
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }

    /// Lazily connect on first use; afterwards only retry a down store once
    /// the configured cooldown has elapsed.
    async fn ensure_connected(&self) -> bool {
        let mut state = self.connection.lock().await;
        let now = self.clock.now();
        match *state {
            ConnectionState::Connected => return true,
            ConnectionState::Unavailable { since } => match self.config.reconnect_cooldown() {
                Some(cooldown) if now - since >= cooldown => {}
                _ => return false,
            },
            ConnectionState::Cold => {}
        }

        match self.store.connect().await {
            Ok(()) => {
                if matches!(*state, ConnectionState::Unavailable { .. }) {
                    info!("registry store reachable again");
                } else {
                    debug!("registry store connected");
                }
                *state = ConnectionState::Connected;
                true
            }
            Err(e) => {
                if matches!(*state, ConnectionState::Cold) {
                    warn!(error = %e, "registry store unavailable; running local-only");
                } else {
                    debug!(error = %e, "registry store still unavailable");
                }
                *state = ConnectionState::Unavailable { since: now };
                false
            }
        }
    }

    async fn note_store_error(&self, op: &'static str, err: &StoreError) {
        if !err.is_unavailable() {
            warn!(op, error = %err, "registry store error");
            return;
        }
        let mut state = self.connection.lock().await;
        if matches!(*state, ConnectionState::Connected) {
            warn!(op, error = %err, "registry store became unavailable; running local-only");
        }
        *state = ConnectionState::Unavailable {
            since: self.clock.now(),
        };
    }
}

pub(crate) fn validate_capability(capability: &str) -> Result<(), RegistryError> {
    let invalid = capability.trim().is_empty()
        || capability != capability.trim()
        || capability.contains(['*', '?', '[', ']']);
    if invalid {
        return Err(RegistryError::InvalidCapability(capability.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::memory::MemoryStore;
    use crate::registry::selection::SelectionPolicy;
    use crate::registry::store::MockRegistryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        registry: AgentRegistry,
    }

    fn fixture_with(config: RegistryConfig) -> Fixture {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let registry = AgentRegistry::with_clock(store.clone(), config, Arc::new(clock.clone()));
        Fixture {
            store,
            clock,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RegistryConfig::default())
    }

    fn meta() -> BTreeMap<String, String> {
        BTreeMap::from([("version".to_string(), "1.2".to_string())])
    }

    #[tokio::test]
    async fn test_register_is_immediately_healthy() {
        let f = fixture();
        let id = f.registry.register("baseball", "i1", meta()).await.unwrap();

        let info = f.registry.get_agent_info(&id).await.unwrap();
        assert_eq!(info.status, AgentHealth::Healthy);
        assert_eq!(info.capability, "baseball");
        assert_eq!(info.instance_id, "i1");
        assert_eq!(info.metadata.get("version").map(String::as_str), Some("1.2"));
    }

    #[tokio::test]
    async fn test_register_sets_ttl_twice_stale_threshold() {
        let f = fixture();
        let id = f.registry.register("baseball", "i1", meta()).await.unwrap();
        let ttl = f.store.ttl(&f.registry.keys().agent(&id)).unwrap();
        assert_eq!(ttl, chrono::Duration::seconds(240));
    }

    #[tokio::test]
    async fn test_register_rejects_bad_capability() {
        let f = fixture();
        for bad in ["", "  ", "nba*", " nba"] {
            let err = f.registry.register(bad, "i1", meta()).await.unwrap_err();
            assert!(matches!(err, RegistryError::InvalidCapability(_)));
        }
    }

    #[tokio::test]
    async fn test_register_rejects_blank_instance() {
        let f = fixture();
        let err = f.registry.register("nba", " ", meta()).await.unwrap_err();
        assert_eq!(err, RegistryError::InvalidInstance(" ".to_string()));
        assert!(f.registry.get_all_agents("nba").await.is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_mints_new_id() {
        let f = fixture();
        let a = f.registry.register("nba", "i1", meta()).await.unwrap();
        let b = f.registry.register("nba", "i1", meta()).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_two_instances_same_capability() {
        let f = fixture();
        f.registry.register("nba", "i1", meta()).await.unwrap();
        f.registry.register("nba", "i2", meta()).await.unwrap();

        let all = f.registry.get_all_agents("nba").await;
        assert_eq!(all.len(), 2);
        let instances: BTreeSet<_> = all.iter().map(|a| a.instance_id.as_str()).collect();
        assert_eq!(instances, BTreeSet::from(["i1", "i2"]));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let f = fixture();
        let id = f.registry.register("nba", "i1", meta()).await.unwrap();

        assert_eq!(f.registry.unregister(&id).await, UnregisterOutcome::Removed);
        assert_eq!(f.registry.unregister(&id).await, UnregisterOutcome::AlreadyGone);
        assert!(f.registry.get_all_agents("nba").await.is_empty());
        assert!(f.registry.get_instance_agents("i1").await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_agent_healthy() {
        let f = fixture();
        let id = f.registry.register("nba", "i1", meta()).await.unwrap();

        for _ in 0..5 {
            f.clock.advance_secs(30);
            assert_eq!(f.registry.heartbeat(&id).await, HeartbeatOutcome::Refreshed);
        }
        let info = f.registry.get_agent_info(&id).await.unwrap();
        assert_eq!(info.status, AgentHealth::Healthy);
        assert!(info.last_heartbeat > info.registered_at);
    }

    #[tokio::test]
    async fn test_heartbeat_on_missing_agent_creates_nothing() {
        let f = fixture();
        assert_eq!(f.registry.heartbeat("ghost").await, HeartbeatOutcome::Gone);
        assert!(f.registry.get_agent_info("ghost").await.is_none());
        assert!(f.store.is_empty());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum DeleteAfter {
        Read,
        Expire,
    }

    /// Deletes an agent record right after one chosen call during a heartbeat,
    /// as a concurrent unregister or TTL expiry would
    struct RacingDelete {
        inner: Arc<MemoryStore>,
        key: String,
        after: DeleteAfter,
        fired: std::sync::atomic::AtomicBool,
    }

    impl RacingDelete {
        async fn maybe_delete(&self, point: DeleteAfter, key: &str) {
            if point == self.after
                && key == self.key
                && !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                self.inner.del(key).await.unwrap();
            }
        }
    }

    #[async_trait::async_trait]
    impl RegistryStore for RacingDelete {
        async fn connect(&self) -> StoreResult<()> {
            self.inner.connect().await
        }
        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.inner.exists(key).await
        }
        async fn del(&self, key: &str) -> StoreResult<bool> {
            self.inner.del(key).await
        }
        async fn expire(&self, key: &str, ttl: std::time::Duration) -> StoreResult<bool> {
            let refreshed = self.inner.expire(key, ttl).await?;
            self.maybe_delete(DeleteAfter::Expire, key).await;
            Ok(refreshed)
        }
        async fn hset(
            &self,
            key: &str,
            fields: std::collections::HashMap<String, String>,
        ) -> StoreResult<()> {
            self.inner.hset(key, fields).await
        }
        async fn hgetall(&self, key: &str) -> StoreResult<std::collections::HashMap<String, String>> {
            let fields = self.inner.hgetall(key).await?;
            self.maybe_delete(DeleteAfter::Read, key).await;
            Ok(fields)
        }
        async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.sadd(key, member).await
        }
        async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.srem(key, member).await
        }
        async fn smembers(&self, key: &str) -> StoreResult<std::collections::HashSet<String>> {
            self.inner.smembers(key).await
        }
        async fn scard(&self, key: &str) -> StoreResult<usize> {
            self.inner.scard(key).await
        }
        async fn scan(
            &self,
            cursor: u64,
            pattern: &str,
            count: usize,
        ) -> StoreResult<crate::registry::store::ScanPage> {
            self.inner.scan(cursor, pattern, count).await
        }
    }

    async fn heartbeat_with_delete_after(after: DeleteAfter) {
        let f = fixture();
        let id = f.registry.register("nba", "i1", meta()).await.unwrap();
        let key = f.registry.keys().agent(&id);
        let racing = AgentRegistry::with_clock(
            Arc::new(RacingDelete {
                inner: f.store.clone(),
                key: key.clone(),
                after,
                fired: std::sync::atomic::AtomicBool::new(false),
            }),
            RegistryConfig::default(),
            Arc::new(f.clock.clone()),
        );

        f.clock.advance_secs(10);
        assert_eq!(racing.heartbeat(&id).await, HeartbeatOutcome::Gone);
        assert!(!f.store.exists(&key).await.unwrap());
        assert!(f.registry.get_agent_info(&id).await.is_none());

        f.clock.advance_secs(121);
        assert_eq!(f.registry.cleanup_stale_agents().await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_racing_delete_after_read_leaves_no_record() {
        heartbeat_with_delete_after(DeleteAfter::Read).await;
    }

    #[tokio::test]
    async fn test_heartbeat_racing_delete_after_expire_leaves_no_record() {
        heartbeat_with_delete_after(DeleteAfter::Expire).await;
    }

    #[tokio::test]
    async fn test_heartbeat_after_ttl_expiry_is_gone() {
        let f = fixture();
        let id = f.registry.register("nba", "i1", meta()).await.unwrap();
        f.clock.advance_secs(241);

        assert_eq!(f.registry.heartbeat(&id).await, HeartbeatOutcome::Gone);
        assert!(f.registry.get_agent_info(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_agent_is_not_revived_by_heartbeat() {
        let f = fixture();
        let id = f.registry.register("nba", "i1", meta()).await.unwrap();
        f.clock.advance_secs(121);

        assert_eq!(f.registry.heartbeat(&id).await, HeartbeatOutcome::Gone);
        assert!(f.registry.get_agent_info(&id).await.is_none());
        assert!(f.registry.get_all_agents("nba").await.is_empty());
    }

    #[tokio::test]
    async fn test_status_progression() {
        let f = fixture();
        let id = f.registry.register("nba", "i1", meta()).await.unwrap();

        f.clock.advance_secs(61);
        assert_eq!(
            f.registry.get_agent_info(&id).await.unwrap().status,
            AgentHealth::Unhealthy
        );
        assert!(f.registry.get_agent("nba").await.is_none());

        f.clock.advance_secs(60);
        assert_eq!(
            f.registry.get_agent_info(&id).await.unwrap().status,
            AgentHealth::Stale
        );
    }

    #[tokio::test]
    async fn test_get_agent_skips_unhealthy() {
        let f = fixture();
        let old = f.registry.register("nba", "i1", meta()).await.unwrap();
        f.clock.advance_secs(50);
        let fresh = f.registry.register("nba", "i2", meta()).await.unwrap();
        f.clock.advance_secs(20);

        // `old` is 70s silent (unhealthy), `fresh` 20s
        let picked = f.registry.get_agent("nba").await.unwrap();
        assert_eq!(picked.agent_id, fresh);
        assert_ne!(picked.agent_id, old);
    }

    #[tokio::test]
    async fn test_round_robin_selection() {
        let mut config = RegistryConfig::default();
        config
            .selection
            .insert("nba".to_string(), SelectionPolicy::RoundRobin);
        let f = fixture_with(config);
        let a = f.registry.register("nba", "i1", meta()).await.unwrap();
        f.clock.advance_secs(1);
        let b = f.registry.register("nba", "i2", meta()).await.unwrap();

        let first = f.registry.get_agent("nba").await.unwrap().agent_id;
        let second = f.registry.get_agent("nba").await.unwrap().agent_id;
        let third = f.registry.get_agent("nba").await.unwrap().agent_id;
        assert_eq!(vec![first, second, third], vec![a.clone(), b, a]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_stale() {
        let f = fixture();
        let stale = f.registry.register("nba", "i1", meta()).await.unwrap();
        f.clock.advance_secs(70);
        let unhealthy = f.registry.register("nba", "i2", meta()).await.unwrap();
        f.clock.advance_secs(55);
        let healthy = f.registry.register("nfl", "i3", meta()).await.unwrap();

        // Ages now: 135s, 65s, 10s
        f.clock.advance_secs(10);
        assert_eq!(
            f.registry.get_agent_info(&unhealthy).await.unwrap().status,
            AgentHealth::Unhealthy
        );

        assert_eq!(f.registry.cleanup_stale_agents().await, 1);
        assert!(f.registry.get_agent_info(&stale).await.is_none());
        assert!(f.registry.get_agent_info(&unhealthy).await.is_some());
        assert!(f.registry.get_agent_info(&healthy).await.is_some());
        assert_eq!(f.registry.get_all_agents("nba").await.len(), 1);

        // Nothing left to remove
        assert_eq!(f.registry.cleanup_stale_agents().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_pages_through_many_records() {
        let config = RegistryConfig {
            scan_batch: 3,
            ..Default::default()
        };
        let f = fixture_with(config);
        for i in 0..10 {
            f.registry
                .register("nba", &format!("i{i}"), meta())
                .await
                .unwrap();
        }
        f.clock.advance_secs(121);
        assert_eq!(f.registry.cleanup_stale_agents().await, 10);
        assert!(f.registry.list_capabilities().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_repairs_orphaned_members() {
        let f = fixture();
        let id = f.registry.register("nba", "i1", meta()).await.unwrap();
        // Record vanishes without its set memberships being cleaned
        f.store.del(&f.registry.keys().agent(&id)).await.unwrap();

        assert_eq!(f.registry.cleanup_stale_agents().await, 0);
        let members = f
            .store
            .smembers(&f.registry.keys().capability_members("nba"))
            .await
            .unwrap();
        assert!(members.is_empty());
        let owned = f
            .store
            .smembers(&f.registry.keys().instance_members("i1"))
            .await
            .unwrap();
        assert!(owned.is_empty());
        assert!(!f
            .store
            .smembers(&f.registry.keys().capability_index())
            .await
            .unwrap()
            .contains("nba"));
    }

    #[tokio::test]
    async fn test_list_capabilities_hides_stale() {
        let f = fixture();
        f.registry.register("nba", "i1", meta()).await.unwrap();
        f.clock.advance_secs(100);
        f.registry.register("baseball", "i2", meta()).await.unwrap();

        assert_eq!(
            f.registry.list_capabilities().await,
            BTreeSet::from(["baseball".to_string(), "nba".to_string()])
        );

        f.clock.advance_secs(30);
        assert_eq!(
            f.registry.list_capabilities().await,
            BTreeSet::from(["baseball".to_string()])
        );
    }

    #[tokio::test]
    async fn test_store_outage_degrades_every_operation() {
        let f = fixture();
        let id = f.registry.register("nba", "i1", meta()).await.unwrap();
        f.store.set_available(false);

        assert!(f.registry.get_agent("nba").await.is_none());
        assert!(!f.registry.is_available().await);
        assert!(f.registry.get_all_agents("nba").await.is_empty());
        assert!(f.registry.get_agent_info(&id).await.is_none());
        assert_eq!(f.registry.heartbeat(&id).await, HeartbeatOutcome::Unavailable);
        assert_eq!(f.registry.unregister(&id).await, UnregisterOutcome::Unavailable);
        assert_eq!(f.registry.cleanup_stale_agents().await, 0);
        assert!(matches!(
            f.registry.register("nfl", "i1", meta()).await,
            Err(RegistryError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_is_latched_without_cooldown() {
        let f = fixture_with(RegistryConfig {
            reconnect_cooldown_secs: None,
            ..Default::default()
        });
        f.store.set_available(false);
        assert!(f.registry.register("nba", "i1", meta()).await.is_err());

        f.store.set_available(true);
        f.clock.advance_secs(3600);
        assert!(f.registry.register("nba", "i1", meta()).await.is_err());
        assert_eq!(f.store.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_cooldown() {
        let config = RegistryConfig {
            reconnect_cooldown_secs: Some(10),
            ..Default::default()
        };
        let f = fixture_with(config);
        f.store.set_available(false);
        assert!(f.registry.register("nba", "i1", meta()).await.is_err());

        f.store.set_available(true);
        f.clock.advance_secs(5);
        assert!(f.registry.register("nba", "i1", meta()).await.is_err());

        f.clock.advance_secs(5);
        assert!(f.registry.register("nba", "i1", meta()).await.is_ok());
        assert!(f.registry.is_available().await);
        assert_eq!(f.store.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_mid_session_outage_recovers_with_default_cooldown() {
        let f = fixture();
        let id = f.registry.register("nba", "i1", meta()).await.unwrap();

        f.store.set_available(false);
        assert_eq!(f.registry.heartbeat(&id).await, HeartbeatOutcome::Unavailable);
        f.store.set_available(true);

        f.clock.advance_secs(10);
        assert_eq!(f.registry.heartbeat(&id).await, HeartbeatOutcome::Unavailable);

        f.clock.advance_secs(20);
        assert_eq!(f.registry.heartbeat(&id).await, HeartbeatOutcome::Refreshed);
        assert_eq!(f.store.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_connect_attempted_once_per_cold_start() {
        let mut store = MockRegistryStore::new();
        store
            .expect_connect()
            .times(1)
            .returning(|| Err(StoreError::Unavailable("connection refused".into())));
        store.expect_smembers().never();
        store.expect_hgetall().never();

        let registry = AgentRegistry::new(Arc::new(store), RegistryConfig::default());
        for _ in 0..3 {
            assert!(registry.get_agent("nba").await.is_none());
        }
        assert_eq!(registry.cleanup_stale_agents().await, 0);
        assert_eq!(registry.heartbeat("x").await, HeartbeatOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_outage_mid_session_marks_unavailable() {
        let mut store = MockRegistryStore::new();
        store.expect_connect().times(1).returning(|| Ok(()));
        store
            .expect_smembers()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("reset by peer".into())));

        let registry = AgentRegistry::new(Arc::new(store), RegistryConfig::default());
        assert!(registry.get_all_agents("nba").await.is_empty());
        // Latched: the second read does not touch the store
        assert!(registry.get_all_agents("nba").await.is_empty());
        assert!(!registry.is_available().await);
    }
}
