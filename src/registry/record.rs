//! Agent records and liveness derivation

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

const FIELD_AGENT_ID: &str = "agent_id";
const FIELD_CAPABILITY: &str = "capability";
const FIELD_INSTANCE_ID: &str = "instance_id";
const FIELD_REGISTERED_AT: &str = "registered_at";
const FIELD_LAST_HEARTBEAT: &str = "last_heartbeat";
const FIELD_METADATA: &str = "metadata";

const AGENT_ID_SUFFIX_LEN: usize = 8;

/// Derived liveness of an agent. Never stored as ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    Healthy,
    Unhealthy,
    Stale,
}

impl AgentHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, AgentHealth::Healthy)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, AgentHealth::Stale)
    }
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentHealth::Healthy => write!(f, "healthy"),
            AgentHealth::Unhealthy => write!(f, "unhealthy"),
            AgentHealth::Stale => write!(f, "stale"),
        }
    }
}

/// The two ages that drive status derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::seconds(30),
            stale_threshold: Duration::seconds(120),
        }
    }
}

impl HealthThresholds {
    /// Status for a heartbeat of the given age.
    ///
    /// A heartbeat from the future (clock skew between instances) counts as fresh.
    pub fn status_for(&self, last_heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> AgentHealth {
        let age = now - last_heartbeat;
        if age > self.stale_threshold {
            AgentHealth::Stale
        } else if age > self.heartbeat_interval * 2 {
            AgentHealth::Unhealthy
        } else {
            AgentHealth::Healthy
        }
    }

    /// Store-level TTL on a record, so dead processes' data self-destructs
    pub fn record_ttl(&self) -> Duration {
        self.stale_threshold * 2
    }
}

/// One registered agent, as read back from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub capability: String,
    pub instance_id: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentHealth,
    pub metadata: BTreeMap<String, String>,
}

impl AgentRecord {
    /// A freshly registered record; always healthy
    pub fn new(
        agent_id: String,
        capability: &str,
        instance_id: &str,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id,
            capability: capability.to_string(),
            instance_id: instance_id.to_string(),
            registered_at: now,
            last_heartbeat: now,
            status: AgentHealth::Healthy,
            metadata,
        }
    }

    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::with_capacity(6);
        fields.insert(FIELD_AGENT_ID.into(), self.agent_id.clone());
        fields.insert(FIELD_CAPABILITY.into(), self.capability.clone());
        fields.insert(FIELD_INSTANCE_ID.into(), self.instance_id.clone());
        fields.insert(FIELD_REGISTERED_AT.into(), format_ts(self.registered_at));
        fields.insert(FIELD_LAST_HEARTBEAT.into(), format_ts(self.last_heartbeat));
        fields.insert(
            FIELD_METADATA.into(),
            serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".into()),
        );
        fields
    }

    /// Decode a stored hash, deriving `status` as of `now`.
    ///
    /// Returns `None` for empty or malformed hashes.
    pub fn from_fields(
        fields: &HashMap<String, String>,
        thresholds: &HealthThresholds,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let agent_id = fields.get(FIELD_AGENT_ID)?.clone();
        let capability = fields.get(FIELD_CAPABILITY)?.clone();
        let instance_id = fields.get(FIELD_INSTANCE_ID)?.clone();
        let last_heartbeat = heartbeat_from_fields(fields)?;
        let registered_at = fields
            .get(FIELD_REGISTERED_AT)
            .and_then(|raw| parse_ts(raw))
            .unwrap_or(last_heartbeat);
        let metadata = match fields.get(FIELD_METADATA) {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                debug!(agent_id = %agent_id, error = %e, "unreadable agent metadata");
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };

        Some(Self {
            status: thresholds.status_for(last_heartbeat, now),
            agent_id,
            capability,
            instance_id,
            registered_at,
            last_heartbeat,
            metadata,
        })
    }
}

/// Fields written by a heartbeat
pub fn heartbeat_fields(now: DateTime<Utc>) -> HashMap<String, String> {
    HashMap::from([(FIELD_LAST_HEARTBEAT.to_string(), format_ts(now))])
}

pub fn heartbeat_from_fields(fields: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    fields.get(FIELD_LAST_HEARTBEAT).and_then(|raw| parse_ts(raw))
}

pub fn capability_from_fields(fields: &HashMap<String, String>) -> Option<&str> {
    fields.get(FIELD_CAPABILITY).map(String::as_str)
}

pub fn instance_from_fields(fields: &HashMap<String, String>) -> Option<&str> {
    fields.get(FIELD_INSTANCE_ID).map(String::as_str)
}

/// Mint a new, never-reused agent id
pub fn mint_agent_id(instance_id: &str, capability: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AGENT_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{instance_id}:{capability}:{}", suffix.to_ascii_lowercase())
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_boundaries() {
        let t = HealthThresholds::default();
        let now = Utc::now();

        assert_eq!(t.status_for(now, now), AgentHealth::Healthy);
        assert_eq!(
            t.status_for(now - Duration::seconds(60), now),
            AgentHealth::Healthy
        );
        assert_eq!(
            t.status_for(now - Duration::seconds(61), now),
            AgentHealth::Unhealthy
        );
        assert_eq!(
            t.status_for(now - Duration::seconds(120), now),
            AgentHealth::Unhealthy
        );
        assert_eq!(
            t.status_for(now - Duration::seconds(121), now),
            AgentHealth::Stale
        );
        // Skewed clock on the writer
        assert_eq!(
            t.status_for(now + Duration::seconds(5), now),
            AgentHealth::Healthy
        );
    }

    #[test]
    fn test_record_ttl_is_twice_stale_threshold() {
        assert_eq!(HealthThresholds::default().record_ttl(), Duration::seconds(240));
    }

    #[test]
    fn test_fields_decode_with_fresh_status() {
        let t = HealthThresholds::default();
        let now = Utc::now();
        let metadata = BTreeMap::from([("model".to_string(), "v2".to_string())]);
        let record = AgentRecord::new("i1:nba:x".into(), "nba", "i1", metadata, now);

        let fields = record.to_fields();
        let later = now + Duration::seconds(200);
        let decoded = AgentRecord::from_fields(&fields, &t, later).unwrap();

        assert_eq!(decoded.status, AgentHealth::Stale);
        assert_eq!(decoded.metadata.get("model").map(String::as_str), Some("v2"));
        assert_eq!(decoded.capability, "nba");
    }

    #[test]
    fn test_malformed_fields_decode_to_none() {
        let t = HealthThresholds::default();
        let mut fields = HashMap::new();
        fields.insert("agent_id".to_string(), "x".to_string());
        assert!(AgentRecord::from_fields(&fields, &t, Utc::now()).is_none());
        assert!(AgentRecord::from_fields(&HashMap::new(), &t, Utc::now()).is_none());
    }

    #[test]
    fn test_minted_ids_are_unique() {
        let a = mint_agent_id("i1", "baseball");
        let b = mint_agent_id("i1", "baseball");
        assert!(a.starts_with("i1:baseball:"));
        assert_ne!(a, b);
    }
}
