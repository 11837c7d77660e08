//! Concrete key naming for the registry store.

/// Key layout under one namespace:
///
/// - `{ns}:agent:{agent_id}` hash, one per agent record (self-expiring)
/// - `{ns}:capability:{capability}:agents` set of agent ids
/// - `{ns}:instance:{instance_id}:agents` set of agent ids
/// - `{ns}:capabilities` set of every capability name seen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn agent(&self, agent_id: &str) -> String {
        format!("{}:agent:{}", self.namespace, agent_id)
    }

    pub fn capability_members(&self, capability: &str) -> String {
        format!("{}:capability:{}:agents", self.namespace, capability)
    }

    pub fn instance_members(&self, instance_id: &str) -> String {
        format!("{}:instance:{}:agents", self.namespace, instance_id)
    }

    pub fn capability_index(&self) -> String {
        format!("{}:capabilities", self.namespace)
    }

    /// Scan pattern matching every agent record
    pub fn agent_pattern(&self) -> String {
        format!("{}:agent:*", self.namespace)
    }

    pub fn agent_id_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.namespace.as_str())?
            .strip_prefix(":agent:")
            .filter(|id| !id.is_empty())
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("bullpen")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_key_round_trip() {
        let keys = KeySpace::new("ns");
        let key = keys.agent("i1:baseball:abc");
        assert_eq!(key, "ns:agent:i1:baseball:abc");
        assert_eq!(keys.agent_id_from_key(&key), Some("i1:baseball:abc"));
        assert_eq!(keys.agent_id_from_key("ns:capabilities"), None);
        assert_eq!(keys.agent_id_from_key("other:agent:x"), None);
    }
}
