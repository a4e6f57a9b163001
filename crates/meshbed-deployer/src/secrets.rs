//! Per-cluster secret storage
//!
//! Holds the bootstrap token, agent recovery token and gossip key of each
//! cluster, plus the ACL secret of every agent and service token created
//! during a launch. Reads of a secret that was never saved return an empty
//! string.

use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use rand::RngCore;

use meshbed_topology::{NodeId, ServiceId};

/// Names of the generic per-cluster secrets
pub mod keys {
    /// Initial management token, also used to bootstrap ACLs
    pub const BOOTSTRAP_TOKEN: &str = "bootstrap-token";
    /// Agent recovery token, used to join servers before ACLs work
    pub const AGENT_RECOVERY: &str = "agent-recovery";
    /// Gossip encryption key
    pub const GOSSIP_KEY: &str = "gossip";
}

/// Storage for deployment secrets
#[cfg_attr(test, automock)]
pub trait SecretStore: Send + Sync {
    /// Save a generic secret for a cluster
    fn save_generic(&self, cluster: &str, name: &str, value: &str);

    /// Read a generic secret, or empty if unset
    fn read_generic(&self, cluster: &str, name: &str) -> String;

    /// Save the ACL secret of a node's agent token
    fn save_agent_token(&self, cluster: &str, node: &NodeId, value: &str);

    /// Read the ACL secret of a node's agent token, or empty if unset
    fn read_agent_token(&self, cluster: &str, node: &NodeId) -> String;

    /// Save the ACL secret of a service token
    fn save_service_token(&self, cluster: &str, service: &ServiceId, value: &str);

    /// Read the ACL secret of a service token, or empty if unset
    fn read_service_token(&self, cluster: &str, service: &ServiceId) -> String;
}

/// Process-local [`SecretStore`]
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: DashMap<String, String>,
}

impl MemorySecretStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Whether nothing has been stored
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    fn save(&self, key: String, value: &str) {
        self.secrets.insert(key, value.to_string());
    }

    fn read(&self, key: &str) -> String {
        self.secrets
            .get(key)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }
}

impl SecretStore for MemorySecretStore {
    fn save_generic(&self, cluster: &str, name: &str, value: &str) {
        self.save(generic_key(cluster, name), value);
    }

    fn read_generic(&self, cluster: &str, name: &str) -> String {
        self.read(&generic_key(cluster, name))
    }

    fn save_agent_token(&self, cluster: &str, node: &NodeId, value: &str) {
        self.save(agent_key(cluster, node), value);
    }

    fn read_agent_token(&self, cluster: &str, node: &NodeId) -> String {
        self.read(&agent_key(cluster, node))
    }

    fn save_service_token(&self, cluster: &str, service: &ServiceId, value: &str) {
        self.save(service_key(cluster, service), value);
    }

    fn read_service_token(&self, cluster: &str, service: &ServiceId) -> String {
        self.read(&service_key(cluster, service))
    }
}

fn generic_key(cluster: &str, name: &str) -> String {
    format!("{cluster}/generic/{name}")
}

fn agent_key(cluster: &str, node: &NodeId) -> String {
    let mut node = node.clone();
    node.normalize();
    format!("{cluster}/agent/{}", node.acl_string())
}

fn service_key(cluster: &str, service: &ServiceId) -> String {
    let mut service = service.clone();
    service.normalize();
    format!("{cluster}/service/{}", service.acl_string())
}

/// Random UUID suitable as an ACL secret
pub fn generate_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Random 32-byte gossip encryption key, base64 encoded
pub fn generate_gossip_key() -> String {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    STANDARD.encode(raw)
}
