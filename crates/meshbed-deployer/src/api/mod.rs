//! Control-plane API boundary.
//!
//! [`ClusterApi`] is the subset of the control-plane HTTP API the deployment
//! pipeline uses. Clients are bound to one agent and one ACL token; changing
//! the token means building a new client through a [`ClusterApiFactory`].

mod http;
mod types;

pub use http::{HttpClusterApi, HttpClusterApiFactory};
pub use types::*;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use meshbed_common::Error;
use meshbed_topology::{ConfigEntry, NodeId, Topology};

/// Control-plane operations used while launching a topology
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Bootstrap the ACL system with a caller-chosen management secret
    async fn acl_bootstrap(&self, secret: &str) -> Result<AclToken, Error>;

    /// Read the token the client authenticates with
    async fn read_self_token(&self) -> Result<AclToken, Error>;

    /// List tokens in a partition; secrets may be omitted
    async fn list_tokens(&self, partition: &str) -> Result<Vec<AclToken>, Error>;

    /// Read a token, including its secret
    async fn read_token(&self, accessor_id: &str, partition: &str) -> Result<AclToken, Error>;

    /// Create a token
    async fn create_token(&self, token: &AclToken) -> Result<AclToken, Error>;

    /// Replace a token identified by its accessor id
    async fn update_token(&self, token: &AclToken) -> Result<AclToken, Error>;

    /// Read a policy by name; `None` when the server reports it missing
    async fn read_policy_by_name(
        &self,
        name: &str,
        partition: &str,
    ) -> Result<Option<AclPolicy>, Error>;

    /// Create a policy
    async fn create_policy(&self, policy: &AclPolicy) -> Result<AclPolicy, Error>;

    /// Replace a policy identified by its id
    async fn update_policy(&self, policy: &AclPolicy) -> Result<AclPolicy, Error>;

    /// Write a node, service or check directly to the catalog
    async fn catalog_register(&self, registration: &CatalogRegistration) -> Result<(), Error>;

    /// Remove a node or service from the catalog
    async fn catalog_deregister(&self, deregistration: &CatalogDeregistration)
        -> Result<(), Error>;

    /// List catalog nodes in a partition
    async fn catalog_nodes(&self, partition: &str) -> Result<Vec<CatalogNode>, Error>;

    /// Register a service with the agent the client talks to
    async fn agent_service_register(
        &self,
        registration: &AgentServiceRegistration,
    ) -> Result<(), Error>;

    /// Ask the agent to join another agent over the LAN
    async fn agent_join(&self, address: &str) -> Result<(), Error>;

    /// Write a key
    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Read a key's raw value; `None` when the key does not exist
    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Take a snapshot of the server state
    async fn snapshot_save(&self) -> Result<Vec<u8>, Error>;

    /// Replace the server state with a snapshot taken by [`Self::snapshot_save`]
    async fn snapshot_restore(&self, snapshot: &[u8]) -> Result<(), Error>;

    /// List admin partitions
    async fn list_partitions(&self) -> Result<Vec<AdminPartition>, Error>;

    /// Create an admin partition
    async fn create_partition(&self, partition: &AdminPartition) -> Result<(), Error>;

    /// List namespaces in a partition
    async fn list_namespaces(&self, partition: &str) -> Result<Vec<Namespace>, Error>;

    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error>;

    /// Create or replace a config entry
    async fn set_config_entry(&self, entry: &ConfigEntry) -> Result<(), Error>;

    /// Generate a peering token on the accepting side
    async fn generate_peering_token(&self, request: &PeeringTokenRequest)
        -> Result<String, Error>;

    /// Establish a peering on the dialing side
    async fn establish_peering(&self, request: &PeeringEstablishRequest) -> Result<(), Error>;

    /// Read a peering by local name; `None` when it does not exist
    async fn read_peering(&self, name: &str, partition: &str)
        -> Result<Option<PeeringInfo>, Error>;

    /// Address (`ip:port`) of the current raft leader, or empty
    async fn status_leader(&self) -> Result<String, Error>;
}

/// Builds [`ClusterApi`] clients bound to a token
#[cfg_attr(test, automock)]
pub trait ClusterApiFactory: Send + Sync {
    /// Client for cluster-wide operations, sent to the cluster's first server
    fn cluster_client(
        &self,
        topology: &Topology,
        cluster: &str,
        token: &str,
    ) -> Result<Arc<dyn ClusterApi>, Error>;

    /// Client sent to the agent running on one node
    fn agent_client(
        &self,
        topology: &Topology,
        cluster: &str,
        node: &NodeId,
        token: &str,
    ) -> Result<Arc<dyn ClusterApi>, Error>;
}
