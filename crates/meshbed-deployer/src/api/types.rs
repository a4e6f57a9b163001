//! Request and response bodies of the control-plane HTTP API.
//!
//! Field names follow the API's PascalCase JSON. Collections tolerate
//! `null` as well as a missing key.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// An ACL token
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclToken {
    /// Public identifier
    #[serde(rename = "AccessorID", default, skip_serializing_if = "String::is_empty")]
    pub accessor_id: String,
    /// Secret presented in requests
    #[serde(rename = "SecretID", default, skip_serializing_if = "String::is_empty")]
    pub secret_id: String,
    /// Free-form description; used as the lookup key by upserts
    #[serde(default)]
    pub description: String,
    /// Policies linked by id or name
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub policies: Vec<AclLink>,
    /// Service identity grants
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub service_identities: Vec<ServiceIdentity>,
    /// Node identity grants
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub node_identities: Vec<NodeIdentity>,
    /// Whether the token is local to its datacenter
    #[serde(default)]
    pub local: bool,
    /// Partition the token lives in; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// Namespace the token lives in; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Reference from a token to a policy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclLink {
    /// Policy id
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Policy name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl AclLink {
    /// Link a policy by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
        }
    }
}

/// Grant of the standard permissions of a service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceIdentity {
    /// Service the identity is for
    pub service_name: String,
    /// Datacenters the grant applies in; all when empty
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub datacenters: Vec<String>,
}

/// Grant of the standard permissions of a node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeIdentity {
    /// Catalog node name
    pub node_name: String,
    /// Datacenter the node registers in
    pub datacenter: String,
}

/// An ACL policy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclPolicy {
    /// Identifier, assigned on create
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Unique name; used as the lookup key by upserts
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Rules in the ACL rule language
    #[serde(default)]
    pub rules: String,
    /// Partition the policy lives in; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// Namespace the policy lives in; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// An admin partition
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdminPartition {
    /// Partition name
    pub name: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A namespace within a partition
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Namespace {
    /// Namespace name
    pub name: String,
    /// Owning partition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A node as listed by the catalog
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogNode {
    /// Node name
    pub node: String,
    /// Node address
    #[serde(default)]
    pub address: String,
    /// Addresses per network kind; filled in by the agent's first sync
    #[serde(default, deserialize_with = "null_as_default")]
    pub tagged_addresses: BTreeMap<String, String>,
    /// Node metadata
    #[serde(default, deserialize_with = "null_as_default")]
    pub meta: BTreeMap<String, String>,
    /// Partition the node is registered in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

/// Address and port a service is reachable on
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceAddress {
    /// IP address
    pub address: String,
    /// Port
    pub port: u16,
}

/// Mesh gateway routing mode
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeshGatewayConfig {
    /// `local`, `remote` or `none`
    #[serde(default)]
    pub mode: String,
}

/// Upstream of a sidecar proxy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpstreamConfig {
    /// Peer the destination is imported from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_peer: String,
    /// Destination service name
    pub destination_name: String,
    /// Destination namespace; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_namespace: String,
    /// Destination partition; enterprise only, never with a peer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_partition: String,
    /// Address the local listener binds to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_bind_address: String,
    /// Port the local listener binds to
    pub local_bind_port: u16,
}

/// Proxy settings of a connect proxy or gateway registration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceProxy {
    /// Service the proxy fronts
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_service_name: String,
    /// Service instance the proxy fronts
    #[serde(
        rename = "DestinationServiceID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub destination_service_id: String,
    /// Port of the fronted service
    #[serde(default, skip_serializing_if = "is_zero")]
    pub local_service_port: u16,
    /// Upstream listeners
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub upstreams: Vec<UpstreamConfig>,
    /// Opaque proxy configuration
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Mesh gateway mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_gateway: Option<MeshGatewayConfig>,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

/// A service instance as written to the catalog
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogService {
    /// Empty for a typical service, otherwise `connect-proxy` or `mesh-gateway`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Instance id
    #[serde(rename = "ID")]
    pub id: String,
    /// Service name
    pub service: String,
    /// Port
    pub port: u16,
    /// Address; the node address when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    /// Service metadata
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub meta: BTreeMap<String, String>,
    /// Addresses per network kind
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub tagged_addresses: BTreeMap<String, ServiceAddress>,
    /// Proxy settings for proxies and gateways
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ServiceProxy>,
    /// Partition; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// Namespace; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// How a health check reaches its target
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheckDefinition {
    /// `host:port` to dial
    #[serde(rename = "TCP", default, skip_serializing_if = "String::is_empty")]
    pub tcp: String,
    /// URL to request
    #[serde(rename = "HTTP", default, skip_serializing_if = "String::is_empty")]
    pub http: String,
    /// HTTP method
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Check interval, as a duration string
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
    /// Check timeout, as a duration string
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
}

/// A health check as written to the catalog
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    /// Node the check belongs to
    pub node: String,
    /// Check id, unique per node
    #[serde(rename = "CheckID")]
    pub check_id: String,
    /// Display name
    pub name: String,
    /// `passing`, `warning` or `critical`
    pub status: String,
    /// Service instance the check is attached to
    #[serde(rename = "ServiceID", default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    /// Name of the service the check is attached to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    /// Check definition
    #[serde(default)]
    pub definition: HealthCheckDefinition,
    /// Partition; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// Namespace; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Direct catalog write for a node and optionally one of its services
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogRegistration {
    /// Node name
    pub node: String,
    /// Node address
    pub address: String,
    /// Node addresses per network kind
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub tagged_addresses: BTreeMap<String, String>,
    /// Node metadata
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub node_meta: BTreeMap<String, String>,
    /// Service to register on the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<CatalogService>,
    /// Check to register on the node or service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<HealthCheck>,
    /// Leave the node entry untouched and only write the service
    #[serde(default)]
    pub skip_node_update: bool,
    /// Partition; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

/// Direct catalog removal of a node or one of its services
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogDeregistration {
    /// Node name
    pub node: String,
    /// Service instance to remove; the whole node when empty
    #[serde(rename = "ServiceID", default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    /// Partition; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// Namespace; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Check attached to an agent service registration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceCheck {
    /// Display name
    pub name: String,
    /// `host:port` to dial
    #[serde(rename = "TCP", default, skip_serializing_if = "String::is_empty")]
    pub tcp: String,
    /// URL to request
    #[serde(rename = "HTTP", default, skip_serializing_if = "String::is_empty")]
    pub http: String,
    /// HTTP method
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Check interval
    pub interval: String,
    /// Check timeout
    pub timeout: String,
}

/// Proxy settings of a sidecar registered alongside its service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SidecarProxy {
    /// Upstream listeners
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub upstreams: Vec<UpstreamConfig>,
}

/// Sidecar registered alongside a service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SidecarService {
    /// Proxy settings
    pub proxy: SidecarProxy,
}

/// Service mesh settings of an agent service registration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceConnect {
    /// Sidecar to register with the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_service: Option<SidecarService>,
}

/// Service registration sent to a local agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceRegistration {
    /// Instance id
    #[serde(rename = "ID")]
    pub id: String,
    /// Service name
    pub name: String,
    /// Port
    pub port: u16,
    /// Service metadata
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub meta: BTreeMap<String, String>,
    /// Health check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
    /// Service mesh settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<AgentServiceConnect>,
    /// Partition; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// Namespace; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Request for a peering token on the accepting side
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeeringTokenRequest {
    /// Name the accepting side knows the dialer by
    pub peer_name: String,
    /// Partition the peering lives in; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

/// Response carrying a peering token
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeeringTokenResponse {
    /// Opaque token to hand to the dialing side
    pub peering_token: String,
}

/// Request to establish a peering on the dialing side
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeeringEstablishRequest {
    /// Name the dialing side knows the acceptor by
    pub peer_name: String,
    /// Token generated by the accepting side
    pub peering_token: String,
    /// Partition the peering lives in; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

/// Lifecycle state of a peering
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeeringState {
    /// Token generated, no connection yet
    Pending,
    /// Dialer is connecting
    Establishing,
    /// Connected and replicating
    Active,
    /// Connection is failing
    Failing,
    /// Being deleted
    Deleting,
    /// Torn down
    Terminated,
    /// Any state this client does not know
    #[default]
    #[serde(other)]
    Undefined,
}

/// A peering as read back from one side
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeeringInfo {
    /// Identifier
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Local name of the peer
    pub name: String,
    /// Current state
    #[serde(default)]
    pub state: PeeringState,
    /// Partition; enterprise only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}
