//! Topology data model.
//!
//! The same types describe user input (inside a [`Config`](crate::Config))
//! and compiled output (inside a [`Topology`]). Fields documented as
//! generated are filled in by the compiler or by the deployer at runtime and
//! are rejected when supplied by users.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

use ipnet::{Ipv4AddrRange, Ipv4Net};
use serde::{Deserialize, Serialize};

use meshbed_common::{Error, Result};

use crate::ids::{NodeId, ServiceId, DEFAULT_TENANCY};
use crate::images::Images;

/// Port every agent serves its HTTP API on
pub const AGENT_HTTP_PORT: u16 = 8500;
/// gRPC port of a client agent
pub const CLIENT_GRPC_PORT: u16 = 8502;
/// gRPC TLS port of a server agent
pub const SERVER_GRPC_TLS_PORT: u16 = 8503;
/// Public listener port a dataplane's first mesh service gets when unset
pub const DEFAULT_PUBLIC_LISTENER_PORT: u16 = 20000;
/// Bind address of upstream listeners when unset
pub const DEFAULT_UPSTREAM_ADDRESS: &str = "127.0.0.1";

/// Fully resolved graph produced by [`compile`](crate::compile)
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Topology {
    /// Random identity, stable across recompiles
    pub id: String,
    /// Topology-wide image defaults
    pub images: Images,
    /// Networks by name
    pub networks: BTreeMap<String, Network>,
    /// Clusters by name
    pub clusters: BTreeMap<String, Cluster>,
    /// Declared peerings, with links resolved
    pub peerings: Vec<Peering>,
}

impl Topology {
    /// Look up a cluster by name
    pub fn cluster(&self, name: &str) -> Result<&Cluster> {
        self.clusters
            .get(name)
            .ok_or_else(|| Error::config(format!("no such cluster: {name:?}")))
    }

    /// Mutable lookup of a cluster by name
    pub fn cluster_mut(&mut self, name: &str) -> Result<&mut Cluster> {
        self.clusters
            .get_mut(name)
            .ok_or_else(|| Error::config(format!("no such cluster: {name:?}")))
    }

    /// Look up a network by name
    pub fn network(&self, name: &str) -> Result<&Network> {
        self.networks
            .get(name)
            .ok_or_else(|| Error::config(format!("no such network: {name:?}")))
    }

    /// Record the subnet the provisioner picked for a network.
    ///
    /// Returns whether anything changed.
    pub fn digest_subnet(&mut self, network: &str, subnet: &str) -> Result<bool> {
        let net = self.networks.get_mut(network).ok_or_else(|| {
            Error::internal(format!("found output network that does not exist: {network}"))
        })?;
        net.set_subnet(subnet)
    }

    /// Record the forward proxy port of a network and copy it onto every
    /// address attached to it.
    ///
    /// Returns whether anything changed.
    pub fn digest_proxy_port(&mut self, network: &str, proxy_port: u16) -> Result<bool> {
        let net = self.networks.get_mut(network).ok_or_else(|| {
            Error::internal(format!("found output network that does not exist: {network}"))
        })?;
        if net.proxy_port == proxy_port {
            return Ok(false);
        }
        net.proxy_port = proxy_port;

        for cluster in self.clusters.values_mut() {
            for node in &mut cluster.nodes {
                for addr in &mut node.addresses {
                    if addr.network == network {
                        addr.proxy_port = proxy_port;
                    }
                }
            }
        }
        Ok(true)
    }

    /// Give every address the pool entry matching its node's index
    pub fn assign_ips(&mut self) -> Result<()> {
        let networks = &self.networks;
        for cluster in self.clusters.values_mut() {
            for node in &mut cluster.nodes {
                let index = node.index;
                for addr in &mut node.addresses {
                    let net = networks.get(&addr.network).ok_or_else(|| {
                        Error::config(format!("network {:?} does not exist", addr.network))
                    })?;
                    addr.ip_address = net.ip_by_index(index)?;
                }
            }
        }
        Ok(())
    }

    /// Every distinct image set used by a node, sorted
    pub fn node_images(&self) -> Vec<Images> {
        let mut out: Vec<Images> = self
            .clusters
            .values()
            .flat_map(|c| c.nodes.iter().map(|n| n.images.clone()))
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Kind of network a node can attach to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Cluster-local network
    #[default]
    Lan,
    /// Public network shared by clusters
    Wan,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Lan => write!(f, "lan"),
            NetworkType::Wan => write!(f, "wan"),
        }
    }
}

/// A container network
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Logical name
    pub name: String,
    /// Network type
    #[serde(default, rename = "type")]
    pub network_type: NetworkType,
    /// Generated container network name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_name: String,
    /// Generated subnet, assigned by the provisioner
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subnet: String,
    /// Addresses available to nodes, derived from the subnet
    #[serde(skip)]
    pub ip_pool: Vec<String>,
    /// Generated forward proxy port
    #[serde(default, skip_serializing_if = "is_zero")]
    pub proxy_port: u16,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl Network {
    /// Whether this is a cluster-local network
    pub fn is_local(&self) -> bool {
        self.network_type == NetworkType::Lan
    }

    /// Whether this is a public network
    pub fn is_public(&self) -> bool {
        self.network_type == NetworkType::Wan
    }

    /// Address for the node with global index `index`
    pub fn ip_by_index(&self, index: usize) -> Result<String> {
        self.ip_pool.get(index).cloned().ok_or_else(|| {
            Error::config(format!(
                "not enough ips on network {:?} to assign index {}: pool has {}",
                self.name,
                index,
                self.ip_pool.len()
            ))
        })
    }

    /// Set the subnet and enumerate its pool.
    ///
    /// The pool is every address of the masked prefix minus the first two.
    /// Returns whether anything changed.
    pub fn set_subnet(&mut self, subnet: &str) -> Result<bool> {
        if self.subnet == subnet {
            return Ok(false);
        }
        let prefix: Ipv4Net = subnet.parse().map_err(|e| {
            Error::config(format!("network {:?} has invalid subnet {subnet:?}: {e}", self.name))
        })?;
        let prefix = prefix.trunc();

        self.ip_pool = Ipv4AddrRange::new(prefix.network(), prefix.broadcast())
            .skip(2)
            .map(|ip| ip.to_string())
            .collect();
        self.subnet = subnet.to_string();
        Ok(true)
    }

    pub(crate) fn inherit_from(&mut self, existing: &Network) {
        self.subnet = existing.subnet.clone();
        self.ip_pool = existing.ip_pool.clone();
        self.proxy_port = existing.proxy_port;
    }
}

/// A partition and the namespaces inside it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition name
    pub name: String,
    /// Namespace names
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// A config entry applied to a cluster once its servers are up.
///
/// Only the identifying fields are modeled; everything else is passed
/// through to the control plane verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigEntry {
    /// Config entry kind, e.g. `service-defaults`
    pub kind: String,
    /// Config entry name
    pub name: String,
    /// Partition, empty for the default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// Namespace, empty for the default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Remaining kind-specific fields
    #[serde(flatten)]
    pub body: BTreeMap<String, serde_json::Value>,
}

/// A single control-plane install
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster name
    pub name: String,
    /// Network the cluster lives on; defaults to the cluster name
    #[serde(default)]
    pub network_name: String,
    /// Image overrides for this cluster
    #[serde(default)]
    pub images: Images,
    /// Whether to run enterprise components
    #[serde(default)]
    pub enterprise: bool,
    /// Nodes in declaration order
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Tenancy; after compile, every partition referenced anywhere, sorted
    #[serde(default)]
    pub partitions: Vec<Partition>,
    /// Datacenter name; defaults to the cluster name
    #[serde(default)]
    pub datacenter: String,
    /// Config entries created before agents start
    #[serde(default)]
    pub initial_config_entries: Vec<ConfigEntry>,
    /// Generated TLS volume name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_volume_name: String,
    /// Generated map of local peer name to peering side
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peerings: BTreeMap<String, PeerCluster>,
}

impl Cluster {
    /// Whether the partition exists in this cluster
    pub fn has_partition(&self, partition: &str) -> bool {
        self.partitions.iter().any(|p| p.name == partition)
    }

    /// Partitions to scope cluster-wide queries to; a single default scope
    /// on non-enterprise clusters
    pub fn partition_names(&self) -> Vec<String> {
        if !self.enterprise {
            return vec![String::new()];
        }
        self.partitions.iter().map(|p| p.name.clone()).collect()
    }

    /// Enabled servers, sorted
    pub fn server_nodes(&self) -> Vec<&Node> {
        self.sorted_nodes()
            .into_iter()
            .filter(|n| n.is_server() && !n.disabled)
            .collect()
    }

    /// Enabled server whose local address matches the host of `addr`
    pub fn server_by_addr(&self, addr: &str) -> Option<&Node> {
        let host = addr.rsplit_once(':').map(|(h, _)| h)?;
        self.nodes
            .iter()
            .filter(|n| n.is_server() && !n.disabled)
            .find(|n| n.local_address() == Some(host))
    }

    /// First enabled server whose API port has been exposed
    pub fn first_server(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.is_server() && !n.disabled && n.exposed_port(AGENT_HTTP_PORT) > 0)
    }

    /// First enabled client agent
    pub fn first_client(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.kind == NodeKind::Client && !n.disabled)
    }

    /// Enabled nodes in declaration order
    pub fn active_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| !n.disabled).collect()
    }

    /// Servers first, then by partition, then by name
    pub fn sorted_nodes(&self) -> Vec<&Node> {
        let mut out: Vec<&Node> = self.nodes.iter().collect();
        out.sort_by(|a, b| {
            a.kind
                .sort_rank()
                .cmp(&b.kind.sort_rank())
                .then_with(|| a.partition.cmp(&b.partition))
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }

    /// Look up a node by id
    pub fn node_by_id(&self, id: &NodeId) -> Option<&Node> {
        let mut id = id.clone();
        id.normalize();
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Mutable lookup of a node by id
    pub fn node_by_id_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let mut id = id.clone();
        id.normalize();
        self.nodes.iter_mut().find(|n| n.id() == id)
    }

    /// Look up a service on a node
    pub fn service_by_id(&self, node: &NodeId, service: &ServiceId) -> Option<&Service> {
        self.node_by_id(node)?.service_by_id(service)
    }
}

/// What a node runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Control-plane server agent
    Server,
    /// Client agent hosting services
    Client,
    /// Agentless node hosting one service behind a dataplane
    Dataplane,
}

impl NodeKind {
    fn sort_rank(self) -> u8 {
        match self {
            NodeKind::Server => 1,
            NodeKind::Client | NodeKind::Dataplane => 2,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Server => write!(f, "server"),
            NodeKind::Client => write!(f, "client"),
            NodeKind::Dataplane => write!(f, "dataplane"),
        }
    }
}

/// A container (pod) in a cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// What the node runs
    pub kind: NodeKind,
    /// Partition; `default` after compile
    #[serde(default)]
    pub partition: String,
    /// Logical name
    pub name: String,
    /// Image overrides for this node; the selected set after compile
    #[serde(default)]
    pub images: Images,
    /// Disabled nodes are torn down but keep their identity
    #[serde(default)]
    pub disabled: bool,
    /// Network attachments; defaults to the cluster network
    #[serde(default)]
    pub addresses: Vec<Address>,
    /// Services hosted on this node
    #[serde(default)]
    pub services: Vec<Service>,
    /// Node metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// Extra environment for the agent process
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Generated: owning cluster name
    #[serde(default)]
    pub cluster: String,
    /// Generated: owning datacenter name
    #[serde(default)]
    pub datacenter: String,
    /// Generated: global, monotonically assigned index
    #[serde(default)]
    pub index: usize,
    /// Generated: TLS certificate file prefix
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_cert_prefix: String,
    /// Generated: container name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,

    /// Internal port to exposed host port; keys from compile, values from
    /// the provisioner (0 until exposed)
    #[serde(default, skip_deserializing)]
    pub(crate) used_ports: BTreeMap<u16, u16>,
}

impl Node {
    /// Create an empty node of `kind`
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            partition: String::new(),
            name: name.into(),
            images: Images::default(),
            disabled: false,
            addresses: Vec::new(),
            services: Vec::new(),
            meta: BTreeMap::new(),
            env: Vec::new(),
            cluster: String::new(),
            datacenter: String::new(),
            index: 0,
            tls_cert_prefix: String::new(),
            container_name: String::new(),
            used_ports: BTreeMap::new(),
        }
    }

    /// Identity within the cluster
    pub fn id(&self) -> NodeId {
        NodeId::new(self.name.clone(), &self.partition)
    }

    /// Identity of this node's catalog entry
    pub fn catalog_id(&self) -> NodeId {
        NodeId::new(self.pod_name(), &self.partition)
    }

    /// Name of the pod container holding the node's network namespace
    pub fn pod_name(&self) -> String {
        format!("{}-pod", self.container_name)
    }

    /// Server or client agent
    pub fn is_agent(&self) -> bool {
        matches!(self.kind, NodeKind::Server | NodeKind::Client)
    }

    /// Server agent
    pub fn is_server(&self) -> bool {
        self.kind == NodeKind::Server
    }

    /// Agentless dataplane
    pub fn is_dataplane(&self) -> bool {
        self.kind == NodeKind::Dataplane
    }

    /// IP of the first local address, once assigned
    pub fn local_address(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.is_local())
            .map(|a| a.ip_address.as_str())
            .filter(|ip| !ip.is_empty())
    }

    /// Proxy port of the local network, once known
    pub fn local_proxy_port(&self) -> Option<u16> {
        self.addresses
            .iter()
            .find(|a| a.is_local())
            .map(|a| a.proxy_port)
            .filter(|p| *p > 0)
    }

    /// IP of the public address, once assigned
    pub fn public_address(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.is_public())
            .map(|a| a.ip_address.as_str())
            .filter(|ip| !ip.is_empty())
    }

    /// Host port `internal` is exposed on, or 0
    pub fn exposed_port(&self, internal: u16) -> u16 {
        if internal == 0 {
            return 0;
        }
        self.used_ports.get(&internal).copied().unwrap_or(0)
    }

    /// Every internal port the node uses, ascending
    pub fn sorted_ports(&self) -> Vec<u16> {
        self.used_ports.keys().copied().collect()
    }

    /// Record exposed host ports reported by the provisioner.
    ///
    /// Every port the node uses must be present. Returns whether anything
    /// changed.
    pub fn digest_exposed_ports(&mut self, ports: &BTreeMap<u16, u16>) -> Result<bool> {
        if &self.used_ports == ports {
            return Ok(false);
        }
        if let Some(missing) = self.used_ports.keys().find(|p| !ports.contains_key(p)) {
            return Err(Error::internal_with_context(
                "digest_exposed_ports",
                format!(
                    "cluster {:?} node {:?} port {} not found in exposed list",
                    self.cluster, self.name, missing
                ),
            ));
        }
        for (internal, exposed) in self.used_ports.iter_mut() {
            *exposed = ports.get(internal).copied().unwrap_or(0);
        }
        for svc in &mut self.services {
            svc.digest_exposed_ports(&self.used_ports);
        }
        Ok(true)
    }

    /// Services with mesh gateways last, otherwise by id
    pub fn sorted_services(&self) -> Vec<&Service> {
        let mut out: Vec<&Service> = self.services.iter().collect();
        out.sort_by(|a, b| {
            a.is_mesh_gateway
                .cmp(&b.is_mesh_gateway)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Look up a hosted service by id
    pub fn service_by_id(&self, id: &ServiceId) -> Option<&Service> {
        let mut id = id.clone();
        id.normalize();
        self.services.iter().find(|s| s.id == id)
    }

    pub(crate) fn inherit_from(&mut self, existing: &Node) {
        self.tls_cert_prefix = existing.tls_cert_prefix.clone();

        // ports of removed services are dropped, not carried forward
        for (port, exposed) in self.used_ports.iter_mut() {
            if let Some(prev) = existing.used_ports.get(port) {
                *exposed = *prev;
            }
        }
    }

    /// Used ports minus those owned by services absent from `other`
    fn stable_ports(&self, other: &Node) -> BTreeSet<u16> {
        let transient: BTreeSet<u16> = self
            .services
            .iter()
            .filter(|s| !other.services.iter().any(|o| o.id == s.id))
            .flat_map(|s| s.ports())
            .collect();
        self.used_ports
            .keys()
            .filter(|p| !transient.contains(p))
            .copied()
            .collect()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id().fmt(f)
    }
}

/// A node's attachment to a network
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Network name
    pub network: String,
    /// Generated: copy of the network type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub network_type: Option<NetworkType>,
    /// Generated: copy of the container network name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_network_name: String,
    /// Generated: assigned IP
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    /// Generated: copy of the network proxy port
    #[serde(default, skip_serializing_if = "is_zero")]
    pub proxy_port: u16,
}

impl Address {
    /// Address on `network`
    pub fn on(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ..Default::default()
        }
    }

    /// Whether the address is on a local network
    pub fn is_local(&self) -> bool {
        self.network_type != Some(NetworkType::Wan)
    }

    /// Whether the address is on a public network
    pub fn is_public(&self) -> bool {
        self.network_type == Some(NetworkType::Wan)
    }

    fn inherit_from(&mut self, existing: &Address) {
        self.ip_address = existing.ip_address.clone();
        self.proxy_port = existing.proxy_port;
    }
}

/// A workload hosted on a node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Identity
    pub id: ServiceId,
    /// Workload image; not needed for mesh gateways
    #[serde(default)]
    pub image: String,
    /// Port the workload listens on
    #[serde(default)]
    pub port: u16,
    /// Generated: host port `port` is exposed on
    #[serde(default, skip_serializing_if = "is_zero")]
    pub exposed_port: u16,
    /// Service metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// URL for an HTTP GET health check
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub check_http: String,
    /// Address for a TCP health check
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub check_tcp: String,
    /// Envoy admin port; required unless mesh is disabled
    #[serde(default)]
    pub envoy_admin_port: u16,
    /// Generated: host port the admin port is exposed on
    #[serde(default, skip_serializing_if = "is_zero")]
    pub exposed_envoy_admin_port: u16,
    /// Sidecar public listener port, dataplane only
    #[serde(default, skip_serializing_if = "is_zero")]
    pub envoy_public_listener_port: u16,
    /// Override container command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Extra container environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Run without a sidecar
    #[serde(default)]
    pub disable_service_mesh: bool,
    /// Run as a mesh gateway
    #[serde(default)]
    pub is_mesh_gateway: bool,
    /// Upstreams reached through the sidecar
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<Upstream>,
    /// Generated: id of the hosting node
    #[serde(default)]
    pub node: NodeId,
}

impl Service {
    /// Service identity with an image and port, mesh enabled
    pub fn new(id: ServiceId, image: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            image: image.into(),
            port,
            ..Default::default()
        }
    }

    /// Every port the service occupies on its node
    pub fn ports(&self) -> Vec<u16> {
        let mut out = Vec::new();
        for p in [self.port, self.envoy_admin_port, self.envoy_public_listener_port] {
            if p > 0 {
                out.push(p);
            }
        }
        out.extend(self.upstreams.iter().map(|u| u.local_port).filter(|p| *p > 0));
        out
    }

    /// Whether a health check is configured
    pub fn has_check(&self) -> bool {
        !self.check_tcp.is_empty() || !self.check_http.is_empty()
    }

    /// Check the service's own invariants
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.name.is_empty() {
            return Err("service name is required".into());
        }
        if self.image.is_empty() && !self.is_mesh_gateway {
            return Err("service image is required".into());
        }
        if self.port == 0 {
            return Err("service has invalid port".into());
        }
        if self.disable_service_mesh && self.is_mesh_gateway {
            return Err("cannot disable service mesh and still run a mesh gateway".into());
        }
        if self.disable_service_mesh && !self.upstreams.is_empty() {
            return Err("cannot disable service mesh and configure upstreams".into());
        }

        if self.disable_service_mesh {
            if self.envoy_admin_port != 0 {
                return Err("cannot use envoy admin port without a service mesh".into());
            }
        } else if self.envoy_admin_port == 0 {
            return Err("envoy admin port is required".into());
        }

        for u in &self.upstreams {
            if u.id.name.is_empty() {
                return Err("upstream service name is required".into());
            }
            if u.local_port == 0 {
                return Err("upstream local port is required".into());
            }
            if !u.local_address.is_empty() && u.local_address.parse::<IpAddr>().is_err() {
                return Err(format!("upstream local address is invalid: {}", u.local_address));
            }
        }
        Ok(())
    }

    fn digest_exposed_ports(&mut self, ports: &BTreeMap<u16, u16>) {
        self.exposed_port = ports.get(&self.port).copied().unwrap_or(0);
        self.exposed_envoy_admin_port = if self.envoy_admin_port > 0 {
            ports.get(&self.envoy_admin_port).copied().unwrap_or(0)
        } else {
            0
        };
    }

    fn inherit_from(&mut self, existing: &Service) {
        self.exposed_port = existing.exposed_port;
        self.exposed_envoy_admin_port = existing.exposed_envoy_admin_port;
    }
}

/// A destination a service reaches through its sidecar
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    /// Target service
    pub id: ServiceId,
    /// Bind address of the local listener
    #[serde(default)]
    pub local_address: String,
    /// Bind port of the local listener
    #[serde(default)]
    pub local_port: u16,
    /// Local peer name when the target lives in a peered cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    /// Generated: cluster the target lives in
    #[serde(default)]
    pub cluster: String,
    /// Generated: the remote side of the peering, when `peer` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peering: Option<PeerCluster>,
}

/// One side of a peering
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCluster {
    /// Cluster name
    pub name: String,
    /// Partition; `default` after compile
    #[serde(default)]
    pub partition: String,
    /// What this side calls the peering; generated when empty
    #[serde(default)]
    pub peer_name: String,
    /// Generated: un-linked copy of the opposite side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Box<PeerCluster>>,
}

impl PeerCluster {
    /// Side of a peering in `cluster`'s default partition
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            name: cluster.into(),
            partition: DEFAULT_TENANCY.to_string(),
            ..Default::default()
        }
    }

    fn unlinked(&self) -> PeerCluster {
        PeerCluster {
            link: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for PeerCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.partition)
    }
}

/// A peering between two clusters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peering {
    /// Side that establishes the peering with a token
    pub dialing: PeerCluster,
    /// Side that generates the token
    pub accepting: PeerCluster,
}

impl Peering {
    /// Point each side's link at an un-linked copy of the other
    pub(crate) fn link(&mut self) {
        let dialing = self.dialing.unlinked();
        let accepting = self.accepting.unlinked();
        self.dialing.link = Some(Box::new(accepting));
        self.accepting.link = Some(Box::new(dialing));
    }
}

impl fmt::Display for Peering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})->({})", self.dialing, self.accepting)
    }
}

/// Carry runtime state of `prev` nodes into `curr`, rejecting edits to
/// anything fixed once a node exists.
pub(crate) fn inherit_nodes(
    cluster: &str,
    prev: &[Node],
    curr: &mut [Node],
) -> Result<()> {
    const HINT: &str = "use the disabled field if you want to ignore a node";

    for (prev_pos, old) in prev.iter().enumerate() {
        let old_id = old.id();
        let pos = curr.iter().position(|n| n.id() == old_id).ok_or_else(|| {
            Error::immutable(cluster, format!("node {:?} has vanished; {HINT}", old_id.to_string()))
        })?;
        if pos != prev_pos {
            return Err(Error::immutable(
                cluster,
                format!(
                    "node {:?} has been shuffled {} -> {}; {HINT}",
                    old_id.to_string(),
                    prev_pos,
                    pos
                ),
            ));
        }

        let node = &mut curr[pos];
        let same_ports = node.stable_ports(old) == old.stable_ports(node);
        if node.kind != old.kind
            || node.partition != old.partition
            || node.name != old.name
            || node.index != old.index
            || node.addresses.len() != old.addresses.len()
            || !same_ports
        {
            return Err(Error::immutable(
                cluster,
                format!("cannot edit some node fields for {:?}", old_id.to_string()),
            ));
        }

        node.inherit_from(old);

        for (addr, old_addr) in node.addresses.iter_mut().zip(&old.addresses) {
            if addr.network != old_addr.network {
                return Err(Error::immutable(
                    cluster,
                    format!("addresses were shuffled for node {:?}", old_id.to_string()),
                ));
            }
            if addr.network_type != old_addr.network_type {
                return Err(Error::immutable(
                    cluster,
                    format!("cannot edit some address fields for {:?}", old_id.to_string()),
                ));
            }
            addr.inherit_from(old_addr);
        }

        for old_svc in &old.services {
            // removed services are fine
            let Some(svc) = node.services.iter_mut().find(|s| s.id == old_svc.id) else {
                continue;
            };
            if svc.port != old_svc.port
                || svc.envoy_admin_port != old_svc.envoy_admin_port
                || svc.envoy_public_listener_port != old_svc.envoy_public_listener_port
                || svc.command != old_svc.command
                || svc.env != old_svc.env
            {
                return Err(Error::immutable(
                    cluster,
                    format!("cannot edit some service fields for {:?}", svc.id.to_string()),
                ));
            }
            svc.inherit_from(old_svc);
        }
    }
    Ok(())
}
