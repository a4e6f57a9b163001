//! Compiling a [`Config`] into a [`Topology`].
//!
//! [`compile`] validates every invariant of the description and fills in the
//! generated fields: container names, global node indexes, used ports,
//! tenancy, peering links and upstream destinations. [`recompile`] does the
//! same against a previously compiled topology and carries runtime state
//! (subnets, proxy ports, IPs, exposed ports, TLS material) forward, refusing
//! any edit a running deployment cannot absorb.
//!
//! The caller's config is never mutated.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use tracing::{debug, warn};

use meshbed_common::{Error, Result, CONTAINER_PREFIX};

use crate::config::Config;
use crate::ids::{namespace_or_default, partition_or_default, validate_label, DEFAULT_TENANCY};
use crate::images::Images;
use crate::topology::{
    inherit_nodes, Address, Cluster, Network, NetworkType, Node, Partition, PeerCluster, Peering,
    Topology, AGENT_HTTP_PORT, CLIENT_GRPC_PORT, DEFAULT_PUBLIC_LISTENER_PORT,
    DEFAULT_UPSTREAM_ADDRESS, SERVER_GRPC_TLS_PORT,
};

/// Compile a fresh topology with a new random id.
pub fn compile(config: &Config) -> Result<Topology> {
    compile_inner(config.clone(), None)
}

/// Compile `config` as an edit of `prev`, keeping its id and runtime state.
pub fn recompile(config: &Config, prev: &Topology) -> Result<Topology> {
    compile_inner(config.clone(), Some(prev))
}

fn compile_inner(raw: Config, prev: Option<&Topology>) -> Result<Topology> {
    let id = match prev {
        Some(prev) => prev.id.clone(),
        None => new_topology_id(),
    };

    let images = Images::defaults().override_with(&raw.images);
    if !images.consul.is_empty() {
        return Err(Error::config("topology.images.consul cannot be set at this level"));
    }

    let networks = compile_networks(raw.networks, &id)?;

    if raw.clusters.is_empty() {
        return Err(Error::config("topology.clusters is empty"));
    }

    let mut clusters = BTreeMap::new();
    // shared across clusters so networks used by several clusters never
    // hand out the same address twice
    let mut next_index = 0usize;
    let mut peer_refs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for c in raw.clusters {
        if clusters.contains_key(&c.name) {
            return Err(Error::config(format!(
                "cannot have two clusters with the same name {:?}; use unique names and override the datacenter field if that's what you want",
                c.name
            )));
        }
        let mut refs = BTreeSet::new();
        let cluster = compile_cluster(c, &id, &images, &networks, &mut next_index, &mut refs)?;
        peer_refs.insert(cluster.name.clone(), refs);
        clusters.insert(cluster.name.clone(), cluster);
    }

    let peerings = resolve_peerings(raw.peerings, &mut clusters, &mut peer_refs)?;
    stamp_upstreams(&mut clusters)?;

    let mut topology = Topology {
        id,
        images,
        networks,
        clusters,
        peerings,
    };

    if let Some(prev) = prev {
        inherit_from_previous(&mut topology, prev)?;
    }

    debug!(
        topology = %topology.id,
        networks = topology.networks.len(),
        clusters = topology.clusters.len(),
        nodes = next_index,
        "compiled topology"
    );
    Ok(topology)
}

fn new_topology_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn compile_networks(raw: Vec<Network>, id: &str) -> Result<BTreeMap<String, Network>> {
    if raw.is_empty() {
        return Err(Error::config("topology.networks is empty"));
    }

    let mut networks = BTreeMap::new();
    for mut net in raw {
        if !net.docker_name.is_empty() {
            return Err(Error::config(format!(
                "network {:?} should not specify a docker name",
                net.name
            )));
        }
        check_label("network name", &net.name)?;
        if networks.contains_key(&net.name) {
            return Err(Error::config(format!(
                "cannot have two networks with the same name {:?}",
                net.name
            )));
        }
        net.docker_name = format!("{CONTAINER_PREFIX}-{}-{id}", net.name);
        networks.insert(net.name.clone(), net);
    }
    Ok(networks)
}

/// Every (partition, namespace) pair referenced anywhere in a cluster
#[derive(Default)]
struct Tenancy(BTreeMap<String, BTreeSet<String>>);

impl Tenancy {
    fn add(&mut self, partition: &str, namespace: &str) {
        self.0
            .entry(partition_or_default(partition))
            .or_default()
            .insert(namespace_or_default(namespace));
    }

    fn into_partitions(self) -> Vec<Partition> {
        self.0
            .into_iter()
            .map(|(name, namespaces)| Partition {
                name,
                namespaces: namespaces.into_iter().collect(),
            })
            .collect()
    }
}

fn compile_cluster(
    mut c: Cluster,
    id: &str,
    images: &Images,
    networks: &BTreeMap<String, Network>,
    next_index: &mut usize,
    peer_refs: &mut BTreeSet<String>,
) -> Result<Cluster> {
    if c.name.is_empty() {
        return Err(Error::config("cluster has no name"));
    }
    check_label("cluster name", &c.name)?;

    if c.datacenter.is_empty() {
        c.datacenter = c.name.clone();
    } else {
        check_label("datacenter name", &c.datacenter)?;
    }

    if c.network_name.is_empty() {
        c.network_name = c.name.clone();
    }
    c.images = images.override_with(&c.images).choose_consul(c.enterprise);

    if !networks.contains_key(&c.network_name) {
        return Err(Error::config(format!(
            "cluster {:?} uses network name {:?} that does not exist",
            c.name, c.network_name
        )));
    }
    if c.nodes.is_empty() {
        return Err(Error::config(format!("cluster {:?} has no nodes", c.name)));
    }
    if !c.tls_volume_name.is_empty() {
        return Err(Error::config("user cannot specify the tls volume name field"));
    }

    let mut tenancy = Tenancy::default();
    for ap in &c.partitions {
        check_label("partition", &ap.name)?;
        tenancy.add(&ap.name, DEFAULT_TENANCY);
        for ns in &ap.namespaces {
            check_label("namespace", ns)?;
            tenancy.add(&ap.name, ns);
        }
    }
    for entry in &c.initial_config_entries {
        tenancy.add(&entry.partition, &entry.namespace);
    }

    let mut seen_nodes = BTreeSet::new();
    for n in &mut c.nodes {
        compile_node(&c.name, &c.datacenter, c.enterprise, &c.images, &c.network_name, n, id, networks, &mut tenancy, peer_refs)?;

        if !seen_nodes.insert(n.id()) {
            return Err(Error::config(format!(
                "cannot have two nodes in the same cluster {:?} with the same name {:?}",
                c.name,
                n.id().to_string()
            )));
        }
        n.index = *next_index;
        *next_index += 1;
    }

    c.partitions = tenancy.into_partitions();
    if !c.enterprise {
        let ce_only = c.partitions.len() == 1
            && c.partitions[0].name == DEFAULT_TENANCY
            && c.partitions[0].namespaces == [DEFAULT_TENANCY];
        if !ce_only {
            return Err(Error::config(format!(
                "cluster {:?} references non-default partitions or namespaces but is not enterprise",
                c.name
            )));
        }
    }

    Ok(c)
}

#[allow(clippy::too_many_arguments)]
fn compile_node(
    cluster: &str,
    datacenter: &str,
    enterprise: bool,
    cluster_images: &Images,
    cluster_network: &str,
    n: &mut Node,
    id: &str,
    networks: &BTreeMap<String, Network>,
    tenancy: &mut Tenancy,
    peer_refs: &mut BTreeSet<String>,
) -> Result<()> {
    if n.name.is_empty() {
        return Err(Error::config(format!("cluster {cluster:?} node has no name")));
    }
    check_label("node name", &n.name)?;
    n.partition = partition_or_default(&n.partition);
    check_label("node partition", &n.partition)?;
    tenancy.add(&n.partition, DEFAULT_TENANCY);

    if n.index != 0 {
        return Err(Error::config("user cannot specify the node index"));
    }
    if !n.container_name.is_empty() {
        return Err(Error::config("user cannot specify the container name"));
    }
    if !n.used_ports.is_empty() {
        return Err(Error::config("user cannot specify the used ports field"));
    }

    let mut used: BTreeMap<u16, u16> = BTreeMap::new();
    if n.is_agent() {
        used.insert(AGENT_HTTP_PORT, 0);
        used.insert(if n.is_server() { SERVER_GRPC_TLS_PORT } else { CLIENT_GRPC_PORT }, 0);
    }

    n.images = cluster_images
        .override_with(&n.images.clone().choose_consul(enterprise))
        .choose_node(n.kind);
    n.cluster = cluster.to_string();
    n.datacenter = datacenter.to_string();
    n.container_name = format!("{CONTAINER_PREFIX}-{}-{id}", n.name);

    if n.addresses.is_empty() {
        n.addresses.push(Address::on(cluster_network));
    }
    let (mut num_local, mut num_public) = (0, 0);
    for addr in &mut n.addresses {
        if addr.network.is_empty() {
            return Err(Error::config(format!(
                "cluster {cluster:?} node {:?} has invalid address",
                n.name
            )));
        }
        if addr.network_type.is_some() {
            return Err(Error::config("user cannot specify the address type directly"));
        }
        let net = networks.get(&addr.network).ok_or_else(|| {
            Error::config(format!(
                "cluster {cluster:?} node {:?} uses network name {:?} that does not exist",
                n.name, addr.network
            ))
        })?;
        match net.network_type {
            NetworkType::Lan => num_local += 1,
            NetworkType::Wan => num_public += 1,
        }
        addr.network_type = Some(net.network_type);
        addr.docker_network_name = net.docker_name.clone();
    }
    if num_local == 0 {
        return Err(Error::config(format!(
            "cluster {cluster:?} node {:?} has no local addresses",
            n.name
        )));
    }
    if num_public > 1 {
        return Err(Error::config(format!(
            "cluster {cluster:?} node {:?} has more than one public address",
            n.name
        )));
    }

    // one service per dataplane, mirroring one pod IP per service
    if n.is_dataplane() && n.services.len() > 1 {
        return Err(Error::config(format!(
            "cluster {cluster:?} node {:?} uses dataplane, but has more than one service",
            n.name
        )));
    }

    let node_id = n.id();
    let (is_agent, is_dataplane) = (n.is_agent(), n.is_dataplane());
    let mut seen_services = BTreeSet::new();

    for svc in &mut n.services {
        if is_agent {
            svc.id.partition = node_id.partition.clone();
        }
        svc.id.normalize();
        svc.node = node_id.clone();

        check_label("service partition", &svc.id.partition)?;
        check_label("service namespace", &svc.id.namespace)?;
        check_label("service name", &svc.id.name)?;
        if svc.id.partition != node_id.partition {
            return Err(Error::config(format!(
                "service {} on node {} has mismatched partitions: {} != {}",
                svc.id.name, node_id.name, svc.id.partition, node_id.partition
            )));
        }
        tenancy.add(&svc.id.partition, &svc.id.namespace);

        if !seen_services.insert(svc.id.clone()) {
            return Err(Error::config(format!(
                "cannot have two services on the same node {:?} in the same cluster {:?} with the same name {:?}",
                node_id.to_string(),
                cluster,
                svc.id.to_string()
            )));
        }

        if !svc.disable_service_mesh && is_dataplane && svc.envoy_public_listener_port == 0 {
            if used.contains_key(&DEFAULT_PUBLIC_LISTENER_PORT) {
                return Err(Error::config("envoy public listener port is required"));
            }
            svc.envoy_public_listener_port = DEFAULT_PUBLIC_LISTENER_PORT;
        }

        for port in svc.ports() {
            if used.insert(port, 0).is_some() {
                return Err(Error::config(format!(
                    "port used more than once on cluster {cluster:?} node {:?}: {port}",
                    node_id.to_string()
                )));
            }
        }

        for u in &mut svc.upstreams {
            if u.peer.is_empty() {
                if u.id.partition.is_empty() {
                    u.id.partition = svc.id.partition.clone();
                }
                if u.id.namespace.is_empty() {
                    u.id.namespace = svc.id.namespace.clone();
                }
            } else {
                // resolved to the remote side's partition once peerings are linked
                u.id.partition.clear();
                u.id.namespace = namespace_or_default(&u.id.namespace);
                peer_refs.insert(u.peer.clone());
            }
            if !u.id.partition.is_empty() {
                tenancy.add(&u.id.partition, &u.id.namespace);
            }
            if u.local_address.is_empty() {
                u.local_address = DEFAULT_UPSTREAM_ADDRESS.to_string();
            }
        }

        svc.validate().map_err(|e| {
            Error::config(format!(
                "cluster {cluster:?} node {:?} service {:?} is not valid: {e}",
                node_id.name,
                svc.id.to_string()
            ))
        })?;
    }

    n.used_ports = used;
    Ok(())
}

fn check_label(what: &str, name: &str) -> Result<()> {
    validate_label(name).map_err(|e| Error::config(format!("{what} is not valid: {e}")))
}

fn resolve_peerings(
    raw: Vec<Peering>,
    clusters: &mut BTreeMap<String, Cluster>,
    peer_refs: &mut BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<Peering>> {
    let mut by_cluster: BTreeMap<String, BTreeMap<String, PeerCluster>> = BTreeMap::new();
    let mut out = Vec::with_capacity(raw.len());

    for mut p in raw {
        let dialing = clusters.get(&p.dialing.name).ok_or_else(|| {
            Error::config(format!(
                "peering references a dialing cluster that does not exist: {}",
                p.dialing.name
            ))
        })?;
        let accepting = clusters.get(&p.accepting.name).ok_or_else(|| {
            Error::config(format!(
                "peering references an accepting cluster that does not exist: {}",
                p.accepting.name
            ))
        })?;
        if p.dialing.name == p.accepting.name {
            return Err(Error::config(format!(
                "self peerings are not allowed: {}",
                p.dialing.name
            )));
        }

        p.dialing.partition = partition_or_default(&p.dialing.partition);
        p.accepting.partition = partition_or_default(&p.accepting.partition);
        check_peer_partition("dialing", dialing, &p.dialing.partition)?;
        check_peer_partition("accepting", accepting, &p.accepting.partition)?;

        if p.dialing.peer_name.is_empty() {
            p.dialing.peer_name = format!("peer-{}-{}", p.accepting.name, p.accepting.partition);
        }
        if p.accepting.peer_name.is_empty() {
            p.accepting.peer_name = format!("peer-{}-{}", p.dialing.name, p.dialing.partition);
        }
        p.link();

        for side in [&p.dialing, &p.accepting] {
            by_cluster
                .entry(side.name.clone())
                .or_default()
                .insert(side.peer_name.clone(), side.clone());
            if let Some(refs) = peer_refs.get_mut(&side.name) {
                refs.remove(&side.peer_name);
            }
        }
        out.push(p);
    }

    for (cluster, dangling) in peer_refs.iter() {
        if !dangling.is_empty() {
            let names: Vec<&str> = dangling.iter().map(String::as_str).collect();
            return Err(Error::config(format!(
                "cluster[{cluster}] found topology references to peerings that do not exist: [{}]",
                names.join(" ")
            )));
        }
    }

    for (name, cluster) in clusters.iter_mut() {
        cluster.peerings = by_cluster.remove(name).unwrap_or_default();
    }
    Ok(out)
}

fn check_peer_partition(side: &str, cluster: &Cluster, partition: &str) -> Result<()> {
    if cluster.enterprise {
        if !cluster.has_partition(partition) {
            return Err(Error::config(format!(
                "{side} side of peering cannot reference a partition that does not exist: {partition}"
            )));
        }
    } else if partition != DEFAULT_TENANCY {
        return Err(Error::config(format!(
            "{side} side of peering cannot reference a partition when not enterprise"
        )));
    }
    Ok(())
}

fn stamp_upstreams(clusters: &mut BTreeMap<String, Cluster>) -> Result<()> {
    for c in clusters.values_mut() {
        for n in &mut c.nodes {
            for svc in &mut n.services {
                for u in &mut svc.upstreams {
                    if u.peer.is_empty() {
                        u.cluster = c.name.clone();
                        u.peering = None;
                        continue;
                    }
                    let remote = c
                        .peerings
                        .get(&u.peer)
                        .and_then(|side| side.link.as_deref())
                        .ok_or_else(|| {
                            Error::internal_with_context(
                                "stamp_upstreams",
                                format!("peer {:?} was not linked", u.peer),
                            )
                        })?;
                    u.cluster = remote.name.clone();
                    u.id.partition = remote.partition.clone();
                    u.peering = Some(remote.clone());
                }
            }
        }
    }
    Ok(())
}

fn same_keys<V, W>(a: &BTreeMap<String, V>, b: &BTreeMap<String, W>) -> bool {
    a.len() == b.len() && a.keys().all(|k| b.contains_key(k))
}

fn inherit_from_previous(t: &mut Topology, prev: &Topology) -> Result<()> {
    if !same_keys(&prev.networks, &t.networks) {
        return Err(Error::config("cannot create or destroy networks"));
    }
    for (name, net) in t.networks.iter_mut() {
        let old = prev
            .networks
            .get(name)
            .ok_or_else(|| Error::config("cannot create or destroy networks"))?;
        net.inherit_from(old);
        if net != old {
            return Err(Error::config(format!("networks cannot change: {name:?} was edited")));
        }
    }

    if !same_keys(&prev.clusters, &t.clusters) {
        return Err(Error::config("cannot create or destroy clusters"));
    }
    for (name, cluster) in t.clusters.iter_mut() {
        let old = prev
            .clusters
            .get(name)
            .ok_or_else(|| Error::config("cannot create or destroy clusters"))?;

        cluster.tls_volume_name = old.tls_volume_name.clone();

        if cluster.name != old.name
            || cluster.network_name != old.network_name
            || cluster.datacenter != old.datacenter
            || cluster.enterprise != old.enterprise
        {
            return Err(Error::immutable(
                name.as_str(),
                format!("cannot edit some cluster fields for {name:?}"),
            ));
        }

        if !cluster.initial_config_entries.is_empty() {
            warn!(
                cluster = %name,
                entries = cluster.initial_config_entries.len(),
                "initial config entries were provided on recompile; they are re-applied on relaunch"
            );
        }

        inherit_nodes(name, &old.nodes, &mut cluster.nodes)?;
    }
    Ok(())
}
