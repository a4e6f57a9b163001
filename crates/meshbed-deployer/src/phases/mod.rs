//! Steps of the launch and relaunch pipelines.
//!
//! Each step is a free function over the collaborators it needs, so it can
//! be exercised with mocks in isolation. The orchestrator in
//! [`crate::deployment`] decides the order and attributes failures to step
//! names.

mod catalog;
mod infra;
mod peering;
mod servers;
mod tenancy;
mod tokens;

pub use catalog::{register_agent_services, register_catalog_services, wait_for_anti_entropy};
pub use infra::{
    assign_tls_names, build_images, init_secrets, issue_tls, provision_networks,
};
pub use peering::{establish_peerings, wait_for_peerings_active, ClusterClients};
pub use servers::{bootstrap_acls, find_leader, rejoin_servers, wait_for_leader, wait_for_local_writes};
pub use tenancy::{apply_config_entries, create_tenancies, ensure_partition};
pub use tokens::{create_agent_tokens, create_anonymous_token, create_service_tokens};

use std::future::Future;

use tracing::debug;

use meshbed_common::retry::{policies, retry_when};
use meshbed_common::Error;
use meshbed_topology::Topology;

use crate::provisioner::{PhaseOutput, ProvisionPhase, Provisioner};

/// Bind the provisioner to the current topology, run `phase`, and fold what
/// it reported back into the topology.
pub async fn provision(
    provisioner: &dyn Provisioner,
    topology: &mut Topology,
    phase: ProvisionPhase,
) -> Result<(), Error> {
    provisioner.set_topology(topology).await?;
    let output = provisioner.generate(phase).await?;
    digest_outputs(topology, &output)?;
    Ok(())
}

/// Record subnets, proxy ports and exposed node ports.
///
/// Returns whether the topology changed. Nodes the output does not mention
/// keep their current ports.
pub fn digest_outputs(topology: &mut Topology, output: &PhaseOutput) -> Result<bool, Error> {
    let mut changed = false;

    for (network, subnet) in &output.subnets {
        changed |= topology.digest_subnet(network, subnet)?;
    }
    for (network, port) in &output.proxy_ports {
        changed |= topology.digest_proxy_port(network, *port)?;
    }
    for (cluster_name, nodes) in &output.node_ports {
        let cluster = topology.cluster_mut(cluster_name)?;
        for (id, ports) in nodes {
            let node = cluster.node_by_id_mut(id).ok_or_else(|| {
                Error::internal(format!(
                    "found output node that does not exist: {cluster_name}/{id}"
                ))
            })?;
            changed |= node.digest_exposed_ports(ports)?;
        }
    }

    if changed {
        debug!(
            networks = output.subnets.len(),
            clusters = output.node_ports.len(),
            "digested provisioner outputs"
        );
    }
    Ok(changed)
}

/// Run a request that may race the replication of the token it carries
pub(crate) async fn retry_token_race<F, Fut, T>(operation_name: &str, operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_when(
        &policies::TOKEN_RACE,
        operation_name,
        |e: &Error| e.is_acl_not_found(),
        operation,
    )
    .await
}

#[cfg(test)]
pub(crate) mod testing {
    //! Topologies shared by the step tests

    use meshbed_topology::{compile, Config, Topology};

    pub const TWO_CLUSTERS: &str = r#"
networks:
  - name: dc1
  - name: dc2
  - name: wan
    type: wan
clusters:
  - name: dc1
    nodes:
      - kind: server
        name: dc1-server1
        addresses: [{ network: dc1 }, { network: wan }]
      - kind: server
        name: dc1-server2
      - kind: client
        name: dc1-client1
        services:
          - id: { name: ping }
            image: example/pingpong:latest
            port: 8080
            envoy_admin_port: 19000
            check_http: "http://localhost:8080/health"
            upstreams:
              - id: { name: pong }
                local_port: 9090
                peer: peer-dc2-default
      - kind: client
        name: dc1-client2
        disabled: true
  - name: dc2
    nodes:
      - kind: server
        name: dc2-server1
        addresses: [{ network: dc2 }, { network: wan }]
      - kind: dataplane
        name: dc2-dp1
        services:
          - id: { name: pong }
            image: example/pingpong:latest
            port: 8080
            envoy_admin_port: 19000
            check_tcp: "localhost:8080"
peerings:
  - dialing: { name: dc1 }
    accepting: { name: dc2 }
"#;

    /// Compiled, with subnets, proxy ports, IPs and exposed ports filled in
    /// the way a provisioner would
    pub fn launched_topology() -> Topology {
        let cfg = Config::from_yaml_str(TWO_CLUSTERS).unwrap();
        let mut t = compile(&cfg).unwrap();
        t.digest_subnet("dc1", "10.0.1.0/24").unwrap();
        t.digest_subnet("dc2", "10.0.2.0/24").unwrap();
        t.digest_subnet("wan", "10.0.3.0/24").unwrap();
        t.digest_proxy_port("dc1", 41001).unwrap();
        t.digest_proxy_port("dc2", 41002).unwrap();
        t.digest_proxy_port("wan", 41003).unwrap();
        t.assign_ips().unwrap();
        for c in t.clusters.values_mut() {
            for n in c.nodes.iter_mut() {
                let ports = n.sorted_ports().into_iter().map(|p| (p, p + 30000)).collect();
                n.digest_exposed_ports(&ports).unwrap();
            }
        }
        t
    }
}
