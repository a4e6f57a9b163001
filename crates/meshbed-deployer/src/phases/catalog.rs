//! Service registration, through agents and directly into the catalog.
//!
//! Services on client agents are registered with their local agent, which
//! owns their health checks. Dataplane nodes have no agent, so their node,
//! services and sidecars are written straight into the catalog with checks
//! that are reported as passing.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use meshbed_common::retry::{poll_until, policies, Attempt};
use meshbed_common::Error;
use meshbed_topology::{Cluster, Node, NodeId, Service, Topology, Upstream};

use crate::api::{
    AgentServiceCheck, AgentServiceConnect, AgentServiceRegistration, CatalogDeregistration,
    CatalogRegistration, CatalogService, ClusterApi, ClusterApiFactory, HealthCheck,
    HealthCheckDefinition, MeshGatewayConfig, ServiceAddress, ServiceProxy, SidecarProxy,
    SidecarService, UpstreamConfig,
};
use crate::secrets::SecretStore;

use super::retry_token_race;

/// Node meta marking catalog entries written on behalf of a dataplane
pub const DATAPLANE_NODE_META: &str = "dataplane-faux";

const SIDECAR_SUFFIX: &str = "-sidecar-proxy";
const EXTERNAL_CHECK_NAME: &str = "external sync";

/// Block until every enabled agent has completed its first anti-entropy
/// sync, i.e. shows up in the catalog with tagged addresses.
///
/// Catalog errors are retried as well as missing nodes.
pub async fn wait_for_anti_entropy(client: &dyn ClusterApi, cluster: &Cluster) -> Result<(), Error> {
    let partitions = cluster.partition_names();
    let partitions = partitions.as_slice();

    poll_until("wait_for_anti_entropy", || async move {
        let mut synced = BTreeSet::new();
        for partition in partitions {
            let nodes = match client.catalog_nodes(partition).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    return Ok::<_, Error>(Attempt::again(
                        &policies::ANTI_ENTROPY,
                        format!("catalog lookup failed: {e}"),
                    ))
                }
            };
            synced.extend(
                nodes
                    .into_iter()
                    .filter(|n| !n.tagged_addresses.is_empty())
                    .map(|n| NodeId::new(n.node, &n.partition)),
            );
        }

        let waiting: Vec<String> = cluster
            .nodes
            .iter()
            .filter(|n| n.is_agent() && !n.disabled)
            .filter(|n| !synced.contains(&n.catalog_id()))
            .map(|n| n.id().to_string())
            .collect();

        if waiting.is_empty() {
            Ok(Attempt::Done(()))
        } else {
            Ok(Attempt::again(
                &policies::ANTI_ENTROPY,
                format!("waiting for {}", waiting.join(", ")),
            ))
        }
    })
    .await?;

    info!(cluster = %cluster.name, "all agents synced");
    Ok(())
}

/// Write dataplane nodes and their services into the catalog, or remove
/// them when the node is disabled
pub async fn register_catalog_services(client: &dyn ClusterApi, cluster: &Cluster) -> Result<(), Error> {
    for node in cluster.nodes.iter().filter(|n| n.is_dataplane() && !n.services.is_empty()) {
        if node.disabled {
            deregister_dataplane(client, cluster, node).await?;
        } else {
            register_dataplane(client, cluster, node).await?;
        }
    }
    Ok(())
}

async fn register_dataplane(client: &dyn ClusterApi, cluster: &Cluster, node: &Node) -> Result<(), Error> {
    let registration = dataplane_node_registration(cluster, node)?;
    let registration = &registration;
    retry_token_race("catalog_register_node", || async move {
        client.catalog_register(registration).await
    })
    .await?;

    for service in &node.services {
        let registration = service_catalog_registration(cluster, node, service)?;
        let registration = &registration;
        retry_token_race("catalog_register_service", || async move {
            client.catalog_register(registration).await
        })
        .await?;

        if !service.disable_service_mesh {
            let registration = sidecar_catalog_registration(cluster, node, service)?;
            let registration = &registration;
            retry_token_race("catalog_register_sidecar", || async move {
                client.catalog_register(registration).await
            })
            .await?;
        }
        debug!(cluster = %cluster.name, node = %node.id(), service = %service.id, "registered service in catalog");
    }
    Ok(())
}

async fn deregister_dataplane(client: &dyn ClusterApi, cluster: &Cluster, node: &Node) -> Result<(), Error> {
    let pod = node.pod_name();
    let partition = scoped(cluster, &node.partition);

    for service in &node.services {
        let mut ids = vec![service.id.name.clone()];
        if !service.disable_service_mesh {
            ids.push(format!("{}{SIDECAR_SUFFIX}", service.id.name));
        }
        for service_id in ids {
            let deregistration = CatalogDeregistration {
                node: pod.clone(),
                service_id,
                partition: partition.clone(),
                namespace: scoped(cluster, &service.id.namespace),
            };
            let deregistration = &deregistration;
            retry_token_race("catalog_deregister_service", || async move {
                client.catalog_deregister(deregistration).await
            })
            .await?;
        }
    }

    let deregistration = CatalogDeregistration {
        node: pod,
        partition,
        ..Default::default()
    };
    let deregistration = &deregistration;
    retry_token_race("catalog_deregister_node", || async move {
        client.catalog_deregister(deregistration).await
    })
    .await?;
    debug!(cluster = %cluster.name, node = %node.id(), "removed dataplane from catalog");
    Ok(())
}

/// Register services on client agents with each service's own token.
/// Mesh gateways and services on disabled nodes are skipped.
pub async fn register_agent_services(
    factory: &dyn ClusterApiFactory,
    secrets: &dyn SecretStore,
    topology: &Topology,
    cluster_name: &str,
) -> Result<(), Error> {
    let cluster = topology.cluster(cluster_name)?;
    for node in cluster.nodes.iter().filter(|n| n.is_agent() && !n.disabled) {
        for service in node.services.iter().filter(|s| !s.is_mesh_gateway) {
            let token = secrets.read_service_token(cluster_name, &service.id);
            let client = factory.agent_client(topology, cluster_name, &node.id(), &token)?;
            let client = &*client;

            let registration = agent_service_registration(cluster, service);
            let registration = &registration;
            retry_token_race("agent_service_register", || async move {
                client.agent_service_register(registration).await
            })
            .await?;
            debug!(cluster = %cluster_name, node = %node.id(), service = %service.id, "registered service with agent");
        }
    }
    Ok(())
}

/// Registration of `service` with the agent on its node
pub fn agent_service_registration(cluster: &Cluster, service: &Service) -> AgentServiceRegistration {
    let check = if !service.check_tcp.is_empty() {
        Some(AgentServiceCheck {
            tcp: service.check_tcp.clone(),
            ..agent_check()
        })
    } else if !service.check_http.is_empty() {
        Some(AgentServiceCheck {
            http: service.check_http.clone(),
            method: "GET".into(),
            ..agent_check()
        })
    } else {
        None
    };

    let connect = (!service.disable_service_mesh).then(|| AgentServiceConnect {
        sidecar_service: Some(SidecarService {
            proxy: SidecarProxy {
                upstreams: upstream_configs(cluster, service),
            },
        }),
    });

    AgentServiceRegistration {
        id: service.id.name.clone(),
        name: service.id.name.clone(),
        port: service.port,
        meta: service.meta.clone(),
        check,
        connect,
        partition: scoped(cluster, &service.id.partition),
        namespace: scoped(cluster, &service.id.namespace),
    }
}

fn agent_check() -> AgentServiceCheck {
    AgentServiceCheck {
        name: "up".into(),
        interval: "5s".into(),
        timeout: "1s".into(),
        ..Default::default()
    }
}

/// Catalog entry of a dataplane's node
pub fn dataplane_node_registration(cluster: &Cluster, node: &Node) -> Result<CatalogRegistration, Error> {
    Ok(CatalogRegistration {
        node: node.pod_name(),
        address: local_address(node)?.to_string(),
        node_meta: BTreeMap::from([(DATAPLANE_NODE_META.to_string(), "1".to_string())]),
        partition: scoped(cluster, &node.partition),
        ..Default::default()
    })
}

/// Catalog entry of a service on a dataplane node, with a passing check
/// when the service declares one
pub fn service_catalog_registration(
    cluster: &Cluster,
    node: &Node,
    service: &Service,
) -> Result<CatalogRegistration, Error> {
    let address = local_address(node)?;
    let mut entry = CatalogService {
        id: service.id.name.clone(),
        service: service.id.name.clone(),
        port: service.port,
        address: address.to_string(),
        meta: service.meta.clone(),
        partition: scoped(cluster, &service.id.partition),
        namespace: scoped(cluster, &service.id.namespace),
        ..Default::default()
    };
    if service.is_mesh_gateway {
        entry.kind = "mesh-gateway".into();
        entry.proxy = Some(ServiceProxy {
            config: BTreeMap::from([
                ("envoy_gateway_no_default_bind".to_string(), serde_json::Value::Bool(true)),
                ("envoy_gateway_bind_tagged_addresses".to_string(), serde_json::Value::Bool(true)),
            ]),
            mesh_gateway: Some(MeshGatewayConfig {
                mode: "local".into(),
            }),
            ..Default::default()
        });
    }

    let mut registration = CatalogRegistration {
        node: node.pod_name(),
        address: address.to_string(),
        skip_node_update: true,
        partition: scoped(cluster, &node.partition),
        ..Default::default()
    };
    if let Some(public) = node.public_address() {
        registration.tagged_addresses = node_tagged_addresses(address, public);
        entry.tagged_addresses = service_tagged_addresses(address, public, service.port);
    }

    if service.has_check() {
        let definition = if !service.check_tcp.is_empty() {
            HealthCheckDefinition {
                tcp: service.check_tcp.clone(),
                ..Default::default()
            }
        } else {
            HealthCheckDefinition {
                http: service.check_http.clone(),
                method: "GET".into(),
                ..Default::default()
            }
        };
        registration.check = Some(external_check(cluster, node, service, &service.id.name, definition));
    }

    registration.service = Some(entry);
    Ok(registration)
}

/// Catalog entry of the sidecar proxy fronting a service on a dataplane
/// node, checked over TCP on its public listener
pub fn sidecar_catalog_registration(
    cluster: &Cluster,
    node: &Node,
    service: &Service,
) -> Result<CatalogRegistration, Error> {
    let address = local_address(node)?;
    let proxy_id = format!("{}{SIDECAR_SUFFIX}", service.id.name);

    let mut registration = CatalogRegistration {
        node: node.pod_name(),
        address: address.to_string(),
        skip_node_update: true,
        partition: scoped(cluster, &node.partition),
        service: Some(CatalogService {
            kind: "connect-proxy".into(),
            id: proxy_id.clone(),
            service: proxy_id.clone(),
            port: service.envoy_public_listener_port,
            address: address.to_string(),
            proxy: Some(ServiceProxy {
                destination_service_name: service.id.name.clone(),
                destination_service_id: service.id.name.clone(),
                local_service_port: service.port,
                upstreams: upstream_configs(cluster, service),
                ..Default::default()
            }),
            partition: scoped(cluster, &service.id.partition),
            namespace: scoped(cluster, &service.id.namespace),
            ..Default::default()
        }),
        ..Default::default()
    };
    if let Some(public) = node.public_address() {
        registration.tagged_addresses = node_tagged_addresses(address, public);
    }

    let definition = HealthCheckDefinition {
        tcp: format!("{address}:{}", service.envoy_public_listener_port),
        ..Default::default()
    };
    registration.check = Some(external_check(cluster, node, service, &proxy_id, definition));
    Ok(registration)
}

fn external_check(
    cluster: &Cluster,
    node: &Node,
    service: &Service,
    service_id: &str,
    definition: HealthCheckDefinition,
) -> HealthCheck {
    HealthCheck {
        node: node.pod_name(),
        check_id: format!("{service_id}:{EXTERNAL_CHECK_NAME}"),
        name: EXTERNAL_CHECK_NAME.into(),
        status: "passing".into(),
        service_id: service_id.to_string(),
        service_name: service_id.to_string(),
        definition,
        partition: scoped(cluster, &service.id.partition),
        namespace: scoped(cluster, &service.id.namespace),
    }
}

fn upstream_configs(cluster: &Cluster, service: &Service) -> Vec<UpstreamConfig> {
    service.upstreams.iter().map(|u| upstream_config(cluster, u)).collect()
}

fn upstream_config(cluster: &Cluster, upstream: &Upstream) -> UpstreamConfig {
    UpstreamConfig {
        destination_peer: upstream.peer.clone(),
        destination_name: upstream.id.name.clone(),
        destination_namespace: scoped(cluster, &upstream.id.namespace),
        destination_partition: if upstream.peer.is_empty() {
            scoped(cluster, &upstream.id.partition)
        } else {
            String::new()
        },
        local_bind_address: upstream.local_address.clone(),
        local_bind_port: upstream.local_port,
    }
}

fn node_tagged_addresses(local: &str, public: &str) -> BTreeMap<String, String> {
    [("lan", local), ("lan_ipv4", local), ("wan", public), ("wan_ipv4", public)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn service_tagged_addresses(local: &str, public: &str, port: u16) -> BTreeMap<String, ServiceAddress> {
    node_tagged_addresses(local, public)
        .into_iter()
        .map(|(k, address)| (k, ServiceAddress { address, port }))
        .collect()
}

fn local_address(node: &Node) -> Result<&str, Error> {
    node.local_address()
        .ok_or_else(|| Error::internal(format!("node {} has no local address", node.id())))
}

fn scoped(cluster: &Cluster, value: &str) -> String {
    if cluster.enterprise {
        value.to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CatalogNode, MockClusterApi, MockClusterApiFactory};
    use crate::phases::testing::launched_topology;
    use crate::secrets::MemorySecretStore;
    use meshbed_common::error::ACL_NOT_FOUND;
    use meshbed_topology::ServiceId;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn synced(node: &Node) -> CatalogNode {
        CatalogNode {
            node: node.pod_name(),
            tagged_addresses: BTreeMap::from([("lan".into(), "10.0.1.2".into())]),
            ..Default::default()
        }
    }

    // ==========================================================================
    // Story Tests: Waiting for agents to sync
    // ==========================================================================

    /// Story: the second server syncs a second later; the disabled client
    /// never shows up and is not waited for
    #[tokio::test(start_paused = true)]
    async fn story_anti_entropy_ignores_disabled_agents() {
        let topo = launched_topology();
        let cluster = topo.clusters["dc1"].clone();
        let nodes: Vec<Node> = cluster.nodes.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut api = MockClusterApi::new();
        api.expect_catalog_nodes().with(mockall::predicate::eq("")).returning(move |_| {
            let round = c.fetch_add(1, Ordering::SeqCst);
            let listed = nodes
                .iter()
                .filter(|n| n.is_agent() && !n.disabled)
                .filter(|n| round > 0 || n.name != "dc1-server2")
                .map(synced)
                .collect();
            Ok(listed)
        });

        let start = tokio::time::Instant::now();
        wait_for_anti_entropy(&api, &cluster).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    /// Story: a node listed before its first sync has no tagged addresses
    /// yet, and a catalog error is just another reason to wait
    #[tokio::test(start_paused = true)]
    async fn story_anti_entropy_waits_for_tagged_addresses() {
        let topo = launched_topology();
        let cluster = topo.clusters["dc2"].clone();
        let server = cluster.nodes[0].clone();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut api = MockClusterApi::new();
        api.expect_catalog_nodes().returning(move |_| {
            match c.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::api_status("dc2", 500, "rpc error")),
                1 => Ok(vec![CatalogNode {
                    node: server.pod_name(),
                    ..Default::default()
                }]),
                _ => Ok(vec![synced(&server)]),
            }
        });

        wait_for_anti_entropy(&api, &cluster).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    // ==========================================================================
    // Story Tests: Dataplane catalog sync
    // ==========================================================================

    /// Story: an enabled dataplane writes its node, its service and its
    /// sidecar, retrying a token that has not replicated yet
    #[tokio::test(start_paused = true)]
    async fn story_dataplane_registered_in_order() {
        let topo = launched_topology();
        let cluster = &topo.clusters["dc2"];
        let written = Arc::new(Mutex::new(Vec::<CatalogRegistration>::new()));
        let w = written.clone();
        let failures = Arc::new(AtomicU32::new(0));
        let f = failures.clone();

        let mut api = MockClusterApi::new();
        api.expect_catalog_register().returning(move |r| {
            if f.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::api_status("dc2", 403, ACL_NOT_FOUND));
            }
            w.lock().push(r.clone());
            Ok(())
        });
        api.expect_catalog_deregister().never();

        register_catalog_services(&api, cluster).await.unwrap();

        let written = written.lock();
        assert_eq!(written.len(), 3);
        assert_eq!(written[0].node_meta[DATAPLANE_NODE_META], "1");
        assert!(written[0].service.is_none());

        let service = written[1].service.as_ref().unwrap();
        assert_eq!(service.id, "pong");
        assert!(written[1].skip_node_update);
        let check = written[1].check.as_ref().unwrap();
        assert_eq!(check.definition.tcp, "localhost:8080");
        assert_eq!(check.status, "passing");

        let sidecar = written[2].service.as_ref().unwrap();
        assert_eq!(sidecar.kind, "connect-proxy");
        assert_eq!(sidecar.id, "pong-sidecar-proxy");
        let proxy = sidecar.proxy.as_ref().unwrap();
        assert_eq!(proxy.destination_service_id, "pong");
        assert_eq!(proxy.local_service_port, 8080);
    }

    #[tokio::test]
    async fn test_disabled_dataplane_removed_from_catalog() {
        let mut topo = launched_topology();
        let cluster = topo.clusters.get_mut("dc2").unwrap();
        cluster.nodes[1].disabled = true;
        let pod = cluster.nodes[1].pod_name();

        let removed = Arc::new(Mutex::new(Vec::<CatalogDeregistration>::new()));
        let r = removed.clone();
        let mut api = MockClusterApi::new();
        api.expect_catalog_register().never();
        api.expect_catalog_deregister().returning(move |d| {
            r.lock().push(d.clone());
            Ok(())
        });

        register_catalog_services(&api, cluster).await.unwrap();

        let ids: Vec<(String, String)> = removed
            .lock()
            .iter()
            .map(|d| (d.node.clone(), d.service_id.clone()))
            .collect();
        assert_eq!(
            ids,
            vec![
                (pod.clone(), "pong".to_string()),
                (pod.clone(), "pong-sidecar-proxy".to_string()),
                (pod, String::new()),
            ]
        );
    }

    #[test]
    fn test_public_node_gets_tagged_addresses() {
        let topo = launched_topology();
        let cluster = &topo.clusters["dc2"];
        let mut node = cluster.nodes[0].clone();
        let mut service = cluster.nodes[1].services[0].clone();
        service.is_mesh_gateway = true;
        node.services = vec![service.clone()];

        let reg = service_catalog_registration(cluster, &node, &service).unwrap();
        let local = node.local_address().unwrap();
        let public = node.public_address().unwrap();
        assert_eq!(reg.tagged_addresses["lan"], local);
        assert_eq!(reg.tagged_addresses["wan_ipv4"], public);

        let entry = reg.service.unwrap();
        assert_eq!(entry.kind, "mesh-gateway");
        assert_eq!(entry.tagged_addresses["wan"].address, public);
        assert_eq!(entry.tagged_addresses["wan"].port, 8080);
        assert_eq!(entry.proxy.unwrap().mesh_gateway.unwrap().mode, "local");
    }

    // ==========================================================================
    // Story Tests: Agent registration
    // ==========================================================================

    /// Story: the ping service is registered with its own token on its
    /// client's agent, carrying an HTTP check and its peered upstream
    #[tokio::test]
    async fn story_agent_service_registered_with_service_token() {
        let topo = launched_topology();
        let store = MemorySecretStore::new();
        store.save_service_token("dc1", &ServiceId::new("ping", "", ""), "ping-secret");

        let mut api = MockClusterApi::new();
        api.expect_agent_service_register()
            .withf(|r| {
                let check = r.check.as_ref().unwrap();
                let upstreams = &r.connect.as_ref().unwrap().sidecar_service.as_ref().unwrap().proxy.upstreams;
                r.id == "ping"
                    && check.http == "http://localhost:8080/health"
                    && check.method == "GET"
                    && check.name == "up"
                    && upstreams.len() == 1
                    && upstreams[0].destination_peer == "peer-dc2-default"
                    && upstreams[0].local_bind_port == 9090
                    && r.partition.is_empty()
            })
            .times(1)
            .returning(|_| Ok(()));
        let api: Arc<dyn ClusterApi> = Arc::new(api);

        let mut factory = MockClusterApiFactory::new();
        factory
            .expect_agent_client()
            .withf(|_, cluster, node, token| {
                cluster == "dc1" && node.name == "dc1-client1" && token == "ping-secret"
            })
            .times(1)
            .returning(move |_, _, _, _| Ok(api.clone()));

        register_agent_services(&factory, &store, &topo, "dc1").await.unwrap();
    }

    #[test]
    fn test_enterprise_upstreams_scope_local_destinations_only() {
        let cluster = Cluster {
            enterprise: true,
            ..Default::default()
        };
        let local = Upstream {
            id: ServiceId::new("db", "ns1", "ap1"),
            local_port: 5432,
            ..Default::default()
        };
        let peered = Upstream {
            peer: "peer-dc2-default".into(),
            ..local.clone()
        };

        let cfg = upstream_config(&cluster, &local);
        assert_eq!(cfg.destination_partition, "ap1");
        assert_eq!(cfg.destination_namespace, "ns1");
        let cfg = upstream_config(&cluster, &peered);
        assert_eq!(cfg.destination_partition, "");
        assert_eq!(cfg.destination_namespace, "ns1");
    }
}
