//! Images, secrets, networks and TLS material.

use tracing::{debug, info};

use meshbed_common::retry::{retry_when, RetryPolicy};
use meshbed_common::{Error, CONTAINER_PREFIX};
use meshbed_topology::{NodeKind, Topology};

use crate::artifacts::ArtifactBuilder;
use crate::provisioner::{ProvisionPhase, Provisioner};
use crate::secrets::{generate_gossip_key, generate_token, keys, SecretStore};

use super::digest_outputs;

/// Build the local images for every distinct node image set
pub async fn build_images(artifacts: &dyn ArtifactBuilder, topology: &Topology) -> Result<(), Error> {
    for images in topology.node_images() {
        debug!(consul = %images.consul, envoy = %images.envoy, dataplane = %images.dataplane, "building images");
        artifacts.build_images(&images).await?;
    }
    Ok(())
}

/// Seed the per-cluster secrets and hand servers the bootstrap token as
/// their agent token.
///
/// Secrets that already exist are kept. Disabled servers get a token too so
/// enabling them later needs no extra step.
pub fn init_secrets(secrets: &dyn SecretStore, topology: &Topology) {
    for cluster in topology.clusters.values() {
        let name = cluster.name.as_str();
        for (key, generate) in [
            (keys::BOOTSTRAP_TOKEN, generate_token as fn() -> String),
            (keys::AGENT_RECOVERY, generate_token),
            (keys::GOSSIP_KEY, generate_gossip_key),
        ] {
            if secrets.read_generic(name, key).is_empty() {
                secrets.save_generic(name, key, &generate());
            }
        }

        let bootstrap = secrets.read_generic(name, keys::BOOTSTRAP_TOKEN);
        for node in cluster.nodes.iter().filter(|n| n.is_server()) {
            secrets.save_agent_token(name, &node.id(), &bootstrap);
        }
    }
}

/// Create networks and volumes, retrying subnet collisions under `policy`.
///
/// Discovered subnets and proxy ports are recorded, and clusters without a
/// TLS volume get one named after the topology.
pub async fn provision_networks(
    provisioner: &dyn Provisioner,
    topology: &mut Topology,
    policy: &RetryPolicy,
) -> Result<(), Error> {
    for cluster in topology.clusters.values_mut() {
        if cluster.tls_volume_name.is_empty() {
            cluster.tls_volume_name =
                format!("{CONTAINER_PREFIX}-tls-material-{}-{}", cluster.name, topology.id);
        }
    }

    provisioner.set_topology(topology).await?;
    let output = retry_when(
        policy,
        "provision_networks",
        |e: &Error| e.is_address_pool_overlap(),
        || provisioner.generate(ProvisionPhase::Networks),
    )
    .await?;
    digest_outputs(topology, &output)?;

    info!(networks = topology.networks.len(), "networks ready");
    Ok(())
}

/// Name each agent's certificate files: `<dc>-server-consul-<n>` for
/// servers, `<dc>-client-consul-<n>` for clients, counting per kind in
/// declaration order. Names already assigned are kept.
pub fn assign_tls_names(topology: &mut Topology) {
    for cluster in topology.clusters.values_mut() {
        let (mut servers, mut clients) = (0usize, 0usize);
        for node in cluster.nodes.iter_mut() {
            let (kind, counter) = match node.kind {
                NodeKind::Server => ("server", &mut servers),
                NodeKind::Client => ("client", &mut clients),
                NodeKind::Dataplane => continue,
            };
            if node.tls_cert_prefix.is_empty() {
                node.tls_cert_prefix = format!("{}-{kind}-consul-{}", node.datacenter, *counter);
            }
            *counter += 1;
        }
    }
}

/// Issue TLS material for every cluster
pub async fn issue_tls(artifacts: &dyn ArtifactBuilder, topology: &Topology) -> Result<(), Error> {
    for cluster in topology.clusters.values() {
        debug!(cluster = %cluster.name, volume = %cluster.tls_volume_name, "issuing tls material");
        artifacts.issue_tls(cluster).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MockArtifactBuilder;
    use crate::phases::testing::TWO_CLUSTERS;
    use crate::provisioner::{MockProvisioner, PhaseOutput};
    use crate::secrets::MemorySecretStore;
    use meshbed_common::error::POOL_OVERLAP;
    use meshbed_common::retry::policies;
    use meshbed_topology::{compile, Config, NodeId};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn topology() -> Topology {
        compile(&Config::from_yaml_str(TWO_CLUSTERS).unwrap()).unwrap()
    }

    fn overlap() -> Error {
        Error::provisioner(
            "networks",
            format!("Error response from daemon: {POOL_OVERLAP}"),
        )
    }

    // ==========================================================================
    // Story Tests: Subnet collisions while creating networks
    // ==========================================================================

    /// Story: a collision is retried once a second and the run carries on
    /// with the subnet the runtime eventually picked
    #[tokio::test(start_paused = true)]
    async fn story_pool_overlap_retried_until_networks_exist() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut provisioner = MockProvisioner::new();
        provisioner.expect_set_topology().returning(|_| Ok(()));
        provisioner.expect_generate().returning(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(overlap());
            }
            let mut out = PhaseOutput::default();
            out.subnets.insert("dc1".into(), "10.0.1.0/24".into());
            out.proxy_ports.insert("dc1".into(), 41001);
            Ok(out)
        });

        let mut topo = topology();
        let start = tokio::time::Instant::now();
        provision_networks(&provisioner, &mut topo, &policies::NETWORK_PROVISION)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(topo.networks["dc1"].subnet, "10.0.1.0/24");
        assert_eq!(
            topo.clusters["dc1"].tls_volume_name,
            format!("meshbed-tls-material-dc1-{}", topo.id)
        );
    }

    /// Story: a collision that keeps happening is not self-healing, so the
    /// step gives up after five attempts
    #[tokio::test(start_paused = true)]
    async fn story_pool_overlap_gives_up_after_five_attempts() {
        let mut provisioner = MockProvisioner::new();
        provisioner.expect_set_topology().returning(|_| Ok(()));
        provisioner
            .expect_generate()
            .times(5)
            .returning(|_| Err(overlap()));

        let mut topo = topology();
        let err = provision_networks(&provisioner, &mut topo, &policies::NETWORK_PROVISION)
            .await
            .unwrap_err();
        assert!(err.is_address_pool_overlap());
    }

    #[tokio::test]
    async fn test_other_provisioner_errors_are_not_retried() {
        let mut provisioner = MockProvisioner::new();
        provisioner.expect_set_topology().returning(|_| Ok(()));
        provisioner
            .expect_generate()
            .times(1)
            .returning(|_| Err(Error::provisioner("networks", "permission denied")));

        let mut topo = topology();
        assert!(
            provision_networks(&provisioner, &mut topo, &policies::NETWORK_PROVISION)
                .await
                .is_err()
        );
    }

    #[test]
    fn test_init_secrets_seeds_every_cluster() {
        let store = MemorySecretStore::new();
        let topo = topology();
        init_secrets(&store, &topo);

        for cluster in ["dc1", "dc2"] {
            assert!(!store.read_generic(cluster, keys::BOOTSTRAP_TOKEN).is_empty());
            assert!(!store.read_generic(cluster, keys::AGENT_RECOVERY).is_empty());
            assert!(!store.read_generic(cluster, keys::GOSSIP_KEY).is_empty());
        }
        assert_ne!(
            store.read_generic("dc1", keys::BOOTSTRAP_TOKEN),
            store.read_generic("dc2", keys::BOOTSTRAP_TOKEN)
        );

        let bootstrap = store.read_generic("dc1", keys::BOOTSTRAP_TOKEN);
        assert_eq!(store.read_agent_token("dc1", &NodeId::new("dc1-server2", "")), bootstrap);
        assert_eq!(store.read_agent_token("dc1", &NodeId::new("dc1-client1", "")), "");

        // a second pass keeps what exists
        init_secrets(&store, &topo);
        assert_eq!(store.read_generic("dc1", keys::BOOTSTRAP_TOKEN), bootstrap);
    }

    #[test]
    fn test_tls_names_count_per_kind() {
        let mut topo = topology();
        assign_tls_names(&mut topo);

        let prefixes: Vec<&str> = topo.clusters["dc1"]
            .nodes
            .iter()
            .map(|n| n.tls_cert_prefix.as_str())
            .collect();
        assert_eq!(
            prefixes,
            vec![
                "dc1-server-consul-0",
                "dc1-server-consul-1",
                "dc1-client-consul-0",
                "dc1-client-consul-1",
            ]
        );
        assert_eq!(topo.clusters["dc2"].nodes[1].tls_cert_prefix, "");
    }

    #[tokio::test]
    async fn test_build_images_once_per_distinct_set() {
        let topo = topology();
        let distinct = topo.node_images().len();

        let mut artifacts = MockArtifactBuilder::new();
        artifacts
            .expect_build_images()
            .times(distinct)
            .returning(|_| Ok(()));
        build_images(&artifacts, &topo).await.unwrap();
    }
}
