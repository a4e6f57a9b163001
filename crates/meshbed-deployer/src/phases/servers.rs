//! Server cluster formation: gossip join, leader election, ACL bootstrap and
//! local write readiness.

use tracing::{debug, info, warn};

use meshbed_common::retry::{poll_until, policies, retry_when, Attempt};
use meshbed_common::Error;
use meshbed_topology::{Cluster, Node, NodeId, Topology};

use crate::api::{ClusterApi, ClusterApiFactory};
use crate::secrets::{keys, SecretStore};

use super::tenancy::ensure_partition;

/// KV key written to prove the servers accept writes
pub const LOCAL_WRITE_KEY: &str = "local-test";

/// Partition created to prove enterprise servers accept partition writes
pub const PLACEHOLDER_PARTITION: &str = "placeholder";

/// Ask the first server to join every other server.
///
/// Each join is retried until it succeeds; a server that is still starting
/// refuses gossip for a while.
pub async fn rejoin_servers(
    factory: &dyn ClusterApiFactory,
    secrets: &dyn SecretStore,
    topology: &Topology,
    cluster_name: &str,
) -> Result<(), Error> {
    let cluster = topology.cluster(cluster_name)?;
    let servers = cluster.server_nodes();
    let Some((first, rest)) = servers.split_first() else {
        return Err(Error::config(format!(
            "cluster {cluster_name} has no enabled servers"
        )));
    };

    let recovery = secrets.read_generic(cluster_name, keys::AGENT_RECOVERY);
    let client = factory.agent_client(topology, cluster_name, &first.id(), &recovery)?;
    let client = &*client;

    for server in rest {
        let address = server.local_address().ok_or_else(|| {
            Error::internal(format!("server {} has no local address", server.id()))
        })?;
        retry_when(
            &policies::LEADER,
            "join_server",
            |_: &Error| true,
            || async move { client.agent_join(address).await },
        )
        .await?;
        debug!(cluster = %cluster_name, from = %first.id(), to = %server.id(), "joined server");
    }
    Ok(())
}

/// Block until the cluster reports a leader that is one of its enabled
/// servers, and return that server.
///
/// Lookup errors, an empty answer and an address that matches no server all
/// mean "not yet".
pub async fn wait_for_leader(client: &dyn ClusterApi, cluster: &Cluster) -> Result<NodeId, Error> {
    let leader = poll_until("wait_for_leader", || async move {
        let attempt = match client.status_leader().await {
            Err(e) => Attempt::again(&policies::LEADER, format!("leader lookup failed: {e}")),
            Ok(addr) if addr.is_empty() => Attempt::again(&policies::LEADER, "no leader elected"),
            Ok(addr) => match cluster.server_by_addr(&addr) {
                Some(node) => Attempt::Done(node.id()),
                None => Attempt::again(&policies::LEADER, format!("leader {addr} is not a known server")),
            },
        };
        Ok::<_, Error>(attempt)
    })
    .await?;

    info!(cluster = %cluster.name, leader = %leader, "leader elected");
    Ok(leader)
}

/// Look up the current leader once
pub async fn find_leader<'a>(client: &dyn ClusterApi, cluster: &'a Cluster) -> Result<&'a Node, Error> {
    let addr = client.status_leader().await?;
    cluster
        .server_by_addr(&addr)
        .ok_or_else(|| Error::api(&cluster.name, "leader not found"))
}

/// Bootstrap the ACL system with the stored bootstrap token.
///
/// A cluster that already honors the token is left alone, which makes the
/// step safe to repeat. Bootstrapping is retried while the servers report
/// the ACL system is not ready, and a cluster that was bootstrapped in the
/// meantime counts as done. Returns once the token resolves.
pub async fn bootstrap_acls(
    factory: &dyn ClusterApiFactory,
    secrets: &dyn SecretStore,
    topology: &Topology,
    cluster_name: &str,
) -> Result<(), Error> {
    let bootstrap = secrets.read_generic(cluster_name, keys::BOOTSTRAP_TOKEN);
    let management = factory.cluster_client(topology, cluster_name, &bootstrap)?;
    let management = &*management;

    if management.read_self_token().await.is_ok() {
        debug!(cluster = %cluster_name, "acls already bootstrapped");
        return Ok(());
    }

    let anonymous = factory.cluster_client(topology, cluster_name, "")?;
    let anonymous = &*anonymous;
    let secret = bootstrap.as_str();

    let bootstrapped = retry_when(
        &policies::ACL_BOOTSTRAP,
        "acl_bootstrap",
        |e: &Error| e.is_acl_not_bootstrapped(),
        || async move { anonymous.acl_bootstrap(secret).await },
    )
    .await;
    match bootstrapped {
        Ok(_) => info!(cluster = %cluster_name, "acls bootstrapped"),
        Err(e) if e.is_acl_bootstrap_done() => {
            warn!(cluster = %cluster_name, "acls were bootstrapped by someone else")
        }
        Err(e) => return Err(e),
    }

    poll_until("acl_token_live", || async move {
        Ok::<_, Error>(match management.read_self_token().await {
            Ok(_) => Attempt::Done(()),
            Err(e) => Attempt::again(&policies::ACL_BOOTSTRAP, e.to_string()),
        })
    })
    .await
}

/// Block until the servers accept a KV write, and on enterprise clusters a
/// partition write too
pub async fn wait_for_local_writes(client: &dyn ClusterApi, cluster: &Cluster) -> Result<(), Error> {
    let payload = format!("payload-for-local-test-in-{}", cluster.name);
    let payload = payload.as_bytes();

    retry_when(
        &policies::LOCAL_WRITES,
        "local_kv_write",
        |_: &Error| true,
        || async move { client.kv_put(LOCAL_WRITE_KEY, payload).await },
    )
    .await?;

    if cluster.enterprise {
        retry_when(
            &policies::LOCAL_WRITES,
            "local_partition_write",
            |_: &Error| true,
            || ensure_partition(client, PLACEHOLDER_PARTITION),
        )
        .await?;
    }

    debug!(cluster = %cluster.name, "servers accept writes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AclToken, AdminPartition, MockClusterApi, MockClusterApiFactory};
    use crate::phases::testing::launched_topology;
    use crate::secrets::MemorySecretStore;
    use meshbed_common::error::{ACL_BOOTSTRAP_DONE, ACL_NOT_BOOTSTRAPPED, ACL_NOT_FOUND};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn server_addr(topology: &Topology, cluster: &str, name: &str) -> String {
        let node = topology.clusters[cluster]
            .node_by_id(&NodeId::new(name, ""))
            .unwrap();
        format!("{}:8300", node.local_address().unwrap())
    }

    fn factory_with(api: MockClusterApi) -> MockClusterApiFactory {
        let api: Arc<dyn ClusterApi> = Arc::new(api);
        let mut factory = MockClusterApiFactory::new();
        let a = api.clone();
        factory
            .expect_cluster_client()
            .returning(move |_, _, _| Ok(a.clone()));
        factory
            .expect_agent_client()
            .returning(move |_, _, _, _| Ok(api.clone()));
        factory
    }

    // ==========================================================================
    // Story Tests: Waiting for a leader
    // ==========================================================================

    /// Story: the cluster has no leader for two polls, then elects one of its
    /// servers
    #[tokio::test(start_paused = true)]
    async fn story_leader_appears_after_election() {
        let topo = launched_topology();
        let addr = server_addr(&topo, "dc1", "dc1-server2");
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut api = MockClusterApi::new();
        api.expect_status_leader().returning(move || {
            match c.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(String::new()),
                1 => Err(Error::api("dc1", "connection refused")),
                _ => Ok(addr.clone()),
            }
        });

        let start = tokio::time::Instant::now();
        let leader = wait_for_leader(&api, &topo.clusters["dc1"]).await.unwrap();
        assert_eq!(leader, NodeId::new("dc1-server2", ""));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    /// Story: a leader address outside the cluster is ignored until a known
    /// server takes over
    #[tokio::test(start_paused = true)]
    async fn story_unknown_leader_address_is_not_accepted() {
        let topo = launched_topology();
        let addr = server_addr(&topo, "dc1", "dc1-server1");
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut api = MockClusterApi::new();
        api.expect_status_leader().returning(move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok("192.0.2.1:8300".to_string())
            } else {
                Ok(addr.clone())
            }
        });

        let leader = wait_for_leader(&api, &topo.clusters["dc1"]).await.unwrap();
        assert_eq!(leader.name, "dc1-server1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_find_leader_single_shot() {
        let topo = launched_topology();
        let mut api = MockClusterApi::new();
        api.expect_status_leader()
            .times(1)
            .returning(|| Ok(String::new()));

        let err = find_leader(&api, &topo.clusters["dc1"]).await.unwrap_err();
        assert!(err.to_string().contains("leader not found"));
    }

    // ==========================================================================
    // Story Tests: Bootstrapping ACLs
    // ==========================================================================

    /// Story: the servers are not ready for ACL bootstrap twice, then accept
    /// the stored token, and the step waits for it to resolve
    #[tokio::test(start_paused = true)]
    async fn story_bootstrap_retried_until_acls_ready() {
        let topo = launched_topology();
        let store = MemorySecretStore::new();
        store.save_generic("dc1", keys::BOOTSTRAP_TOKEN, "boot");

        let self_calls = Arc::new(AtomicU32::new(0));
        let boot_calls = Arc::new(AtomicU32::new(0));
        let (s, b) = (self_calls.clone(), boot_calls.clone());

        let mut api = MockClusterApi::new();
        api.expect_read_self_token().returning(move || {
            // first readiness and first liveness check fail
            if s.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::api_status("dc1", 403, ACL_NOT_FOUND))
            } else {
                Ok(AclToken::default())
            }
        });
        api.expect_acl_bootstrap()
            .withf(|secret| secret == "boot")
            .returning(move |_| {
                if b.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::api_status("dc1", 500, ACL_NOT_BOOTSTRAPPED))
                } else {
                    Ok(AclToken::default())
                }
            });

        let factory = factory_with(api);
        bootstrap_acls(&factory, &store, &topo, "dc1").await.unwrap();
        assert_eq!(boot_calls.load(Ordering::SeqCst), 3);
        assert_eq!(self_calls.load(Ordering::SeqCst), 3);
    }

    /// Story: a relaunch finds the token already honored and skips bootstrap
    #[tokio::test]
    async fn story_bootstrap_skipped_when_token_resolves() {
        let topo = launched_topology();
        let store = MemorySecretStore::new();

        let mut api = MockClusterApi::new();
        api.expect_read_self_token()
            .times(1)
            .returning(|| Ok(AclToken::default()));
        api.expect_acl_bootstrap().never();

        let factory = factory_with(api);
        bootstrap_acls(&factory, &store, &topo, "dc1").await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_already_done_is_success() {
        let topo = launched_topology();
        let store = MemorySecretStore::new();
        let reads = Arc::new(AtomicU32::new(0));
        let p = reads.clone();

        let mut api = MockClusterApi::new();
        api.expect_read_self_token().returning(move || {
            if p.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::api_status("dc1", 403, ACL_NOT_FOUND))
            } else {
                Ok(AclToken::default())
            }
        });
        api.expect_acl_bootstrap()
            .times(1)
            .returning(|_| Err(Error::api_status("dc1", 403, ACL_BOOTSTRAP_DONE)));

        let factory = factory_with(api);
        bootstrap_acls(&factory, &store, &topo, "dc1").await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_unexpected_error_fails() {
        let topo = launched_topology();
        let store = MemorySecretStore::new();

        let mut api = MockClusterApi::new();
        api.expect_read_self_token()
            .returning(|| Err(Error::api_status("dc1", 403, ACL_NOT_FOUND)));
        api.expect_acl_bootstrap()
            .times(1)
            .returning(|_| Err(Error::api_status("dc1", 500, "disk full")));

        let factory = factory_with(api);
        let err = bootstrap_acls(&factory, &store, &topo, "dc1").await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    // ==========================================================================
    // Story Tests: Joining servers and local writes
    // ==========================================================================

    /// Story: the second server refuses gossip once while starting
    #[tokio::test(start_paused = true)]
    async fn story_join_retried_until_server_listens() {
        let topo = launched_topology();
        let store = MemorySecretStore::new();
        store.save_generic("dc1", keys::AGENT_RECOVERY, "recovery");
        let expected = server_addr(&topo, "dc1", "dc1-server2");
        let expected = expected.trim_end_matches(":8300").to_string();

        let joins = Arc::new(AtomicU32::new(0));
        let j = joins.clone();
        let mut api = MockClusterApi::new();
        api.expect_agent_join()
            .withf(move |addr| addr == expected)
            .returning(move |_| {
                if j.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::api("dc1", "connection refused"))
                } else {
                    Ok(())
                }
            });

        let mut factory = MockClusterApiFactory::new();
        let api: Arc<dyn ClusterApi> = Arc::new(api);
        factory
            .expect_agent_client()
            .withf(|_, cluster, node, token| {
                cluster == "dc1" && node.name == "dc1-server1" && token == "recovery"
            })
            .returning(move |_, _, _, _| Ok(api.clone()));

        rejoin_servers(&factory, &store, &topo, "dc1").await.unwrap();
        assert_eq!(joins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_writes_on_enterprise_create_placeholder_partition() {
        let topo = launched_topology();
        let mut cluster = topo.clusters["dc1"].clone();
        cluster.enterprise = true;

        let puts = Arc::new(AtomicU32::new(0));
        let p = puts.clone();
        let mut api = MockClusterApi::new();
        api.expect_kv_put()
            .withf(|key, value| key == LOCAL_WRITE_KEY && value == b"payload-for-local-test-in-dc1")
            .returning(move |_, _| {
                if p.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::api_status("dc1", 500, "No cluster leader"))
                } else {
                    Ok(())
                }
            });
        api.expect_list_partitions()
            .returning(|| Ok(vec![AdminPartition { name: "default".into(), ..Default::default() }]));
        api.expect_create_partition()
            .withf(|p| p.name == PLACEHOLDER_PARTITION)
            .times(1)
            .returning(|_| Ok(()));

        wait_for_local_writes(&api, &cluster).await.unwrap();
        assert_eq!(puts.load(Ordering::SeqCst), 2);
    }
}
