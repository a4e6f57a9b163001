//! ACL tokens for anonymous access, agents and services.

use tracing::debug;

use meshbed_common::Error;
use meshbed_topology::Cluster;

use crate::acl::{
    agent_token, anonymous_policy, anonymous_token, create_or_update_policy,
    create_or_update_token, mesh_gateway_policy, service_token,
};
use crate::api::ClusterApi;
use crate::secrets::SecretStore;

/// Grant anonymous requests read access to the catalog
pub async fn create_anonymous_token(client: &dyn ClusterApi, cluster: &Cluster) -> Result<(), Error> {
    create_or_update_policy(client, &anonymous_policy(cluster)).await?;
    create_or_update_token(client, &anonymous_token(cluster)).await?;
    Ok(())
}

/// Create a token for every agent that has none stored yet.
///
/// Disabled agents are included so enabling them on a relaunch does not
/// need a token first.
pub async fn create_agent_tokens(
    client: &dyn ClusterApi,
    secrets: &dyn SecretStore,
    cluster: &Cluster,
) -> Result<(), Error> {
    for node in cluster.nodes.iter().filter(|n| n.is_agent()) {
        let id = node.id();
        if !secrets.read_agent_token(&cluster.name, &id).is_empty() {
            continue;
        }
        let token = create_or_update_token(client, &agent_token(cluster, node)).await?;
        secrets.save_agent_token(&cluster.name, &id, &token.secret_id);
        debug!(cluster = %cluster.name, node = %id, "created agent token");
    }
    Ok(())
}

/// Create a token for every service on an enabled node that has none
/// stored yet. Mesh gateways get their partition's gateway policy first.
pub async fn create_service_tokens(
    client: &dyn ClusterApi,
    secrets: &dyn SecretStore,
    cluster: &Cluster,
) -> Result<(), Error> {
    for node in cluster.active_nodes() {
        for service in &node.services {
            if !secrets.read_service_token(&cluster.name, &service.id).is_empty() {
                continue;
            }
            if service.is_mesh_gateway {
                create_or_update_policy(client, &mesh_gateway_policy(cluster, &service.id.partition))
                    .await?;
            }
            let token = create_or_update_token(client, &service_token(cluster, service)).await?;
            secrets.save_service_token(&cluster.name, &service.id, &token.secret_id);
            debug!(cluster = %cluster.name, service = %service.id, "created service token");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{ANONYMOUS_POLICY, ANONYMOUS_TOKEN_ACCESSOR};
    use crate::api::{AclPolicy, AclToken, MockClusterApi};
    use crate::phases::testing::launched_topology;
    use crate::secrets::MemorySecretStore;
    use meshbed_topology::{NodeId, ServiceId};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Mock that knows no tokens or policies and hands out numbered secrets
    fn empty_cluster_api() -> (MockClusterApi, Arc<AtomicU32>) {
        let created = Arc::new(AtomicU32::new(0));
        let c = created.clone();
        let mut api = MockClusterApi::new();
        api.expect_list_tokens().returning(|_| Ok(vec![]));
        api.expect_read_policy_by_name().returning(|_, _| Ok(None));
        api.expect_create_policy().returning(|p| Ok(p.clone()));
        api.expect_create_token().returning(move |t| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            Ok(AclToken {
                accessor_id: format!("a{n}"),
                secret_id: format!("s{n}"),
                ..t.clone()
            })
        });
        (api, created)
    }

    #[tokio::test]
    async fn test_anonymous_token_updates_builtin() {
        let topo = launched_topology();
        let mut api = MockClusterApi::new();
        api.expect_read_policy_by_name().returning(|_, _| Ok(None));
        api.expect_create_policy()
            .withf(|p| p.name == ANONYMOUS_POLICY)
            .times(1)
            .returning(|p| Ok(p.clone()));
        api.expect_list_tokens().returning(|_| {
            Ok(vec![AclToken {
                accessor_id: ANONYMOUS_TOKEN_ACCESSOR.into(),
                description: "Anonymous Token".into(),
                ..Default::default()
            }])
        });
        api.expect_read_token().returning(|id, _| {
            Ok(AclToken {
                accessor_id: id.to_string(),
                secret_id: "anonymous".into(),
                ..Default::default()
            })
        });
        api.expect_update_token()
            .withf(|t| t.accessor_id == ANONYMOUS_TOKEN_ACCESSOR && t.policies.len() == 1)
            .times(1)
            .returning(|t| Ok(t.clone()));
        api.expect_create_token().never();

        create_anonymous_token(&api, &topo.clusters["dc1"]).await.unwrap();
    }

    /// Story: servers already hold the bootstrap token, so only the two
    /// clients (one of them disabled) get new agent tokens, and a second
    /// pass creates nothing
    #[tokio::test]
    async fn story_agent_tokens_created_once() {
        let topo = launched_topology();
        let cluster = &topo.clusters["dc1"];
        let store = MemorySecretStore::new();
        for server in cluster.nodes.iter().filter(|n| n.is_server()) {
            store.save_agent_token("dc1", &server.id(), "boot");
        }

        let (api, created) = empty_cluster_api();
        create_agent_tokens(&api, &store, cluster).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert!(!store.read_agent_token("dc1", &NodeId::new("dc1-client2", "")).is_empty());
        assert_eq!(store.read_agent_token("dc1", &NodeId::new("dc1-server1", "")), "boot");

        create_agent_tokens(&api, &store, cluster).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_service_tokens_skip_disabled_nodes_and_stored_tokens() {
        let mut topo = launched_topology();
        let cluster = topo.clusters.get_mut("dc2").unwrap();
        let store = MemorySecretStore::new();

        let (api, created) = empty_cluster_api();
        create_service_tokens(&api, &store, cluster).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        let pong = ServiceId::new("pong", "", "");
        assert_eq!(store.read_service_token("dc2", &pong), "s0");

        // disabling the node or holding a token both mean nothing is created
        create_service_tokens(&api, &store, cluster).await.unwrap();
        cluster.nodes[1].disabled = true;
        let fresh = MemorySecretStore::new();
        create_service_tokens(&api, &fresh, cluster).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mesh_gateway_policy_created_before_token() {
        let mut topo = launched_topology();
        let cluster = topo.clusters.get_mut("dc2").unwrap();
        cluster.nodes[1].services[0].is_mesh_gateway = true;
        let store = MemorySecretStore::new();

        let mut seq = mockall::Sequence::new();
        let mut api = MockClusterApi::new();
        api.expect_read_policy_by_name()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        api.expect_create_policy()
            .withf(|p: &AclPolicy| p.name == "mesh-gateway--default")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|p| Ok(p.clone()));
        api.expect_list_tokens()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![]));
        api.expect_create_token()
            .withf(|t| t.policies.iter().any(|l| l.name == "mesh-gateway--default"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|t| Ok(AclToken { secret_id: "gw".into(), ..t.clone() }));

        create_service_tokens(&api, &store, cluster).await.unwrap();
    }
}
