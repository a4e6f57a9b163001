//! Cluster peering: token exchange and waiting for replication.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use meshbed_common::retry::{poll_until, policies, retry_when, Attempt};
use meshbed_common::Error;
use meshbed_topology::{Cluster, PeerCluster, Topology};

use crate::api::{ClusterApi, PeeringEstablishRequest, PeeringState, PeeringTokenRequest};

use super::retry_token_race;

/// API clients of a deployment, by cluster name
pub type ClusterClients = BTreeMap<String, Arc<dyn ClusterApi>>;

fn client_for<'a>(clients: &'a ClusterClients, cluster: &str) -> Result<&'a dyn ClusterApi, Error> {
    clients
        .get(cluster)
        .map(|c| &**c)
        .ok_or_else(|| Error::internal(format!("no api client for cluster {cluster}")))
}

fn partition_of(cluster: &Cluster, side: &PeerCluster) -> String {
    if cluster.enterprise {
        side.partition.clone()
    } else {
        String::new()
    }
}

/// Generate a token on each accepting side and hand it to the dialing side.
///
/// Token generation retries while the caller's token has not replicated;
/// establishing also retries a gateway timeout from the servers.
pub async fn establish_peerings(clients: &ClusterClients, topology: &Topology) -> Result<(), Error> {
    for peering in &topology.peerings {
        let dialing = topology.cluster(&peering.dialing.name)?;
        let accepting = topology.cluster(&peering.accepting.name)?;
        let dialing_client = client_for(clients, &dialing.name)?;
        let accepting_client = client_for(clients, &accepting.name)?;

        let token_request = PeeringTokenRequest {
            peer_name: peering.accepting.peer_name.clone(),
            partition: partition_of(accepting, &peering.accepting),
        };
        let token_request = &token_request;
        let peering_token = retry_token_race("generate_peering_token", || async move {
            accepting_client.generate_peering_token(token_request).await
        })
        .await?;

        let establish_request = PeeringEstablishRequest {
            peer_name: peering.dialing.peer_name.clone(),
            peering_token,
            partition: partition_of(dialing, &peering.dialing),
        };
        let establish_request = &establish_request;
        retry_when(
            &policies::TOKEN_RACE,
            "establish_peering",
            |e: &Error| e.is_acl_not_found() || e.is_gateway_timeout(),
            || async move { dialing_client.establish_peering(establish_request).await },
        )
        .await?;

        debug!(peering = %peering, "peering established");
    }
    Ok(())
}

/// Block until both sides of every peering report it active
pub async fn wait_for_peerings_active(clients: &ClusterClients, topology: &Topology) -> Result<(), Error> {
    for peering in &topology.peerings {
        for side in [&peering.dialing, &peering.accepting] {
            let cluster = topology.cluster(&side.name)?;
            let client = client_for(clients, &cluster.name)?;
            wait_for_side_active(client, cluster, side).await?;
        }
        info!(peering = %peering, "peering active");
    }
    Ok(())
}

async fn wait_for_side_active(
    client: &dyn ClusterApi,
    cluster: &Cluster,
    side: &PeerCluster,
) -> Result<(), Error> {
    let partition = partition_of(cluster, side);
    let partition = partition.as_str();
    let name = side.peer_name.as_str();

    poll_until("wait_for_peering_active", || async move {
        let attempt = match client.read_peering(name, partition).await {
            Err(e) => Attempt::again(&policies::PEERING_LOOKUP, format!("error looking up peering: {e}")),
            Ok(None) => Attempt::again(&policies::PEERING_LOOKUP, "peering not found"),
            Ok(Some(info)) if info.state == PeeringState::Active => Attempt::Done(()),
            Ok(Some(info)) => Attempt::again(
                &policies::PEERING_PENDING,
                format!("peering not active yet: {:?}", info.state),
            ),
        };
        Ok::<_, Error>(attempt)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MockClusterApi, PeeringInfo};
    use crate::phases::testing::launched_topology;
    use meshbed_common::error::ACL_NOT_FOUND;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn clients(dc1: MockClusterApi, dc2: MockClusterApi) -> ClusterClients {
        let mut out: ClusterClients = BTreeMap::new();
        out.insert("dc1".into(), Arc::new(dc1));
        out.insert("dc2".into(), Arc::new(dc2));
        out
    }

    fn info(state: PeeringState) -> Option<PeeringInfo> {
        Some(PeeringInfo {
            id: "p1".into(),
            name: "peer".into(),
            state,
            ..Default::default()
        })
    }

    // ==========================================================================
    // Story Tests: Establishing a peering
    // ==========================================================================

    /// Story: the acceptor's token has not replicated on the first try and
    /// the dialer's servers time out once; both are retried and the token
    /// ends up on the dialing side
    #[tokio::test(start_paused = true)]
    async fn story_peering_established_through_transient_errors() {
        let topo = launched_topology();
        let generated = Arc::new(AtomicU32::new(0));
        let established = Arc::new(AtomicU32::new(0));
        let (g, e) = (generated.clone(), established.clone());

        let mut dc2 = MockClusterApi::new();
        dc2.expect_generate_peering_token()
            .withf(|r| r.peer_name == "peer-dc1-default" && r.partition.is_empty())
            .returning(move |_| {
                if g.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::api_status("dc2", 403, ACL_NOT_FOUND))
                } else {
                    Ok("token-from-dc2".to_string())
                }
            });

        let mut dc1 = MockClusterApi::new();
        dc1.expect_establish_peering()
            .withf(|r| r.peer_name == "peer-dc2-default" && r.peering_token == "token-from-dc2")
            .returning(move |_| {
                if e.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::api_status("dc1", 504, "Gateway Timeout"))
                } else {
                    Ok(())
                }
            });

        establish_peerings(&clients(dc1, dc2), &topo).await.unwrap();
        assert_eq!(generated.load(Ordering::SeqCst), 2);
        assert_eq!(established.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_establish_fails_on_other_errors() {
        let topo = launched_topology();
        let mut dc2 = MockClusterApi::new();
        dc2.expect_generate_peering_token()
            .returning(|_| Ok("t".to_string()));
        let mut dc1 = MockClusterApi::new();
        dc1.expect_establish_peering()
            .times(1)
            .returning(|_| Err(Error::api_status("dc1", 400, "invalid peering token")));

        let err = establish_peerings(&clients(dc1, dc2), &topo).await.unwrap_err();
        assert!(err.to_string().contains("invalid peering token"));
        assert_eq!(err.cluster(), Some("dc1"));
    }

    // ==========================================================================
    // Story Tests: Waiting for peerings to activate
    // ==========================================================================

    /// Story: the dialer's lookup errors once and then shows the peering
    /// establishing before it turns active; the acceptor is active at once
    #[tokio::test(start_paused = true)]
    async fn story_peering_becomes_active_after_transient_error() {
        let topo = launched_topology();
        let reads = Arc::new(AtomicU32::new(0));
        let r = reads.clone();

        let mut dc1 = MockClusterApi::new();
        dc1.expect_read_peering()
            .with(eq("peer-dc2-default"), eq(""))
            .returning(move |_, _| match r.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::api_status("dc1", 500, "rpc error")),
                1 => Ok(None),
                2 => Ok(info(PeeringState::Establishing)),
                _ => Ok(info(PeeringState::Active)),
            });
        let mut dc2 = MockClusterApi::new();
        dc2.expect_read_peering()
            .with(eq("peer-dc1-default"), eq(""))
            .times(1)
            .returning(|_, _| Ok(info(PeeringState::Active)));

        let start = tokio::time::Instant::now();
        wait_for_peerings_active(&clients(dc1, dc2), &topo).await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(100 + 100 + 500));
    }

    #[tokio::test]
    async fn test_missing_client_is_internal_error() {
        let topo = launched_topology();
        let mut only: ClusterClients = BTreeMap::new();
        only.insert("dc1".into(), Arc::new(MockClusterApi::new()));
        let err = establish_peerings(&only, &topo).await.unwrap_err();
        assert!(err.to_string().contains("no api client for cluster dc2"));
    }
}
