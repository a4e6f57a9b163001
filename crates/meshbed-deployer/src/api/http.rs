//! HTTP implementation of [`ClusterApi`].
//!
//! Agents only listen on container networks, so every request goes through
//! the forward proxy the provisioner runs for the node's local network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use meshbed_common::Error;
use meshbed_topology::topology::AGENT_HTTP_PORT;
use meshbed_topology::{ConfigEntry, Node, NodeId, Topology};

use super::types::*;
use super::{ClusterApi, ClusterApiFactory};

/// Header carrying the ACL secret
pub const TOKEN_HEADER: &str = "X-Consul-Token";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds [`HttpClusterApi`] clients from the addresses in a topology
#[derive(Clone, Debug)]
pub struct HttpClusterApiFactory {
    timeout: Duration,
}

impl Default for HttpClusterApiFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClusterApiFactory {
    /// Factory with a 30s request timeout
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Factory with a custom request timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client_for_node(
        &self,
        cluster: &str,
        node: &Node,
        token: &str,
    ) -> Result<Arc<dyn ClusterApi>, Error> {
        let address = node.local_address().ok_or_else(|| {
            Error::internal_with_context(
                "api_client",
                format!("node {} in cluster {cluster:?} has no local address yet", node.id()),
            )
        })?;
        let proxy_port = node.local_proxy_port().ok_or_else(|| {
            Error::internal_with_context(
                "api_client",
                format!("network of node {} in cluster {cluster:?} has no proxy yet", node.id()),
            )
        })?;
        let client = HttpClusterApi::new(
            cluster,
            format!("http://{address}:{AGENT_HTTP_PORT}"),
            proxy_port,
            token,
            self.timeout,
        )?;
        Ok(Arc::new(client))
    }
}

impl ClusterApiFactory for HttpClusterApiFactory {
    fn cluster_client(
        &self,
        topology: &Topology,
        cluster: &str,
        token: &str,
    ) -> Result<Arc<dyn ClusterApi>, Error> {
        let c = topology.cluster(cluster)?;
        let server = c.first_server().ok_or_else(|| {
            Error::internal_with_context(
                "api_client",
                format!("no server with an exposed api port in cluster {cluster:?}"),
            )
        })?;
        self.client_for_node(cluster, server, token)
    }

    fn agent_client(
        &self,
        topology: &Topology,
        cluster: &str,
        node: &NodeId,
        token: &str,
    ) -> Result<Arc<dyn ClusterApi>, Error> {
        let c = topology.cluster(cluster)?;
        let n = c.node_by_id(node).ok_or_else(|| {
            Error::internal_with_context(
                "api_client",
                format!("no node {node} in cluster {cluster:?}"),
            )
        })?;
        if !n.is_agent() {
            return Err(Error::internal_with_context(
                "api_client",
                format!("node {node} in cluster {cluster:?} is not an agent"),
            ));
        }
        self.client_for_node(cluster, n, token)
    }
}

/// [`ClusterApi`] over HTTP, routed through a network's forward proxy
#[derive(Debug)]
pub struct HttpClusterApi {
    cluster: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpClusterApi {
    /// Create a client for the agent at `base_url`, reached through the
    /// proxy listening on `proxy_port` of the local host.
    ///
    /// An empty `token` sends no token header, which the server treats as
    /// the anonymous token.
    pub fn new(
        cluster: &str,
        base_url: impl Into<String>,
        proxy_port: u16,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let proxy = reqwest::Proxy::all(format!("http://127.0.0.1:{proxy_port}"))
            .map_err(|e| Error::api(cluster, format!("invalid proxy: {e}")))?;

        let mut headers = HeaderMap::new();
        if !token.is_empty() {
            let value = HeaderValue::from_str(token)
                .map_err(|e| Error::api(cluster, format!("invalid token header: {e}")))?;
            headers.insert(TOKEN_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::api(cluster, format!("failed to build http client: {e}")))?;

        Ok(Self {
            cluster: cluster.to_string(),
            base_url: base_url.into(),
            client,
        })
    }

    /// Cluster the client talks to
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, Error> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::api(&self.cluster, format!("request failed: {e}")))?;

        let status = response.status();
        trace!(cluster = %self.cluster, status = %status, url = %response.url(), "api response");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::api_status(&self.cluster, status.as_u16(), body.trim()))
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T, Error> {
        response
            .json()
            .await
            .map_err(|e| Error::api(&self.cluster, format!("invalid JSON: {e}")))
    }

    async fn read_bytes(&self, response: Response) -> Result<Vec<u8>, Error> {
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::api(&self.cluster, format!("failed to read body: {e}")))?;
        Ok(body.to_vec())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, partition: &str) -> Result<T, Error> {
        let request = self
            .client
            .get(self.url(path))
            .query(&partition_query(partition));
        let response = self.send(request).await?;
        self.decode(response).await
    }

    /// Like [`Self::get_json`], but a 404 is `None`
    async fn find_json<T: DeserializeOwned>(
        &self,
        path: &str,
        partition: &str,
    ) -> Result<Option<T>, Error> {
        match self.get_json(path, partition).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let response = self.send(self.client.put(self.url(path)).json(body)).await?;
        self.decode(response).await
    }

    async fn put_unit<B>(&self, path: &str, body: &B) -> Result<(), Error>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.send(self.client.put(self.url(path)).json(body)).await?;
        Ok(())
    }
}

fn partition_query(partition: &str) -> Vec<(&'static str, String)> {
    if partition.is_empty() {
        Vec::new()
    } else {
        vec![("partition", partition.to_string())]
    }
}

#[async_trait]
impl ClusterApi for HttpClusterApi {
    async fn acl_bootstrap(&self, secret: &str) -> Result<AclToken, Error> {
        self.put_json(
            "/v1/acl/bootstrap",
            &serde_json::json!({ "BootstrapSecret": secret }),
        )
        .await
    }

    async fn read_self_token(&self) -> Result<AclToken, Error> {
        self.get_json("/v1/acl/token/self", "").await
    }

    async fn list_tokens(&self, partition: &str) -> Result<Vec<AclToken>, Error> {
        let tokens: Option<Vec<AclToken>> = self.get_json("/v1/acl/tokens", partition).await?;
        Ok(tokens.unwrap_or_default())
    }

    async fn read_token(&self, accessor_id: &str, partition: &str) -> Result<AclToken, Error> {
        self.get_json(&format!("/v1/acl/token/{accessor_id}"), partition)
            .await
    }

    async fn create_token(&self, token: &AclToken) -> Result<AclToken, Error> {
        self.put_json("/v1/acl/token", token).await
    }

    async fn update_token(&self, token: &AclToken) -> Result<AclToken, Error> {
        self.put_json(&format!("/v1/acl/token/{}", token.accessor_id), token)
            .await
    }

    async fn read_policy_by_name(
        &self,
        name: &str,
        partition: &str,
    ) -> Result<Option<AclPolicy>, Error> {
        self.find_json(&format!("/v1/acl/policy/name/{name}"), partition)
            .await
    }

    async fn create_policy(&self, policy: &AclPolicy) -> Result<AclPolicy, Error> {
        self.put_json("/v1/acl/policy", policy).await
    }

    async fn update_policy(&self, policy: &AclPolicy) -> Result<AclPolicy, Error> {
        self.put_json(&format!("/v1/acl/policy/{}", policy.id), policy)
            .await
    }

    async fn catalog_register(&self, registration: &CatalogRegistration) -> Result<(), Error> {
        self.put_unit("/v1/catalog/register", registration).await
    }

    async fn catalog_deregister(
        &self,
        deregistration: &CatalogDeregistration,
    ) -> Result<(), Error> {
        self.put_unit("/v1/catalog/deregister", deregistration)
            .await
    }

    async fn catalog_nodes(&self, partition: &str) -> Result<Vec<CatalogNode>, Error> {
        let nodes: Option<Vec<CatalogNode>> = self.get_json("/v1/catalog/nodes", partition).await?;
        Ok(nodes.unwrap_or_default())
    }

    async fn agent_service_register(
        &self,
        registration: &AgentServiceRegistration,
    ) -> Result<(), Error> {
        self.put_unit("/v1/agent/service/register", registration)
            .await
    }

    async fn agent_join(&self, address: &str) -> Result<(), Error> {
        self.send(self.client.put(self.url(&format!("/v1/agent/join/{address}"))))
            .await?;
        Ok(())
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let request = self
            .client
            .put(self.url(&format!("/v1/kv/{key}")))
            .body(value.to_vec());
        self.send(request).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let request = self.client.get(self.url(&format!("/v1/kv/{key}"))).query(&[("raw", "")]);
        match self.send(request).await {
            Ok(response) => Ok(Some(self.read_bytes(response).await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn snapshot_save(&self) -> Result<Vec<u8>, Error> {
        let response = self.send(self.client.get(self.url("/v1/snapshot"))).await?;
        self.read_bytes(response).await
    }

    async fn snapshot_restore(&self, snapshot: &[u8]) -> Result<(), Error> {
        let request = self
            .client
            .put(self.url("/v1/snapshot"))
            .body(snapshot.to_vec());
        self.send(request).await?;
        Ok(())
    }

    async fn list_partitions(&self) -> Result<Vec<AdminPartition>, Error> {
        let partitions: Option<Vec<AdminPartition>> = self.get_json("/v1/partitions", "").await?;
        Ok(partitions.unwrap_or_default())
    }

    async fn create_partition(&self, partition: &AdminPartition) -> Result<(), Error> {
        self.put_unit("/v1/partition", partition).await
    }

    async fn list_namespaces(&self, partition: &str) -> Result<Vec<Namespace>, Error> {
        let namespaces: Option<Vec<Namespace>> =
            self.get_json("/v1/namespaces", partition).await?;
        Ok(namespaces.unwrap_or_default())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        self.put_unit("/v1/namespace", namespace).await
    }

    async fn set_config_entry(&self, entry: &ConfigEntry) -> Result<(), Error> {
        self.put_unit("/v1/config", entry).await
    }

    async fn generate_peering_token(
        &self,
        request: &PeeringTokenRequest,
    ) -> Result<String, Error> {
        let response = self
            .send(self.client.post(self.url("/v1/peering/token")).json(request))
            .await?;
        let body: PeeringTokenResponse = self.decode(response).await?;
        Ok(body.peering_token)
    }

    async fn establish_peering(&self, request: &PeeringEstablishRequest) -> Result<(), Error> {
        self.send(self.client.post(self.url("/v1/peering/establish")).json(request))
            .await?;
        Ok(())
    }

    async fn read_peering(
        &self,
        name: &str,
        partition: &str,
    ) -> Result<Option<PeeringInfo>, Error> {
        self.find_json(&format!("/v1/peering/{name}"), partition)
            .await
    }

    async fn status_leader(&self) -> Result<String, Error> {
        self.get_json("/v1/status/leader", "").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbed_topology::{compile, Config};

    fn topology() -> Topology {
        let cfg = Config::from_yaml_str(
            r#"
networks:
  - name: dc1
clusters:
  - name: dc1
    nodes:
      - kind: server
        name: dc1-server1
      - kind: dataplane
        name: dc1-dp1
"#,
        )
        .unwrap();
        compile(&cfg).unwrap()
    }

    fn launched(mut topo: Topology) -> Topology {
        topo.digest_subnet("dc1", "10.0.1.0/24").unwrap();
        topo.digest_proxy_port("dc1", 41001).unwrap();
        topo.assign_ips().unwrap();
        let cluster = topo.cluster_mut("dc1").unwrap();
        for node in &mut cluster.nodes {
            let ports = node.sorted_ports().into_iter().map(|p| (p, p + 30000)).collect();
            node.digest_exposed_ports(&ports).unwrap();
        }
        topo
    }

    #[test]
    fn test_cluster_client_needs_exposed_server() {
        let factory = HttpClusterApiFactory::new();
        let err = factory
            .cluster_client(&topology(), "dc1", "")
            .err()
            .unwrap();
        assert!(err.to_string().contains("no server with an exposed api port"));

        assert!(factory.cluster_client(&launched(topology()), "dc1", "secret").is_ok());
        assert!(factory.cluster_client(&launched(topology()), "dc9", "").is_err());
    }

    #[test]
    fn test_agent_client_rejects_dataplanes() {
        let factory = HttpClusterApiFactory::new();
        let topo = launched(topology());
        let err = factory
            .agent_client(&topo, "dc1", &NodeId::new("dc1-dp1", ""), "")
            .err()
            .unwrap();
        assert!(err.to_string().contains("is not an agent"));
        assert!(factory
            .agent_client(&topo, "dc1", &NodeId::new("dc1-server1", ""), "")
            .is_ok());
    }

    #[test]
    fn test_url_joins_paths() {
        let api = HttpClusterApi::new(
            "dc1",
            "http://10.0.1.2:8500/",
            41001,
            "secret",
            DEFAULT_TIMEOUT,
        )
        .unwrap();
        assert_eq!(api.url("/v1/status/leader"), "http://10.0.1.2:8500/v1/status/leader");
        assert_eq!(api.cluster(), "dc1");
    }

    #[test]
    fn test_invalid_token_is_rejected() {
        let err = HttpClusterApi::new("dc1", "http://x:8500", 1, "bad\ntoken", DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(err.to_string().contains("invalid token header"));
    }

    #[test]
    fn test_partition_query_omits_default_scope() {
        assert!(partition_query("").is_empty());
        assert_eq!(partition_query("ap1"), vec![("partition", "ap1".to_string())]);
    }
}
