//! The deployment orchestrator.
//!
//! A [`Deployment`] owns the compiled topology, one management API client per
//! cluster and the collaborators, and drives the launch and relaunch
//! pipelines. Steps run strictly in order and clusters are visited in name
//! order, so failures and logs are deterministic.
//!
//! # Failure handling
//!
//! Every step error is attributed to the step that produced it
//! ([`Error::in_phase`]). A failed first launch logs the error, then tears
//! down what was built and returns [`Error::Aborted`], carrying any teardown
//! errors alongside the original failure. A failed relaunch leaves the
//! environment running for inspection and returns the step error.
//!
//! # Relaunch phases
//!
//! [`Deployment::relaunch`] hands the provisioner
//! [`ProvisionPhase::Relaunch`]. [`Deployment::relaunch_with_phase`] also
//! accepts [`ProvisionPhase::Upgrade`], which [`Deployment::upgrade`] uses to
//! roll new images onto one node at a time.
//!
//! # Leader watch
//!
//! After each relaunch one background task per cluster re-discovers the
//! leader every 500ms. The tasks stop on the next relaunch, on
//! [`Deployment::stop`], and when the deployment is dropped.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use meshbed_common::error::UNKNOWN_CONTEXT;
use meshbed_common::retry::{policies, RetryPolicy};
use meshbed_common::Error;
use meshbed_topology::{compile, recompile, Cluster, Config, Images, Node, NodeId, NodeKind, Topology};

use crate::api::{ClusterApi, ClusterApiFactory};
use crate::artifacts::ArtifactBuilder;
use crate::phases::{self, ClusterClients};
use crate::provisioner::{ProvisionPhase, Provisioner};
use crate::secrets::{keys, SecretStore};

/// Token argument of [`Deployment::api_client_for_node`] asking for an
/// anonymous client; an empty token means the management token instead
pub const ANONYMOUS_TOKEN: &str = "-";

/// Size of each value written by [`Deployment::load_kv`]
pub const KV_LOAD_VALUE_SIZE: usize = 128 * 1024;

/// Pause between saving and restoring a snapshot
const SNAPSHOT_SETTLE: Duration = Duration::from_secs(3);

/// The external systems a deployment drives
#[derive(Clone)]
pub struct Collaborators {
    /// Materializes infrastructure per phase
    pub provisioner: Arc<dyn Provisioner>,
    /// Builds images and issues TLS material
    pub artifacts: Arc<dyn ArtifactBuilder>,
    /// Persists generated secrets and tokens
    pub secrets: Arc<dyn SecretStore>,
    /// Builds control-plane API clients
    pub api: Arc<dyn ClusterApiFactory>,
}

/// Settings of a deployment
#[derive(Clone, Debug)]
pub struct DeploymentOptions {
    /// Directory for generated files
    pub workdir: PathBuf,
    /// Retry policy for subnet collisions while creating networks
    pub network_retry: RetryPolicy,
}

impl DeploymentOptions {
    /// Options with the default network retry policy
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            network_retry: policies::NETWORK_PROVISION,
        }
    }

    /// Override the network retry policy
    pub fn network_retry(mut self, policy: RetryPolicy) -> Self {
        self.network_retry = policy;
        self
    }
}

/// What the abort path undoes, in reverse order of registration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cleanup {
    DestroyInfrastructure,
    StopLeaderWatch,
}

/// A launched topology
pub struct Deployment {
    collaborators: Collaborators,
    options: DeploymentOptions,
    config: Config,
    topology: Topology,
    clients: ClusterClients,
    leaders: Arc<DashMap<String, NodeId>>,
    leader_watch: Option<CancellationToken>,
}

/// Run one pipeline step inside its span, attributing failures to it
async fn step<T, F>(name: &'static str, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    let span = info_span!("step", phase = name);
    async move {
        let start = Instant::now();
        debug!("starting");
        let result = fut.await;
        if result.is_ok() {
            debug!(elapsed_ms = start.elapsed().as_millis() as u64, "finished");
        }
        result.map_err(|e| e.in_phase(name))
    }
    .instrument(span)
    .await
}

impl Deployment {
    /// Compile `config` and launch it with default options
    pub async fn launch(
        collaborators: Collaborators,
        workdir: impl AsRef<Path>,
        config: &Config,
    ) -> Result<Self, Error> {
        Self::launch_with_options(
            collaborators,
            DeploymentOptions::new(workdir.as_ref()),
            config,
        )
        .await
    }

    /// Compile `config` and launch it.
    ///
    /// Compile errors are returned before anything is created.
    pub async fn launch_with_options(
        collaborators: Collaborators,
        options: DeploymentOptions,
        config: &Config,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&options.workdir).map_err(|e| {
            Error::io(format!("creating workdir {}", options.workdir.display()), e)
        })?;

        let config = config.clone();
        let topology = compile(&config)?;
        debug!(id = %topology.id, clusters = topology.clusters.len(), "compiled topology");

        let mut deployment = Self::new(collaborators, options, config, topology);
        let start = Instant::now();
        deployment.launch_type(None).await?;
        info!(
            id = %deployment.topology.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "topology is ready for use"
        );
        deployment.log_details();
        Ok(deployment)
    }

    fn new(
        collaborators: Collaborators,
        options: DeploymentOptions,
        config: Config,
        topology: Topology,
    ) -> Self {
        Self {
            collaborators,
            options,
            config,
            topology,
            clients: ClusterClients::new(),
            leaders: Arc::new(DashMap::new()),
            leader_watch: None,
        }
    }

    /// A deployment over an already launched `topology`, with management
    /// clients built from the stored bootstrap tokens
    #[cfg(test)]
    pub(crate) fn for_testing(collaborators: Collaborators, topology: Topology) -> Result<Self, Error> {
        let mut deployment = Self::new(
            collaborators,
            DeploymentOptions::new(std::env::temp_dir()),
            Config::default(),
            topology,
        );
        deployment.init_management_clients()?;
        Ok(deployment)
    }

    /// Apply an edited config to the running deployment.
    ///
    /// Recompile errors are returned as-is and leave the deployment
    /// untouched.
    pub async fn relaunch(&mut self, config: &Config) -> Result<(), Error> {
        self.relaunch_with_phase(config, ProvisionPhase::Relaunch).await
    }

    /// Like [`Self::relaunch`], handing the provisioner `phase`, which must be
    /// [`ProvisionPhase::Relaunch`] or [`ProvisionPhase::Upgrade`]
    pub async fn relaunch_with_phase(
        &mut self,
        config: &Config,
        phase: ProvisionPhase,
    ) -> Result<(), Error> {
        if !matches!(phase, ProvisionPhase::Relaunch | ProvisionPhase::Upgrade) {
            return Err(Error::config(format!("cannot relaunch with the {phase} phase")));
        }

        let config = config.clone();
        let topology = recompile(&config, &self.topology)?;
        self.config = config;
        self.topology = topology;
        debug!(id = %self.topology.id, %phase, "compiled replacement topology");

        let start = Instant::now();
        self.launch_type(Some(phase)).await?;
        info!(
            id = %self.topology.id,
            %phase,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "topology is ready for use"
        );
        self.log_details();
        Ok(())
    }

    /// Roll `images` onto the enabled agents of a cluster, one node per
    /// relaunch: servers first, then clients, each in declaration order.
    ///
    /// `validate` runs after every node and stops the rollout on error.
    pub async fn upgrade<F, Fut>(
        &mut self,
        cluster: &str,
        images: &Images,
        mut validate: F,
    ) -> Result<(), Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let declared = self
            .config
            .cluster(cluster)
            .ok_or_else(|| Error::config(format!("cluster {cluster} not found in topology")))?;
        let mut order = Vec::new();
        for kind in [NodeKind::Server, NodeKind::Client] {
            order.extend(
                declared
                    .nodes
                    .iter()
                    .filter(|n| n.kind == kind && !n.disabled)
                    .map(|n| n.id()),
            );
        }

        let leader = self.leader(cluster).await?;
        info!(cluster = %cluster, leader = %leader.id(), nodes = order.len(), "upgrading cluster");

        for id in order {
            let mut config = self.config.clone();
            let node = config
                .cluster_mut(cluster)
                .and_then(|c| c.node_by_id_mut(&id))
                .ok_or_else(|| Error::internal(format!("node {id} vanished from cluster {cluster}")))?;
            node.images = images.clone();

            info!(cluster = %cluster, node = %id, consul = %images.consul, "upgrading node");
            self.relaunch_with_phase(&config, ProvisionPhase::Upgrade).await?;
            validate().await?;
        }
        Ok(())
    }

    /// Stop background work; the infrastructure keeps running
    pub fn stop(&mut self) {
        self.stop_leader_watch();
    }

    /// Copy of the current topology
    pub fn topology(&self) -> Topology {
        self.topology.clone()
    }

    /// Copy of the config the current topology was compiled from
    pub fn config(&self) -> Config {
        self.config.clone()
    }

    /// Directory for generated files
    pub fn workdir(&self) -> &Path {
        &self.options.workdir
    }

    /// Ask the cluster for its current leader
    pub async fn leader(&self, cluster: &str) -> Result<Node, Error> {
        let (cluster, client) = self.cluster_and_client(cluster)?;
        let leader = phases::find_leader(client, cluster).await?;
        self.leaders.insert(cluster.name.clone(), leader.id());
        Ok(leader.clone())
    }

    /// Servers marked disabled, in declaration order
    pub fn disabled_servers(&self, cluster: &str) -> Result<Vec<Node>, Error> {
        let cluster = self.topology.cluster(cluster)?;
        Ok(cluster
            .nodes
            .iter()
            .filter(|n| n.is_server() && n.disabled)
            .cloned()
            .collect())
    }

    /// Enabled servers other than the current leader
    pub async fn followers(&self, cluster: &str) -> Result<Vec<Node>, Error> {
        let leader = self.leader(cluster).await?;
        let cluster = self.topology.cluster(cluster)?;
        Ok(cluster
            .nodes
            .iter()
            .filter(|n| n.is_server() && !n.disabled && n.id() != leader.id())
            .cloned()
            .collect())
    }

    /// Leader recorded by the last discovery, without asking the cluster
    pub fn last_known_leader(&self, cluster: &str) -> Option<NodeId> {
        self.leaders.get(cluster).map(|l| l.clone())
    }

    /// Management client of a cluster
    pub fn client(&self, cluster: &str) -> Option<Arc<dyn ClusterApi>> {
        self.clients.get(cluster).cloned()
    }

    /// Client sent to the cluster's first client agent, or its first server
    /// when it has none. Tokens are read as by [`Self::api_client_for_node`].
    pub fn api_client_for_cluster(&self, cluster: &str, token: &str) -> Result<Arc<dyn ClusterApi>, Error> {
        let topology_cluster = self.topology.cluster(cluster)?;
        let node = topology_cluster
            .first_client()
            .or_else(|| topology_cluster.first_server())
            .ok_or_else(|| Error::config(format!("failed to find agent in cluster {cluster}")))?;
        self.api_client_for_node(cluster, &node.id(), token)
    }

    /// Client sent to the agent on `node`.
    ///
    /// An empty `token` means the management token and [`ANONYMOUS_TOKEN`]
    /// sends no token at all.
    pub fn api_client_for_node(
        &self,
        cluster: &str,
        node: &NodeId,
        token: &str,
    ) -> Result<Arc<dyn ClusterApi>, Error> {
        let agent = self.agent(cluster, node)?;
        let token = match token {
            "" => self.collaborators.secrets.read_generic(cluster, keys::BOOTSTRAP_TOKEN),
            ANONYMOUS_TOKEN => String::new(),
            other => other.to_string(),
        };
        self.collaborators
            .api
            .agent_client(&self.topology, cluster, &agent.id(), &token)
    }

    /// Local network IP of the agent on `node`
    pub fn local_address_for_node(&self, cluster: &str, node: &NodeId) -> Result<String, Error> {
        let agent = self.agent(cluster, node)?;
        agent
            .local_address()
            .map(str::to_string)
            .ok_or_else(|| Error::internal(format!("node {} has no local address yet", agent.id())))
    }

    /// Read a key through the management client
    pub async fn get_kv(&self, cluster: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let (_, client) = self.cluster_and_client(cluster)?;
        client.kv_get(key).await
    }

    /// Write `count` keys `key-0`, `key-1`, ... with random values of
    /// [`KV_LOAD_VALUE_SIZE`] bytes
    pub async fn load_kv(&self, cluster: &str, count: usize) -> Result<(), Error> {
        let (_, client) = self.cluster_and_client(cluster)?;
        let mut value = vec![0u8; KV_LOAD_VALUE_SIZE];
        for i in 0..count {
            rand::thread_rng().fill_bytes(&mut value);
            client.kv_put(&format!("key-{i}"), &value).await?;
        }
        debug!(cluster = %cluster, keys = count, "loaded kv data");
        Ok(())
    }

    /// Save a snapshot of the cluster and restore it
    pub async fn snapshot_save_and_restore(&self, cluster: &str) -> Result<(), Error> {
        let (_, client) = self.cluster_and_client(cluster)?;
        let snapshot = client.snapshot_save().await?;
        info!(cluster = %cluster, bytes = snapshot.len(), "snapshot saved");

        tokio::time::sleep(SNAPSHOT_SETTLE).await;

        client.snapshot_restore(&snapshot).await?;
        info!(cluster = %cluster, "snapshot restored");
        Ok(())
    }

    fn agent(&self, cluster: &str, node: &NodeId) -> Result<&Node, Error> {
        let mut id = node.clone();
        id.normalize();
        let found = self
            .topology
            .cluster(cluster)?
            .node_by_id(&id)
            .ok_or_else(|| Error::config(format!("no node {id} in cluster {cluster}")))?;
        if !found.is_agent() {
            return Err(Error::config(format!("node {id} in cluster {cluster} is not an agent")));
        }
        Ok(found)
    }

    fn cluster_and_client(&self, name: &str) -> Result<(&Cluster, &dyn ClusterApi), Error> {
        let cluster = self.topology.cluster(name)?;
        let client = self
            .clients
            .get(name)
            .ok_or_else(|| Error::internal(format!("no api client for cluster {name}")))?;
        Ok((cluster, &**client))
    }

    fn cluster_names(&self) -> Vec<String> {
        self.topology.clusters.keys().cloned().collect()
    }

    /// `relaunch` is `None` on the first launch
    async fn launch_type(&mut self, relaunch: Option<ProvisionPhase>) -> Result<(), Error> {
        let first_time = relaunch.is_none();
        let mut cleanup = Vec::new();
        let result = self.run_pipeline(relaunch, &mut cleanup).await;

        let Err(err) = result else {
            return Ok(());
        };
        // logged before teardown so it is not buried in teardown noise
        error!(
            error = %err,
            phase = err.phase().unwrap_or(UNKNOWN_CONTEXT),
            first_time,
            "fatal error during launch"
        );
        if cleanup.is_empty() {
            return Err(err);
        }

        let teardown = self.run_cleanup(cleanup).await;
        Err(Error::Aborted {
            source: Box::new(err),
            teardown,
        })
    }

    async fn run_cleanup(&mut self, mut cleanup: Vec<Cleanup>) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some(action) = cleanup.pop() {
            match action {
                Cleanup::StopLeaderWatch => self.stop_leader_watch(),
                Cleanup::DestroyInfrastructure => {
                    if let Err(e) = self.collaborators.provisioner.destroy_all_quietly().await {
                        error!(error = %e, "teardown failed");
                        failures.push(e.to_string());
                    }
                }
            }
        }
        failures
    }

    async fn run_pipeline(
        &mut self,
        relaunch: Option<ProvisionPhase>,
        cleanup: &mut Vec<Cleanup>,
    ) -> Result<(), Error> {
        let c = self.collaborators.clone();
        let first_time = relaunch.is_none();

        step("build-images", phases::build_images(&*c.artifacts, &self.topology)).await?;
        if first_time {
            step("init-secrets", async {
                phases::init_secrets(&*c.secrets, &self.topology);
                Ok(())
            })
            .await?;
        }
        step("bind-provisioner", c.provisioner.set_topology(&self.topology)).await?;

        match relaunch {
            None => {
                cleanup.push(Cleanup::DestroyInfrastructure);
                cleanup.push(Cleanup::StopLeaderWatch);
                self.launch_steps(&c).await
            }
            Some(phase) => self.relaunch_steps(&c, phase).await,
        }
    }

    async fn launch_steps(&mut self, c: &Collaborators) -> Result<(), Error> {
        let provisioner = &*c.provisioner;

        step(
            "networks",
            phases::provision_networks(provisioner, &mut self.topology, &self.options.network_retry),
        )
        .await?;
        step("assign-ips", async { self.topology.assign_ips() }).await?;
        step("tls", async {
            phases::assign_tls_names(&mut self.topology);
            phases::issue_tls(&*c.artifacts, &self.topology).await
        })
        .await?;
        step("servers", async {
            phases::provision(provisioner, &mut self.topology, ProvisionPhase::Servers).await?;
            self.init_clients(|_| String::new())
        })
        .await?;
        step("leader", self.form_clusters()).await?;
        step("acl-bootstrap", self.bootstrap_acls()).await?;
        step("management-clients", async { self.init_management_clients() }).await?;
        step("local-writes", self.wait_for_local_writes()).await?;
        step("tenancies", self.create_tenancies()).await?;
        step("config-entries", self.apply_config_entries()).await?;
        step("anonymous-token", self.create_anonymous_tokens()).await?;
        step("agent-tokens", self.create_agent_tokens()).await?;
        step(
            "agents",
            phases::provision(provisioner, &mut self.topology, ProvisionPhase::Agents),
        )
        .await?;
        step("anti-entropy", self.wait_for_anti_entropy()).await?;
        step("service-tokens", self.create_service_tokens()).await?;
        step("catalog-registration", self.register_catalog_services()).await?;
        step("agent-registration", self.register_agent_services()).await?;
        step(
            "services",
            phases::provision(provisioner, &mut self.topology, ProvisionPhase::Services),
        )
        .await?;
        step("peerings", phases::establish_peerings(&self.clients, &self.topology)).await?;
        step(
            "peering-active",
            phases::wait_for_peerings_active(&self.clients, &self.topology),
        )
        .await?;
        step("mark-launched", provisioner.mark_launched()).await
    }

    async fn relaunch_steps(&mut self, c: &Collaborators, phase: ProvisionPhase) -> Result<(), Error> {
        self.stop_leader_watch();

        step("tenancies", self.create_tenancies()).await?;
        step("config-entries", self.apply_config_entries()).await?;
        step("agent-tokens", self.create_agent_tokens()).await?;
        step("service-tokens", self.create_service_tokens()).await?;
        step(
            phase.as_str(),
            phases::provision(&*c.provisioner, &mut self.topology, phase),
        )
        .await?;
        step("leader", self.form_clusters()).await?;
        step("management-clients", async { self.init_management_clients() }).await?;
        step("local-writes", self.wait_for_local_writes()).await?;
        step("anti-entropy", self.wait_for_anti_entropy()).await?;
        step("agent-registration", self.register_agent_services()).await?;
        step("catalog-registration", self.register_catalog_services()).await?;
        step("leader-watch", async {
            self.start_leader_watch();
            Ok(())
        })
        .await
    }

    /// Replace every cluster's client with one carrying `token_for(cluster)`
    fn init_clients(&mut self, token_for: impl Fn(&str) -> String) -> Result<(), Error> {
        for name in self.cluster_names() {
            let client = self
                .collaborators
                .api
                .cluster_client(&self.topology, &name, &token_for(&name))?;
            self.clients.insert(name, client);
        }
        Ok(())
    }

    fn init_management_clients(&mut self) -> Result<(), Error> {
        let secrets = self.collaborators.secrets.clone();
        self.init_clients(|cluster| secrets.read_generic(cluster, keys::BOOTSTRAP_TOKEN))
    }

    async fn form_clusters(&self) -> Result<(), Error> {
        let c = &self.collaborators;
        for name in self.cluster_names() {
            phases::rejoin_servers(&*c.api, &*c.secrets, &self.topology, &name).await?;
            let (cluster, client) = self.cluster_and_client(&name)?;
            let leader = phases::wait_for_leader(client, cluster).await?;
            self.leaders.insert(name, leader);
        }
        Ok(())
    }

    async fn bootstrap_acls(&self) -> Result<(), Error> {
        let c = &self.collaborators;
        for name in self.cluster_names() {
            phases::bootstrap_acls(&*c.api, &*c.secrets, &self.topology, &name).await?;
        }
        Ok(())
    }

    async fn wait_for_local_writes(&self) -> Result<(), Error> {
        for name in self.cluster_names() {
            let (cluster, client) = self.cluster_and_client(&name)?;
            phases::wait_for_local_writes(client, cluster).await?;
        }
        Ok(())
    }

    async fn create_tenancies(&self) -> Result<(), Error> {
        for name in self.cluster_names() {
            let (cluster, client) = self.cluster_and_client(&name)?;
            phases::create_tenancies(client, cluster).await?;
        }
        Ok(())
    }

    async fn apply_config_entries(&self) -> Result<(), Error> {
        for name in self.cluster_names() {
            let (cluster, client) = self.cluster_and_client(&name)?;
            phases::apply_config_entries(client, cluster).await?;
        }
        Ok(())
    }

    async fn create_anonymous_tokens(&self) -> Result<(), Error> {
        for name in self.cluster_names() {
            let (cluster, client) = self.cluster_and_client(&name)?;
            phases::create_anonymous_token(client, cluster).await?;
        }
        Ok(())
    }

    async fn create_agent_tokens(&self) -> Result<(), Error> {
        let secrets = &*self.collaborators.secrets;
        for name in self.cluster_names() {
            let (cluster, client) = self.cluster_and_client(&name)?;
            phases::create_agent_tokens(client, secrets, cluster).await?;
        }
        Ok(())
    }

    async fn create_service_tokens(&self) -> Result<(), Error> {
        let secrets = &*self.collaborators.secrets;
        for name in self.cluster_names() {
            let (cluster, client) = self.cluster_and_client(&name)?;
            phases::create_service_tokens(client, secrets, cluster).await?;
        }
        Ok(())
    }

    async fn wait_for_anti_entropy(&self) -> Result<(), Error> {
        for name in self.cluster_names() {
            let (cluster, client) = self.cluster_and_client(&name)?;
            phases::wait_for_anti_entropy(client, cluster).await?;
        }
        Ok(())
    }

    async fn register_catalog_services(&self) -> Result<(), Error> {
        for name in self.cluster_names() {
            let (cluster, client) = self.cluster_and_client(&name)?;
            phases::register_catalog_services(client, cluster).await?;
        }
        Ok(())
    }

    async fn register_agent_services(&self) -> Result<(), Error> {
        let c = &self.collaborators;
        for name in self.cluster_names() {
            phases::register_agent_services(&*c.api, &*c.secrets, &self.topology, &name).await?;
        }
        Ok(())
    }

    fn start_leader_watch(&mut self) {
        self.stop_leader_watch();
        let token = CancellationToken::new();

        for (name, client) in &self.clients {
            let Some(cluster) = self.topology.clusters.get(name).cloned() else {
                continue;
            };
            let client = client.clone();
            let leaders = self.leaders.clone();
            let token = token.clone();

            tokio::spawn(async move {
                loop {
                    match phases::find_leader(&*client, &cluster).await {
                        Ok(node) => {
                            let id = node.id();
                            if leaders.get(&cluster.name).map_or(true, |known| *known != id) {
                                info!(cluster = %cluster.name, leader = %id, "leader changed");
                            }
                            leaders.insert(cluster.name.clone(), id);
                        }
                        Err(e) => debug!(cluster = %cluster.name, error = %e, "leader lookup failed"),
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(policies::LEADER.interval) => {}
                    }
                }
                debug!(cluster = %cluster.name, "leader watch stopped");
            });
        }
        self.leader_watch = Some(token);
    }

    fn stop_leader_watch(&mut self) {
        if let Some(token) = self.leader_watch.take() {
            token.cancel();
        }
    }

    fn log_details(&self) {
        for cluster in self.topology.clusters.values() {
            for node in cluster.sorted_nodes() {
                info!(
                    cluster = %cluster.name,
                    node = %node.id(),
                    kind = ?node.kind,
                    disabled = node.disabled,
                    address = node.local_address().unwrap_or_default(),
                    api_port = node.exposed_port(meshbed_topology::topology::AGENT_HTTP_PORT),
                    services = node.services.len(),
                    "node"
                );
            }
        }
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        self.stop_leader_watch();
    }
}
