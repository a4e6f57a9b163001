//! Infrastructure provisioner boundary.
//!
//! The provisioner turns a [`Topology`] into containers, networks and volumes.
//! The orchestrator only knows the phase enum: each call to
//! [`Provisioner::generate`] reconciles the infrastructure for everything up
//! to and including that phase and reports what it discovered.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use meshbed_common::Error;
use meshbed_topology::{NodeId, Topology};

/// Slice of the topology a provisioner call brings up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProvisionPhase {
    /// Container networks and volumes
    Networks,
    /// Server agents
    Servers,
    /// Client agents and dataplanes
    Agents,
    /// Workload containers
    Services,
    /// Everything at once, applying the diff against what is running
    Relaunch,
    /// Like [`ProvisionPhase::Relaunch`], for nodes whose images changed
    Upgrade,
}

impl ProvisionPhase {
    /// Stable lowercase name, used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionPhase::Networks => "networks",
            ProvisionPhase::Servers => "servers",
            ProvisionPhase::Agents => "agents",
            ProvisionPhase::Services => "services",
            ProvisionPhase::Relaunch => "relaunch",
            ProvisionPhase::Upgrade => "upgrade",
        }
    }
}

impl fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values discovered by a provisioner call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhaseOutput {
    /// Network name to the subnet the container runtime picked
    pub subnets: BTreeMap<String, String>,
    /// Network name to the host port of its forward proxy
    pub proxy_ports: BTreeMap<String, u16>,
    /// Cluster name to node id to internal port to exposed host port
    pub node_ports: BTreeMap<String, BTreeMap<NodeId, BTreeMap<u16, u16>>>,
}

impl PhaseOutput {
    /// Whether the call reported nothing
    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty() && self.proxy_ports.is_empty() && self.node_ports.is_empty()
    }
}

/// Creates and destroys the infrastructure of a topology
///
/// Every method must be idempotent: calling a phase again reconciles the
/// desired state instead of duplicating resources.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Bind the provisioner to the current state of the topology
    ///
    /// Called before every phase so generated values digested from earlier
    /// phases are visible.
    async fn set_topology(&self, topology: &Topology) -> Result<(), Error>;

    /// Bring up the infrastructure for `phase` and report discovered values
    async fn generate(&self, phase: ProvisionPhase) -> Result<PhaseOutput, Error>;

    /// Record that the initial launch completed
    async fn mark_launched(&self) -> Result<(), Error>;

    /// Tear down everything created so far, continuing past individual
    /// failures and returning them aggregated
    async fn destroy_all_quietly(&self) -> Result<(), Error>;
}
