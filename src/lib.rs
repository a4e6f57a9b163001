//! meshbed - ephemeral multi-cluster service-mesh deployments for integration tests
//!
//! A [`Config`] declares networks, clusters, nodes, services and peerings.
//! [`Deployment::launch`] compiles it and brings the whole environment up;
//! [`Deployment::relaunch`] applies an edited config to the same running
//! environment without tearing it down.
//!
//! # Crates
//!
//! - [`common`] - errors, retry and poll primitives, tracing setup
//! - [`topology`] - the config model and the topology compiler
//! - [`deployer`] - collaborator traits and the launch pipeline
//!
//! # Example
//!
//! ```ignore
//! use meshbed::{Collaborators, Config, Deployment, HttpClusterApiFactory, MemorySecretStore};
//!
//! let config = Config::from_path("topology.yaml")?;
//! let collaborators = Collaborators {
//!     provisioner,
//!     artifacts,
//!     secrets: Arc::new(MemorySecretStore::new()),
//!     api: Arc::new(HttpClusterApiFactory::new()),
//! };
//! let mut deployment = Deployment::launch(collaborators, "/tmp/meshbed", &config).await?;
//!
//! let leader = deployment.leader("dc1").await?;
//! ```

#![deny(missing_docs)]

pub use meshbed_common as common;
pub use meshbed_deployer as deployer;
pub use meshbed_topology as topology;

pub use meshbed_common::telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use meshbed_common::{Error, Result};
pub use meshbed_deployer::{
    ArtifactBuilder, ClusterApi, ClusterApiFactory, Collaborators, Deployment, DeploymentOptions,
    HttpClusterApiFactory, MemorySecretStore, PhaseOutput, ProvisionPhase, Provisioner,
    SecretStore,
};
pub use meshbed_topology::{compile, recompile, Config, Topology};
