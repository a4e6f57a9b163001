//! Launch and relaunch orchestration for meshbed
//!
//! This crate drives a compiled [`Topology`](meshbed_topology::Topology)
//! into a running environment and keeps it in step with later edits.
//!
//! The external systems a launch touches sit behind traits so the pipeline
//! can run against mocks:
//! - [`Provisioner`]: containers, networks and volumes per phase
//! - [`ArtifactBuilder`]: images and TLS material
//! - [`SecretStore`]: generated secrets and ACL tokens
//! - [`ClusterApi`] / [`ClusterApiFactory`]: the control-plane HTTP API
//!
//! [`HttpClusterApiFactory`] and [`MemorySecretStore`] are the stock
//! implementations of the last two.

#![deny(missing_docs)]

pub mod acl;
pub mod api;
pub mod artifacts;
pub mod deployment;
pub mod phases;
pub mod provisioner;
pub mod secrets;

pub use api::{ClusterApi, ClusterApiFactory, HttpClusterApi, HttpClusterApiFactory};
pub use artifacts::ArtifactBuilder;
pub use deployment::{Collaborators, Deployment, DeploymentOptions};
pub use provisioner::{PhaseOutput, ProvisionPhase, Provisioner};
pub use secrets::{MemorySecretStore, SecretStore};

// Re-export common error types
pub use meshbed_common::{Error, Result};
