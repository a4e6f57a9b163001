//! Image and TLS material builders.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use meshbed_common::Error;
use meshbed_topology::{Cluster, Images};

/// Builds the artifacts containers need before they can start
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Build the local images derived from one node image set
    ///
    /// Called once per distinct set; implementations should skip work for
    /// images that already exist.
    async fn build_images(&self, images: &Images) -> Result<(), Error>;

    /// Issue or renew TLS material for a cluster into its TLS volume
    ///
    /// Each node's `tls_cert_prefix` names the certificate files it reads.
    async fn issue_tls(&self, cluster: &Cluster) -> Result<(), Error>;
}
