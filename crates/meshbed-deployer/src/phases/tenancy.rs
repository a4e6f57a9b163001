//! Partitions, namespaces and initial config entries.

use tracing::debug;

use meshbed_common::Error;
use meshbed_topology::ids::DEFAULT_TENANCY;
use meshbed_topology::Cluster;

use crate::api::{AdminPartition, ClusterApi, Namespace};

/// Create the partition unless it already exists. Returns whether it was
/// created.
pub async fn ensure_partition(client: &dyn ClusterApi, name: &str) -> Result<bool, Error> {
    let existing = client.list_partitions().await?;
    if existing.iter().any(|p| p.name == name) {
        return Ok(false);
    }
    client
        .create_partition(&AdminPartition {
            name: name.to_string(),
            description: format!("partition {name}"),
        })
        .await?;
    debug!(partition = %name, "created partition");
    Ok(true)
}

/// Create the namespace in `partition` unless it already exists
pub async fn ensure_namespace(
    client: &dyn ClusterApi,
    partition: &str,
    name: &str,
) -> Result<bool, Error> {
    let existing = client.list_namespaces(partition).await?;
    if existing.iter().any(|ns| ns.name == name) {
        return Ok(false);
    }
    client
        .create_namespace(&Namespace {
            name: name.to_string(),
            partition: partition.to_string(),
            description: format!("namespace {name} in partition {partition}"),
        })
        .await?;
    debug!(partition = %partition, namespace = %name, "created namespace");
    Ok(true)
}

/// Create every declared partition and namespace that is not a default.
/// Only enterprise clusters have tenancy.
pub async fn create_tenancies(client: &dyn ClusterApi, cluster: &Cluster) -> Result<(), Error> {
    if !cluster.enterprise {
        return Ok(());
    }
    for partition in &cluster.partitions {
        if partition.name != DEFAULT_TENANCY {
            ensure_partition(client, &partition.name).await?;
        }
        for namespace in &partition.namespaces {
            if namespace != DEFAULT_TENANCY {
                ensure_namespace(client, &partition.name, namespace).await?;
            }
        }
    }
    Ok(())
}

/// Write the cluster's initial config entries in declaration order
pub async fn apply_config_entries(client: &dyn ClusterApi, cluster: &Cluster) -> Result<(), Error> {
    for entry in &cluster.initial_config_entries {
        client.set_config_entry(entry).await?;
        debug!(cluster = %cluster.name, kind = %entry.kind, name = %entry.name, "applied config entry");
    }
    Ok(())
}
