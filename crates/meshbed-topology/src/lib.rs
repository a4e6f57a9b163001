//! Topology model and compiler for meshbed.
//!
//! A [`Config`] describes networks, clusters, nodes, services and peerings.
//! [`compile`] turns it into a [`Topology`] with every generated field
//! filled in; [`recompile`] applies an edited config to a topology that is
//! already running.

#![deny(missing_docs)]

pub mod compile;
pub mod config;
pub mod ids;
pub mod images;
pub mod topology;

pub use compile::{compile, recompile};
pub use config::Config;
pub use ids::{NodeId, ServiceId};
pub use images::Images;
pub use topology::{
    Address, Cluster, ConfigEntry, Network, NetworkType, Node, NodeKind, Partition, PeerCluster,
    Peering, Service, Topology, Upstream,
};
