//! User-authored topology description and its loaders.

use std::path::Path;

use serde::{Deserialize, Serialize};

use meshbed_common::{Error, Result};

use crate::ids::NodeId;
use crate::images::Images;
use crate::topology::{Cluster, Network, Peering};

/// Declarative input to [`compile`](crate::compile).
///
/// # Example
///
/// ```yaml
/// networks:
///   - name: dc1
///   - name: wan
///     type: wan
/// clusters:
///   - name: dc1
///     nodes:
///       - kind: server
///         name: dc1-server1
///         addresses: [{ network: dc1 }, { network: wan }]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Image overrides for the whole topology; `consul` must stay empty
    #[serde(default)]
    pub images: Images,
    /// Networks to create
    #[serde(default)]
    pub networks: Vec<Network>,
    /// Clusters to create, in order
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    /// Peerings to establish between clusters
    #[serde(default)]
    pub peerings: Vec<Peering>,
}

impl Config {
    /// Parse a YAML document
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s)
            .map_err(|e| Error::serialization(format!("failed to parse topology yaml: {e}")))
    }

    /// Parse a JSON document
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| Error::serialization(format!("failed to parse topology json: {e}")))
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    /// Look up a cluster by name
    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Mutable lookup of a cluster by name
    pub fn cluster_mut(&mut self, name: &str) -> Option<&mut Cluster> {
        self.clusters.iter_mut().find(|c| c.name == name)
    }

    /// Mark a node disabled. Returns false if it already was.
    pub fn disable_node(&mut self, cluster: &str, id: &NodeId) -> Result<bool> {
        self.set_disabled(cluster, id, true)
    }

    /// Mark a node enabled. Returns false if it already was.
    pub fn enable_node(&mut self, cluster: &str, id: &NodeId) -> Result<bool> {
        self.set_disabled(cluster, id, false)
    }

    fn set_disabled(&mut self, cluster_name: &str, id: &NodeId, disabled: bool) -> Result<bool> {
        let cluster = self
            .cluster_mut(cluster_name)
            .ok_or_else(|| Error::config(format!("no such cluster: {cluster_name:?}")))?;
        let node = cluster.node_by_id_mut(id).ok_or_else(|| {
            Error::config(format!(
                "expected to find node {:?} in cluster {:?}",
                id.to_string(),
                cluster_name
            ))
        })?;
        if node.disabled == disabled {
            return Ok(false);
        }
        node.disabled = disabled;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{NetworkType, NodeKind};
    use std::io::Write;

    const TWO_CLUSTERS: &str = r#"
networks:
  - name: dc1
  - name: dc2
  - name: wan
    type: wan
clusters:
  - name: dc1
    nodes:
      - kind: server
        name: dc1-server1
        addresses: [{ network: dc1 }, { network: wan }]
      - kind: client
        name: dc1-client1
        services:
          - id: { name: ping }
            image: example/pingpong:latest
            port: 8080
            envoy_admin_port: 19000
            upstreams:
              - id: { name: pong }
                local_port: 9090
                peer: peer-dc2-default
  - name: dc2
    initial_config_entries:
      - Kind: service-defaults
        Name: pong
        Protocol: http
    nodes:
      - kind: server
        name: dc2-server1
peerings:
  - dialing: { name: dc1 }
    accepting: { name: dc2 }
"#;

    #[test]
    fn test_yaml_config_parses() {
        let cfg = Config::from_yaml_str(TWO_CLUSTERS).unwrap();
        assert_eq!(cfg.networks.len(), 3);
        assert_eq!(cfg.networks[2].network_type, NetworkType::Wan);
        assert_eq!(cfg.networks[0].network_type, NetworkType::Lan);

        let dc1 = cfg.cluster("dc1").unwrap();
        assert_eq!(dc1.nodes[0].kind, NodeKind::Server);
        assert_eq!(dc1.nodes[1].services[0].upstreams[0].peer, "peer-dc2-default");

        let entry = &cfg.cluster("dc2").unwrap().initial_config_entries[0];
        assert_eq!(entry.kind, "service-defaults");
        assert_eq!(entry.body["Protocol"], "http");
        assert_eq!(cfg.peerings[0].accepting.name, "dc2");
    }

    #[test]
    fn test_unknown_node_kind_is_rejected() {
        let err = Config::from_yaml_str(
            "clusters:\n  - name: dc1\n    nodes:\n      - kind: router\n        name: r1\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn test_from_path_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("topology.json");
        let cfg = Config::from_yaml_str(TWO_CLUSTERS).unwrap();
        std::fs::write(&json_path, serde_json::to_string(&cfg).unwrap()).unwrap();
        assert_eq!(Config::from_path(&json_path).unwrap(), cfg);

        let yaml_path = dir.path().join("topology.yaml");
        let mut f = std::fs::File::create(&yaml_path).unwrap();
        f.write_all(TWO_CLUSTERS.as_bytes()).unwrap();
        assert_eq!(Config::from_path(&yaml_path).unwrap(), cfg);

        assert!(matches!(
            Config::from_path(dir.path().join("missing.yaml")),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_disable_and_enable_node() {
        let mut cfg = Config::from_yaml_str(TWO_CLUSTERS).unwrap();
        let id = NodeId::new("dc1-client1", "");

        assert!(cfg.disable_node("dc1", &id).unwrap());
        assert!(!cfg.disable_node("dc1", &id).unwrap());
        assert!(cfg.cluster("dc1").unwrap().nodes[1].disabled);
        assert!(cfg.enable_node("dc1", &id).unwrap());

        assert!(cfg.disable_node("dc9", &id).is_err());
        assert!(cfg.disable_node("dc1", &NodeId::new("ghost", "")).is_err());
    }
}
