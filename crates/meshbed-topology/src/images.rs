//! Container image selection.
//!
//! Images are layered: built-in defaults, then the topology, then each
//! cluster, then each node. Non-empty fields of an inner layer win. The
//! community and enterprise control-plane images collapse into a single
//! `consul` field once a cluster's edition is known.

use serde::{Deserialize, Serialize};

use crate::topology::NodeKind;

/// Default community edition control-plane image
pub const DEFAULT_CONSUL_CE: &str = "hashicorp/consul:1.17.0";
/// Default enterprise control-plane image
pub const DEFAULT_CONSUL_ENTERPRISE: &str = "hashicorp/consul-enterprise:1.17.0-ent";
/// Default envoy sidecar image
pub const DEFAULT_ENVOY: &str = "envoyproxy/envoy:v1.27.2";
/// Default dataplane image
pub const DEFAULT_DATAPLANE: &str = "hashicorp/consul-dataplane:1.3.0";

/// Set of images used by a topology, cluster or node
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Images {
    /// Selected control-plane image; only meaningful after [`Images::choose_consul`]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub consul: String,
    /// Community edition control-plane image
    #[serde(skip_serializing_if = "String::is_empty")]
    pub consul_ce: String,
    /// Enterprise control-plane image
    #[serde(skip_serializing_if = "String::is_empty")]
    pub consul_enterprise: String,
    /// Envoy sidecar image
    #[serde(skip_serializing_if = "String::is_empty")]
    pub envoy: String,
    /// Dataplane image
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dataplane: String,
}

impl Images {
    /// Built-in defaults
    pub fn defaults() -> Self {
        Self {
            consul: String::new(),
            consul_ce: DEFAULT_CONSUL_CE.to_string(),
            consul_enterprise: DEFAULT_CONSUL_ENTERPRISE.to_string(),
            envoy: DEFAULT_ENVOY.to_string(),
            dataplane: DEFAULT_DATAPLANE.to_string(),
        }
    }

    /// Layer `other` on top of `self`: every non-empty field of `other` wins
    pub fn override_with(&self, other: &Images) -> Images {
        fn pick(base: &str, top: &str) -> String {
            if top.is_empty() { base } else { top }.to_string()
        }
        Images {
            consul: pick(&self.consul, &other.consul),
            consul_ce: pick(&self.consul_ce, &other.consul_ce),
            consul_enterprise: pick(&self.consul_enterprise, &other.consul_enterprise),
            envoy: pick(&self.envoy, &other.envoy),
            dataplane: pick(&self.dataplane, &other.dataplane),
        }
    }

    /// Collapse the edition-specific images into `consul`.
    ///
    /// An explicitly set `consul` is kept.
    pub fn choose_consul(mut self, enterprise: bool) -> Images {
        if self.consul.is_empty() {
            self.consul = if enterprise {
                std::mem::take(&mut self.consul_enterprise)
            } else {
                std::mem::take(&mut self.consul_ce)
            };
        }
        self.consul_ce.clear();
        self.consul_enterprise.clear();
        self
    }

    /// Drop the images a node of `kind` never runs
    pub fn choose_node(mut self, kind: NodeKind) -> Images {
        match kind {
            NodeKind::Server => {
                self.envoy.clear();
                self.dataplane.clear();
            }
            NodeKind::Client => self.dataplane.clear(),
            NodeKind::Dataplane => self.envoy.clear(),
        }
        self.consul_ce.clear();
        self.consul_enterprise.clear();
        self
    }

    /// Name of the locally built image bundling the control-plane binary
    /// with envoy, or empty when either is unset
    pub fn envoy_consul_image(&self) -> String {
        if self.consul.is_empty() || self.envoy.is_empty() {
            return String::new();
        }
        splice_image_names(&self.consul, &self.envoy, "sidecar-proxy")
    }

    /// Name of the locally built dataplane image, or empty when unset
    pub fn local_dataplane_image(&self) -> String {
        if self.dataplane.is_empty() {
            return String::new();
        }
        let (name, tag) = split_image(&self.dataplane);
        format!("local/{}:{}", name.replace('/', "-"), tag)
    }
}

fn split_image(image: &str) -> (&str, &str) {
    // a colon before the last slash belongs to a registry host:port
    match image.rfind(':') {
        Some(i) if !image[i..].contains('/') => (&image[..i], &image[i + 1..]),
        _ => (image, "latest"),
    }
}

fn splice_image_names(first: &str, second: &str, suffix: &str) -> String {
    let (name1, tag1) = split_image(first);
    let (name2, tag2) = split_image(second);
    format!(
        "local/{}-and-{}-{}:{}-with-{}",
        name1.replace('/', "-"),
        name2.replace('/', "-"),
        suffix,
        tag1,
        tag2
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_keeps_base_for_empty_fields() {
        let base = Images::defaults();
        let merged = base.override_with(&Images {
            envoy: "envoyproxy/envoy:v1.28.0".into(),
            ..Default::default()
        });
        assert_eq!(merged.envoy, "envoyproxy/envoy:v1.28.0");
        assert_eq!(merged.consul_ce, DEFAULT_CONSUL_CE);
    }

    #[test]
    fn test_choose_consul_by_edition() {
        let ce = Images::defaults().choose_consul(false);
        assert_eq!(ce.consul, DEFAULT_CONSUL_CE);
        assert!(ce.consul_ce.is_empty() && ce.consul_enterprise.is_empty());

        let ent = Images::defaults().choose_consul(true);
        assert_eq!(ent.consul, DEFAULT_CONSUL_ENTERPRISE);
    }

    #[test]
    fn test_choose_node_drops_unused_images() {
        let images = Images::defaults().choose_consul(false);

        let server = images.clone().choose_node(NodeKind::Server);
        assert!(server.envoy.is_empty() && server.dataplane.is_empty());

        let client = images.clone().choose_node(NodeKind::Client);
        assert_eq!(client.envoy, DEFAULT_ENVOY);
        assert!(client.dataplane.is_empty());

        let dataplane = images.choose_node(NodeKind::Dataplane);
        assert!(dataplane.envoy.is_empty());
        assert_eq!(dataplane.dataplane, DEFAULT_DATAPLANE);
    }

    #[test]
    fn test_envoy_consul_image_name() {
        let images = Images {
            consul: "hashicorp/consul:1.17.0".into(),
            envoy: "envoyproxy/envoy:v1.27.2".into(),
            ..Default::default()
        };
        assert_eq!(
            images.envoy_consul_image(),
            "local/hashicorp-consul-and-envoyproxy-envoy-sidecar-proxy:1.17.0-with-v1.27.2"
        );
        assert_eq!(Images::default().envoy_consul_image(), "");
    }

    #[test]
    fn test_registry_port_is_not_a_tag() {
        assert_eq!(split_image("localhost:5000/consul"), ("localhost:5000/consul", "latest"));
        assert_eq!(split_image("localhost:5000/consul:dev"), ("localhost:5000/consul", "dev"));
    }
}
