//! Identities for nodes and services, and DNS label validation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the default partition and namespace
pub const DEFAULT_TENANCY: &str = "default";

/// Returns `partition`, or `default` when empty
pub fn partition_or_default(partition: &str) -> String {
    if partition.is_empty() {
        DEFAULT_TENANCY.to_string()
    } else {
        partition.to_string()
    }
}

/// Returns `namespace`, or `default` when empty
pub fn namespace_or_default(namespace: &str) -> String {
    if namespace.is_empty() {
        DEFAULT_TENANCY.to_string()
    } else {
        namespace.to_string()
    }
}

/// Whether `name` is a valid RFC 1123 DNS label.
///
/// Labels are 1 to 63 ASCII alphanumerics or hyphens, and must start and end
/// with an alphanumeric. Unlike RFC 1035 they may start with a digit.
pub fn is_valid_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Like [`is_valid_label`], but describes what a valid label looks like.
pub fn validate_label(name: &str) -> Result<(), String> {
    if is_valid_label(name) {
        Ok(())
    } else {
        Err(format!(
            "{} is not a valid DNS label: a valid DNS label must consist of alphanumeric characters or '-', and must start and end with an alphanumeric character",
            name
        ))
    }
}

/// Identity of a node within a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Partition the node belongs to
    #[serde(default)]
    pub partition: String,
    /// Logical node name
    pub name: String,
}

impl NodeId {
    /// Create a normalized node id
    pub fn new(name: impl Into<String>, partition: &str) -> Self {
        Self {
            name: name.into(),
            partition: partition_or_default(partition),
        }
    }

    /// Fill in the default partition
    pub fn normalize(&mut self) {
        self.partition = partition_or_default(&self.partition);
    }

    /// Form used in ACL token descriptions
    pub fn acl_string(&self) -> String {
        format!("{}--{}", self.partition, self.name)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.partition.is_empty() || self.partition == DEFAULT_TENANCY {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.partition, self.name)
        }
    }
}

/// Identity of a service within a node
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    /// Partition the service is registered in
    #[serde(default)]
    pub partition: String,
    /// Namespace the service is registered in
    #[serde(default)]
    pub namespace: String,
    /// Service name
    pub name: String,
}

impl ServiceId {
    /// Create a normalized service id
    pub fn new(name: impl Into<String>, namespace: &str, partition: &str) -> Self {
        Self {
            name: name.into(),
            namespace: namespace_or_default(namespace),
            partition: partition_or_default(partition),
        }
    }

    /// Fill in default namespace and partition
    pub fn normalize(&mut self) {
        self.namespace = namespace_or_default(&self.namespace);
        self.partition = partition_or_default(&self.partition);
    }

    /// Form used in ACL token descriptions
    pub fn acl_string(&self) -> String {
        format!("{}--{}--{}", self.partition, self.namespace, self.name)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let default_ns = self.namespace.is_empty() || self.namespace == DEFAULT_TENANCY;
        let default_ap = self.partition.is_empty() || self.partition == DEFAULT_TENANCY;
        if default_ns && default_ap {
            write!(f, "{}", self.name)
        } else {
            write!(
                f,
                "{}/{}/{}",
                partition_or_default(&self.partition),
                namespace_or_default(&self.namespace),
                self.name
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple("dc1", true)]
    #[case::leading_digit("1dc", true)]
    #[case::hyphen_inside("static-server", true)]
    #[case::max_len(&"a".repeat(63), true)]
    #[case::empty("", false)]
    #[case::too_long(&"a".repeat(64), false)]
    #[case::leading_hyphen("-dc1", false)]
    #[case::trailing_hyphen("dc1-", false)]
    #[case::underscore("dc_1", false)]
    #[case::dot("dc.1", false)]
    fn test_label_validation(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(is_valid_label(name), valid);
        assert_eq!(validate_label(name).is_ok(), valid);
    }

    #[test]
    fn test_ids_hide_default_tenancy() {
        assert_eq!(NodeId::new("dc1-client1", "").to_string(), "dc1-client1");
        assert_eq!(NodeId::new("n", "ap1").to_string(), "ap1/n");
        assert_eq!(ServiceId::new("ping", "", "").to_string(), "ping");
        assert_eq!(ServiceId::new("ping", "ns1", "").to_string(), "default/ns1/ping");
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let mut sid = ServiceId {
            name: "pong".into(),
            ..Default::default()
        };
        sid.normalize();
        assert_eq!(sid, ServiceId::new("pong", "default", "default"));
        assert_eq!(sid.acl_string(), "default--default--pong");
    }
}
