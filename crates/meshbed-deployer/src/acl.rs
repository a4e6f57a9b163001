//! ACL policy and token provisioning.
//!
//! Policies and tokens are written with upserts so a relaunch can issue the
//! same calls against a cluster that already has them:
//!
//! - policies are looked up by name and updated in place, keeping their id
//! - tokens are looked up by description and updated in place, keeping both
//!   their accessor id and their secret
//!
//! Token descriptions encode what the token is for, so they double as the
//! lookup key: `agent--<partition>--<node>` and
//! `service--<partition>--<namespace>--<name>`.

use tracing::debug;

use meshbed_common::Error;
use meshbed_topology::ids::DEFAULT_TENANCY;
use meshbed_topology::{Cluster, Node, Service};

use crate::api::{AclLink, AclPolicy, AclToken, ClusterApi, NodeIdentity, ServiceIdentity};

/// Fixed accessor id of the built-in anonymous token
pub const ANONYMOUS_TOKEN_ACCESSOR: &str = "00000000-0000-0000-0000-000000000002";

/// Name of the policy granted to the anonymous token
pub const ANONYMOUS_POLICY: &str = "anonymous";

/// Create `policy`, or update the existing policy with the same name.
///
/// A lookup answered with "ACL not found" counts as absent.
pub async fn create_or_update_policy(
    api: &dyn ClusterApi,
    policy: &AclPolicy,
) -> Result<AclPolicy, Error> {
    let existing = match api.read_policy_by_name(&policy.name, &policy.partition).await {
        Ok(found) => found,
        Err(e) if e.is_acl_not_found() => None,
        Err(e) => return Err(e),
    };

    match existing {
        Some(current) => {
            let updated = AclPolicy {
                id: current.id,
                ..policy.clone()
            };
            debug!(policy = %updated.name, id = %updated.id, "updating acl policy");
            api.update_policy(&updated).await
        }
        None => {
            debug!(policy = %policy.name, "creating acl policy");
            api.create_policy(policy).await
        }
    }
}

/// Create `token`, or update the existing token with the same description.
pub async fn create_or_update_token(
    api: &dyn ClusterApi,
    token: &AclToken,
) -> Result<AclToken, Error> {
    let listed = api.list_tokens(&token.partition).await?;
    let found = listed
        .into_iter()
        .find(|t| t.description == token.description);

    match found {
        Some(stub) => {
            // listings may omit the secret
            let current = api.read_token(&stub.accessor_id, &token.partition).await?;
            let updated = AclToken {
                accessor_id: current.accessor_id,
                secret_id: current.secret_id,
                ..token.clone()
            };
            debug!(token = %updated.description, accessor = %updated.accessor_id, "updating acl token");
            api.update_token(&updated).await
        }
        None => {
            debug!(token = %token.description, "creating acl token");
            api.create_token(token).await
        }
    }
}

fn scoped(cluster: &Cluster, value: &str) -> String {
    if cluster.enterprise {
        value.to_string()
    } else {
        String::new()
    }
}

/// Read-only catalog access for unauthenticated requests
pub fn anonymous_policy(cluster: &Cluster) -> AclPolicy {
    let rules = if cluster.enterprise {
        r#"
partition_prefix "" {
  namespace_prefix "" {
    node_prefix "" { policy = "read" }
    service_prefix "" { policy = "read" }
  }
}
"#
    } else {
        r#"
node_prefix "" { policy = "read" }
service_prefix "" { policy = "read" }
"#
    };
    AclPolicy {
        name: ANONYMOUS_POLICY.to_string(),
        description: "anonymous".to_string(),
        rules: rules.trim_start().to_string(),
        partition: scoped(cluster, DEFAULT_TENANCY),
        ..Default::default()
    }
}

/// The built-in anonymous token, bound to [`anonymous_policy`]
pub fn anonymous_token(cluster: &Cluster) -> AclToken {
    AclToken {
        accessor_id: ANONYMOUS_TOKEN_ACCESSOR.to_string(),
        description: "Anonymous Token".to_string(),
        policies: vec![AclLink::named(ANONYMOUS_POLICY)],
        partition: scoped(cluster, DEFAULT_TENANCY),
        ..Default::default()
    }
}

/// Description of a node's agent token
pub fn agent_token_description(node: &Node) -> String {
    format!("agent--{}", node.id().acl_string())
}

/// Token for the agent on `node`, granted the node identity of its catalog
/// entry
pub fn agent_token(cluster: &Cluster, node: &Node) -> AclToken {
    AclToken {
        description: agent_token_description(node),
        node_identities: vec![NodeIdentity {
            node_name: node.pod_name(),
            datacenter: node.datacenter.clone(),
        }],
        partition: scoped(cluster, &node.id().partition),
        ..Default::default()
    }
}

/// Description of a service token
pub fn service_token_description(service: &Service) -> String {
    format!("service--{}", service.id.acl_string())
}

/// Name of the policy mesh gateways in `partition` use
pub fn mesh_gateway_policy_name(partition: &str) -> String {
    format!("mesh-gateway--{partition}")
}

/// Cross-partition catalog access for mesh gateways of one partition
pub fn mesh_gateway_policy(cluster: &Cluster, partition: &str) -> AclPolicy {
    let rules = if cluster.enterprise {
        format!(
            r#"
partition "{partition}" {{
  mesh = "write"
  peering = "read"
  namespace "default" {{
    service "mesh-gateway" {{ policy = "write" }}
  }}
}}
partition_prefix "" {{
  namespace_prefix "" {{
    node_prefix "" {{ policy = "read" }}
    service_prefix "" {{ policy = "read" }}
  }}
}}
"#
        )
    } else {
        r#"
mesh = "write"
peering = "read"
service "mesh-gateway" { policy = "write" }
node_prefix "" { policy = "read" }
service_prefix "" { policy = "read" }
"#
        .to_string()
    };
    AclPolicy {
        name: mesh_gateway_policy_name(partition),
        description: format!("mesh gateway policy for partition {partition}"),
        rules: rules.trim_start().to_string(),
        partition: scoped(cluster, partition),
        ..Default::default()
    }
}

/// Token for one service instance.
///
/// Mesh gateways get [`mesh_gateway_policy`]; everything else gets the
/// service identity of its name.
pub fn service_token(cluster: &Cluster, service: &Service) -> AclToken {
    let mut token = AclToken {
        description: service_token_description(service),
        partition: scoped(cluster, &service.id.partition),
        namespace: scoped(cluster, &service.id.namespace),
        ..Default::default()
    };
    if service.is_mesh_gateway {
        token.policies = vec![AclLink::named(mesh_gateway_policy_name(
            &service.id.partition,
        ))];
        token.namespace = scoped(cluster, DEFAULT_TENANCY);
    } else {
        token.service_identities = vec![ServiceIdentity {
            service_name: service.id.name.clone(),
            datacenters: Vec::new(),
        }];
    }
    token
}
