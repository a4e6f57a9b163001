//! Error types for meshbed
//!
//! Errors fall into a handful of categories that drive how the deployment
//! pipeline reacts to them:
//!
//! - configuration errors from the topology compiler are fatal and never retried
//! - immutable-field errors are the subset raised when a recompile changes
//!   something that cannot change on a running deployment
//! - API and provisioner errors are classified by message into transient
//!   signatures (retried by the callers that know about them) and everything
//!   else (propagated immediately)
//! - phase and abort wrappers attribute a failure to a pipeline step and carry
//!   any teardown errors without hiding the original cause

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Provisioner error emitted when a freshly picked subnet collides with an
/// existing container network.
pub const POOL_OVERLAP: &str = "Pool overlaps with other one on this address space";

/// Control-plane error returned while the ACL system has not been bootstrapped.
pub const ACL_NOT_BOOTSTRAPPED: &str =
    "ACL system must be bootstrapped before making any requests that require authorization";

/// Control-plane error returned while ACLs are still in legacy mode.
pub const ACL_LEGACY_MODE: &str = "The ACL system is currently in legacy mode";

/// Control-plane error returned when bootstrapping a second time.
pub const ACL_BOOTSTRAP_DONE: &str = "ACL bootstrap no longer allowed";

/// Control-plane error returned when a token has not replicated yet, or a
/// looked-up ACL object does not exist.
pub const ACL_NOT_FOUND: &str = "ACL not found";

/// Main error type for meshbed operations
#[derive(Debug, Error)]
pub enum Error {
    /// Topology configuration violates an invariant
    #[error("invalid topology: {message}")]
    Config {
        /// Description of what's invalid, including cluster/node/service context
        message: String,
    },

    /// A recompile changed a field that is fixed once a topology is launched
    #[error("some immutable aspects were changed in cluster {cluster:?}: {message}")]
    ImmutableField {
        /// Cluster containing the offending node or service
        cluster: String,
        /// Which field changed and on what
        message: String,
    },

    /// Control-plane HTTP API error
    #[error("cluster api error for {cluster}: {message}")]
    Api {
        /// Cluster the request was sent to
        cluster: String,
        /// HTTP status code, if a response was received
        status: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// Infrastructure provisioner error
    #[error("provisioner error [{phase}]: {message}")]
    Provisioner {
        /// Provisioner phase that failed
        phase: String,
        /// Description of what failed
        message: String,
    },

    /// A pipeline step failed
    #[error("{phase}: {source}")]
    Phase {
        /// Name of the step that failed
        phase: String,
        /// The underlying failure
        source: Box<Error>,
    },

    /// A launch or relaunch failed and the environment was torn down
    #[error("{}{}", .source, teardown_suffix(.teardown))]
    Aborted {
        /// The failure that triggered the teardown
        source: Box<Error>,
        /// Errors encountered while tearing down, if any
        teardown: Vec<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Filesystem error
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being done
        context: String,
        /// The underlying io error
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

fn teardown_suffix(teardown: &[String]) -> String {
    if teardown.is_empty() {
        String::new()
    } else {
        format!(" (teardown also failed: {})", teardown.join("; "))
    }
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { message: msg.into() }
    }

    /// Create an immutable-field error for a cluster
    pub fn immutable(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ImmutableField {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an API error without a status code (transport failure)
    pub fn api(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Api {
            cluster: cluster.into(),
            status: None,
            message: msg.into(),
        }
    }

    /// Create an API error for a non-success HTTP response
    pub fn api_status(cluster: impl Into<String>, status: u16, body: impl AsRef<str>) -> Self {
        Self::Api {
            cluster: cluster.into(),
            status: Some(status),
            message: format!("Unexpected response code: {} ({})", status, body.as_ref()),
        }
    }

    /// Create a provisioner error for a phase
    pub fn provisioner(phase: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioner {
            phase: phase.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization { message: msg.into() }
    }

    /// Create an io error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error with the name of the pipeline step that produced it
    pub fn in_phase(self, phase: impl Into<String>) -> Self {
        Self::Phase {
            phase: phase.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through phase and abort wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Phase { source, .. } | Error::Aborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// The pipeline step this error is attributed to, if any
    pub fn phase(&self) -> Option<&str> {
        match self {
            Error::Phase { phase, .. } => Some(phase),
            Error::Aborted { source, .. } => source.phase(),
            _ => None,
        }
    }

    /// HTTP status code of an API error
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            Error::Api { status, .. } => *status,
            _ => None,
        }
    }

    fn message_contains(&self, needle: &str) -> bool {
        match self.root() {
            Error::Api { message, .. } | Error::Provisioner { message, .. } => {
                message.contains(needle)
            }
            _ => false,
        }
    }

    /// The provisioner picked a subnet that overlaps an existing network
    pub fn is_address_pool_overlap(&self) -> bool {
        self.message_contains(POOL_OVERLAP)
    }

    /// ACLs are not bootstrapped yet, or still in legacy mode
    pub fn is_acl_not_bootstrapped(&self) -> bool {
        self.message_contains(ACL_NOT_BOOTSTRAPPED) || self.message_contains(ACL_LEGACY_MODE)
    }

    /// ACL bootstrap already happened
    pub fn is_acl_bootstrap_done(&self) -> bool {
        self.message_contains(ACL_BOOTSTRAP_DONE)
    }

    /// The token used is not (yet) known to the server, or a looked-up ACL
    /// object is absent
    pub fn is_acl_not_found(&self) -> bool {
        self.message_contains(ACL_NOT_FOUND)
    }

    /// The server answered 504 Gateway Timeout
    pub fn is_gateway_timeout(&self) -> bool {
        self.status() == Some(504)
    }

    /// The server answered 404 Not Found
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self.root() {
            Error::ImmutableField { cluster, .. } | Error::Api { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}
