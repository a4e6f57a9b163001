//! Fixed-interval retry and polling primitives.
//!
//! Every wait in the deployment pipeline is one of two shapes:
//!
//! - [`retry_when`]: run an operation, and if it fails with an error the
//!   caller recognizes as transient, sleep a fixed interval and run it again.
//!   Unrecognized errors are returned immediately.
//! - [`poll_until`]: run a check that either finishes with a value or asks to
//!   be run again after a given delay. The check chooses the delay, which lets
//!   a single loop back off differently per failure kind.
//!
//! Neither primitive is cancellable from the inside. Unbounded policies keep
//! going until the operation succeeds; callers wanting a deadline wrap the
//! whole launch in a timeout.
//!
//! # Example
//!
//! ```ignore
//! use meshbed_common::retry::{retry_when, RetryPolicy};
//!
//! let leader = retry_when(
//!     &RetryPolicy::fixed(Duration::from_millis(250)),
//!     "acl_bootstrap",
//!     |e| e.is_acl_not_bootstrapped(),
//!     || async { client.acl_bootstrap(&token).await },
//! ).await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

/// Interval and attempt bound for a retry loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay between attempts
    pub interval: Duration,
}

impl RetryPolicy {
    /// Retry forever with a fixed interval
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            max_attempts: 0,
            interval,
        }
    }

    /// Retry at most `attempts` times with a fixed interval
    pub const fn bounded(interval: Duration, attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            interval,
        }
    }

    /// Whether the policy gives up after some number of attempts
    pub fn is_bounded(&self) -> bool {
        self.max_attempts > 0
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Named policies used by the deployment pipeline.
pub mod policies {
    use super::RetryPolicy;
    use std::time::Duration;

    /// Network and volume creation: a subnet collision is not self-healing,
    /// so give up after five tries.
    pub const NETWORK_PROVISION: RetryPolicy = RetryPolicy::bounded(Duration::from_secs(1), 5);

    /// ACL bootstrap and token liveness checks.
    pub const ACL_BOOTSTRAP: RetryPolicy = RetryPolicy::fixed(Duration::from_millis(250));

    /// Leader discovery.
    pub const LEADER: RetryPolicy = RetryPolicy::fixed(Duration::from_millis(500));

    /// Local-write readiness (KV put, placeholder partition).
    pub const LOCAL_WRITES: RetryPolicy = RetryPolicy::fixed(Duration::from_millis(500));

    /// First anti-entropy sync of every agent.
    pub const ANTI_ENTROPY: RetryPolicy = RetryPolicy::fixed(Duration::from_secs(1));

    /// Token-resolution races on registration and peering setup.
    pub const TOKEN_RACE: RetryPolicy = RetryPolicy::fixed(Duration::from_millis(50));

    /// Peering lookup failed, errored, or the peering is not visible yet.
    pub const PEERING_LOOKUP: RetryPolicy = RetryPolicy::fixed(Duration::from_millis(100));

    /// Peering exists but is not active yet.
    pub const PEERING_PENDING: RetryPolicy = RetryPolicy::fixed(Duration::from_millis(500));
}

/// Execute an async operation, retrying only errors matched by `is_transient`.
///
/// # Arguments
/// * `policy` - Interval and attempt bound
/// * `operation_name` - Name for logging purposes
/// * `is_transient` - Returns true for errors worth another attempt
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, the first non-transient error, or the last
/// transient error once a bounded policy is exhausted.
pub async fn retry_when<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_transient(&e) => return Err(e),
            Err(e) => {
                if policy.exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = policy.interval.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// Outcome of a single [`poll_until`] check.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The condition holds; stop polling with this value
    Done(T),
    /// The condition does not hold yet; check again after `after`
    Again {
        /// Delay before the next check
        after: Duration,
        /// Why the check has to be repeated, for logging
        reason: String,
    },
}

impl<T> Attempt<T> {
    /// Repeat the check after the interval of `policy`
    pub fn again(policy: &RetryPolicy, reason: impl Into<String>) -> Self {
        Attempt::Again {
            after: policy.interval,
            reason: reason.into(),
        }
    }
}

/// Run `check` until it reports [`Attempt::Done`].
///
/// Errors returned by `check` are not retried; a check that wants to tolerate
/// an error reports [`Attempt::Again`] instead.
pub async fn poll_until<F, Fut, T, E>(operation_name: &str, mut check: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match check().await? {
            Attempt::Done(value) => {
                debug!(operation = %operation_name, attempt = attempt, "condition reached");
                return Ok(value);
            }
            Attempt::Again { after, reason } => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    reason = %reason,
                    delay_ms = after.as_millis(),
                    "condition not reached yet"
                );
                tokio::time::sleep(after).await;
            }
        }
    }
}
