//! Error kinds per §7's error-handling table, shared by every component
//! crate so the worker binary can match on them uniformly instead of each
//! crate inventing its own `NotFound`/`TransientCloud` variant.

use thiserror::Error;

/// Which resource kind a `NotFound` couldn't locate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Instance,
    MachineImage,
    Snapshot,
    Account,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Resource::Instance => "instance",
            Resource::MachineImage => "machine image",
            Resource::Snapshot => "snapshot",
            Resource::Account => "account",
        };
        write!(f, "{s}")
    }
}

#[derive(Error, Debug)]
pub enum UsageError {
    /// A cloud API call failed for a reason expected to clear up on retry.
    #[error("transient cloud error: {0}")]
    TransientCloud(String),

    /// Our access to the account/resource was revoked.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The referenced resource no longer exists.
    #[error("{0} not found: {1}")]
    NotFound(Resource, String),

    /// An ingested payload could not be parsed.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    /// The reconciler detected an event that would violate a run invariant
    /// (e.g. an image change mid-run, §4.D rule 5).
    #[error("run invariant violation: {0}")]
    RunInvariantViolation(String),

    /// An image's snapshot is encrypted and cannot be inspected.
    #[error("inspection target is encrypted")]
    InspectionEncrypted,

    /// An image exceeded its configured inspection attempt cap.
    #[error("inspection attempts exhausted")]
    QuotaExhausted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UsageError {
    /// Whether the failure should be retried by redelivering the queue
    /// message, per §7's recovery policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UsageError::TransientCloud(_) | UsageError::CorruptPayload(_))
    }
}
