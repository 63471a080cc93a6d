use thiserror::Error;
use usage_shared::model::InstanceId;

/// Errors the pure reconciliation algorithm itself can raise. Deliberately
/// narrower than `usage_shared::error::UsageError`: a pure function over an
/// event slice has no cloud, no permissions, no queue — only the one
/// invariant violation §4.D rule 5 names.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// An event inside an already-open run carried an `image_ref` that
    /// disagreed with the run's bound image (§4.D rule 5, §8.6).
    #[error("instance {instance_id}: image changed mid-run at {at}")]
    ImageChangedMidRun {
        instance_id: InstanceId,
        at: chrono::DateTime<chrono::Utc>,
    },
}

impl From<ReconcileError> for usage_shared::error::UsageError {
    fn from(err: ReconcileError) -> Self {
        usage_shared::error::UsageError::RunInvariantViolation(err.to_string())
    }
}
