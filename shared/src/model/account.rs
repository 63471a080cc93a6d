use super::CloudType;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub type AccountId = Uuid;

/// A customer's enrolled cloud account.
///
/// Uniqueness is on `(cloud_type, cloud_account_id)`. Disabling an account
/// stops all ingest for it but does not delete any of its records; deleting
/// one cascades to `Instance`/`InstanceEvent`/`Run` but never to
/// `MachineImage` (other accounts may reference the same image).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub cloud_type: CloudType,
    /// AWS account id or Azure subscription id, as a string.
    pub cloud_account_id: String,
    pub user: String,
    /// ARN (AWS) or subscription credential reference (Azure).
    pub arn_or_subscription: String,
    pub created_at: DateTime<Utc>,
    pub enabled_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn is_enabled(&self) -> bool {
        self.enabled_at.is_some()
    }

    /// Events at or before this instant are never attributed to this
    /// account's instances (see the pre-account cutoff invariant, §8.5).
    pub fn event_watermark(&self) -> DateTime<Utc> {
        self.created_at
    }
}
