use super::{ImageId, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical event shape produced by the normalizer (component A) from
/// either a CloudTrail-style audit record or a periodic describe snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PowerOn,
    PowerOff,
    AttributeChange,
}

/// One observed change for an instance.
///
/// An event with `occurred_at < account.created_at` MUST be discarded on
/// ingest (§3); this is enforced by the normalizer and reconciler, not by
/// this type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub instance_id: InstanceId,
    pub occurred_at: DateTime<Utc>,
    pub event_type: EventType,
    pub instance_type: Option<String>,
    pub subnet: Option<String>,
    pub image_ref: Option<ImageId>,
    /// Tie-break for events sharing the same `occurred_at`: insertion/
    /// ingest order, ascending (§4.D contract: "ties broken by insertion
    /// order").
    pub sequence: u64,
}

impl InstanceEvent {
    /// Ordering key used everywhere the reconciler needs total order over
    /// a history: `occurred_at` ascending, ties by `sequence` ascending.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.occurred_at, self.sequence)
    }
}
