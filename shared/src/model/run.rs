use super::{ImageId, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A maximal contiguous interval during which an instance was on, as
/// derived by the reconciler (component D). See §3 and §8 for invariants;
/// this type carries no validation of its own, it is the reconciler's
/// output shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub instance_id: InstanceId,
    pub start_time: DateTime<Utc>,
    /// `None` means this is the open run: the instance is believed to
    /// still be running.
    pub end_time: Option<DateTime<Utc>>,
    pub image_ref: Option<ImageId>,
    pub instance_type: Option<String>,
    pub memory_mib: Option<f64>,
    pub vcpu: Option<i32>,
}

impl Run {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Half-open interval `[start, end)` this run covers, where an open
    /// run's end is treated as unbounded for overlap purposes.
    pub fn overlaps(&self, other: &Run) -> bool {
        let before_other_ends = other.end_time.map_or(true, |end| self.start_time < end);
        let before_self_ends = self.end_time.map_or(true, |end| other.start_time < end);
        before_other_ends && before_self_ends
    }

    /// Whether `instant` falls within this run's `[start, end)` interval,
    /// with an open run extending to `day_end` for the purposes of a
    /// concurrency roll-up over a bounded day.
    pub fn covers_at(&self, instant: DateTime<Utc>, open_run_bound: DateTime<Utc>) -> bool {
        let end = self.end_time.unwrap_or(open_run_bound);
        self.start_time <= instant && instant < end
    }
}
