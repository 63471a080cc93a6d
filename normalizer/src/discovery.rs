//! Initial-discovery and Azure periodic-poll synthesis (§4.A.1, §6).
//!
//! A describe-all snapshot yields one synthetic power event per instance at
//! `now()` rather than an audit-log-derived `occurred_at`, but the two
//! callers disagree on what a stopped instance means: AWS initial discovery
//! has no prior history to reconstruct, so a stopped instance simply isn't
//! running yet and yields no event at all (§4.A.1) — only running instances
//! synthesize a `power_on`. The Azure path has no audit log ever, so each
//! poll must synthesize the instance's *current* state, on or off, to keep
//! runs accurate (§6). These are different event sets, not a shared
//! function with a flag.

use crate::RawInstanceEvent;
use chrono::{DateTime, Utc};
use usage_shared::cloud_client::DescribedInstance;
use usage_shared::model::{AccountId, EventType};

fn raw_event(
    account_id: AccountId,
    region: &str,
    instance: &DescribedInstance,
    now: DateTime<Utc>,
    event_type: EventType,
) -> RawInstanceEvent {
    RawInstanceEvent {
        account_id,
        cloud_instance_id: instance.cloud_instance_id.clone(),
        region: region.to_string(),
        occurred_at: now,
        event_type,
        instance_type: Some(instance.instance_type.clone()),
        image_cloud_id: Some(instance.image_id.clone()),
    }
}

/// AWS initial-discovery synthesis (§4.A.1): a `power_on` for every
/// currently-running instance; a stopped instance yields nothing, since
/// there is no history to synthesize it against. `now` is passed in rather
/// than read from the clock so callers (and tests) control the timestamp.
pub fn aws_discovery_events(
    account_id: AccountId,
    region: &str,
    instances: &[DescribedInstance],
    now: DateTime<Utc>,
) -> Vec<RawInstanceEvent> {
    instances
        .iter()
        .filter(|instance| instance.is_running)
        .map(|instance| raw_event(account_id, region, instance, now, EventType::PowerOn))
        .collect()
}

/// Azure periodic-poll synthesis (§6): one event per described instance
/// reflecting its current power state, `power_on` or `power_off`, since
/// Azure has no audit log to derive state transitions from.
pub fn azure_poll_events(
    account_id: AccountId,
    region: &str,
    instances: &[DescribedInstance],
    now: DateTime<Utc>,
) -> Vec<RawInstanceEvent> {
    instances
        .iter()
        .map(|instance| {
            let event_type = if instance.is_running {
                EventType::PowerOn
            } else {
                EventType::PowerOff
            };
            raw_event(account_id, region, instance, now, event_type)
        })
        .collect()
}
