//! CloudTrail-shaped audit record parsing (§4.A, §6).
//!
//! Grounded on `analyzer/tasks.py::_parse_log_for_ec2_instance_events` /
//! `_parse_log_for_ami_tag_events` / `_is_valid_event` (original_source):
//! the filtering predicate, the event-name table, and the
//! `responseElements.instancesSet.items[*].instanceId` /
//! `requestParameters.resourcesSet.items[*].resourceId` extraction shapes
//! are reproduced field-for-field.

use crate::{map_event_name, RawInstanceEvent, OPENSHIFT_TAG_KEY};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use usage_shared::error::UsageError;
use usage_shared::model::AccountId;

/// One record from an audit object's top-level `Records` array (§4.A, §6).
#[derive(Clone, Debug, Deserialize)]
pub struct AuditRecord {
    #[serde(rename = "eventSource")]
    pub event_source: Option<String>,
    #[serde(rename = "eventName")]
    pub event_name: Option<String>,
    #[serde(rename = "eventTime")]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "awsRegion")]
    pub aws_region: Option<String>,
    #[serde(rename = "userIdentity")]
    pub user_identity: Option<UserIdentity>,
    #[serde(rename = "requestParameters")]
    pub request_parameters: Option<serde_json::Value>,
    #[serde(rename = "responseElements")]
    pub response_elements: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UserIdentity {
    #[serde(rename = "accountId")]
    pub account_id: Option<String>,
}

/// A tag create/delete event on an AMI-shaped resource (§4.A tag_event
/// side-channel).
#[derive(Clone, Debug, PartialEq)]
pub struct TagEvent {
    pub occurred_at: DateTime<Utc>,
    pub cloud_account_id: String,
    pub region: String,
    pub image_cloud_id: String,
    pub tag_present: bool,
}

/// The result of parsing one audit object: the instance events and tag
/// events it yielded, each still missing its internal `account_id`
/// binding (filled by the caller from the record's `cloud_account_id`).
#[derive(Debug)]
pub struct ParsedRecord {
    pub instance_events: Vec<(String, RawInstanceEvent)>,
    pub tag_events: Vec<TagEvent>,
}

/// `_is_valid_event` (original_source): an EC2 record counts only when its
/// source, error state, and event name all pass (§4.A filtering rules).
fn is_valid_event(record: &AuditRecord, recognized: &[&str]) -> bool {
    record.event_source.as_deref() == Some("ec2.amazonaws.com")
        && record.error_code.is_none()
        && record
            .event_name
            .as_deref()
            .is_some_and(|name| recognized.contains(&name))
}

const INSTANCE_EVENT_NAMES: &[&str] = &[
    "RunInstances",
    "StartInstance",
    "StartInstances",
    "StopInstances",
    "TerminateInstances",
    "TerminateInstanceInAutoScalingGroup",
    "ModifyInstanceAttribute",
];

const TAG_EVENT_NAMES: &[&str] = &["CreateTags", "DeleteTags"];

/// Parses one audit record into zero or more instance events (§4.A). The
/// `account_id` placeholder in the returned tuples is the cloud-native
/// account id string from `userIdentity.accountId`; resolving that to an
/// internal `AccountId` is the caller's job (it needs a store lookup this
/// pure function must not perform).
fn parse_instance_events(record: &AuditRecord) -> Vec<(String, RawInstanceEvent)> {
    if !is_valid_event(record, INSTANCE_EVENT_NAMES) {
        return Vec::new();
    }
    let Some(occurred_at) = record.event_time else {
        return Vec::new();
    };
    let Some(cloud_account_id) = record.user_identity.as_ref().and_then(|u| u.account_id.clone())
    else {
        return Vec::new();
    };
    let Some(region) = record.aws_region.clone() else {
        return Vec::new();
    };
    let Some(event_type) = record.event_name.as_deref().and_then(map_event_name) else {
        return Vec::new();
    };

    let mut instance_type = None;
    let instance_ids: Vec<String> = if event_type == usage_shared::model::EventType::AttributeChange {
        let Some(params) = &record.request_parameters else {
            log::debug!("did not find requestParameters in attribute_change record");
            return Vec::new();
        };
        let Some(value) = params
            .get("instanceType")
            .and_then(|v| v.get("value"))
            .and_then(|v| v.as_str())
        else {
            log::debug!("did not find instanceType in record: {params:?}");
            return Vec::new();
        };
        instance_type = Some(value.to_string());
        match params.get("instanceId").and_then(|v| v.as_str()) {
            Some(id) => vec![id.to_string()],
            None => return Vec::new(),
        }
    } else {
        record
            .response_elements
            .as_ref()
            .and_then(|r| r.get("instancesSet"))
            .and_then(|s| s.get("items"))
            .and_then(|i| i.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("instanceId").and_then(|v| v.as_str()))
                    .map(|s| s.to_string())
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    };

    instance_ids
        .into_iter()
        .map(|cloud_instance_id| {
            (
                cloud_account_id.clone(),
                RawInstanceEvent {
                    account_id: AccountId::nil(),
                    cloud_instance_id,
                    region: region.clone(),
                    occurred_at,
                    event_type,
                    instance_type: instance_type.clone(),
                    image_cloud_id: None,
                },
            )
        })
        .collect()
}

/// `_parse_log_for_ami_tag_events` (original_source): only resources whose
/// id starts with `ami-` and tags in the configured key set (currently
/// just the OpenShift tag) produce a [`TagEvent`].
fn parse_tag_events(record: &AuditRecord) -> Vec<TagEvent> {
    if !is_valid_event(record, TAG_EVENT_NAMES) {
        return Vec::new();
    }
    let Some(occurred_at) = record.event_time else {
        return Vec::new();
    };
    let Some(cloud_account_id) = record.user_identity.as_ref().and_then(|u| u.account_id.clone())
    else {
        return Vec::new();
    };
    let Some(region) = record.aws_region.clone() else {
        return Vec::new();
    };
    let tag_present = record.event_name.as_deref() == Some("CreateTags");

    let Some(params) = &record.request_parameters else {
        return Vec::new();
    };
    let image_ids: Vec<String> = params
        .get("resourcesSet")
        .and_then(|s| s.get("items"))
        .and_then(|i| i.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("resourceId").and_then(|v| v.as_str()))
                .filter(|id| id.starts_with("ami-"))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    let has_openshift_tag = params
        .get("tagSet")
        .and_then(|s| s.get("items"))
        .and_then(|i| i.as_array())
        .is_some_and(|items| {
            items
                .iter()
                .any(|item| item.get("key").and_then(|v| v.as_str()) == Some(OPENSHIFT_TAG_KEY))
        });
    if !has_openshift_tag {
        return Vec::new();
    }

    image_ids
        .into_iter()
        .map(|image_cloud_id| TagEvent {
            occurred_at,
            cloud_account_id: cloud_account_id.clone(),
            region: region.clone(),
            image_cloud_id,
            tag_present,
        })
        .collect()
}

/// Parses a whole audit object (the JSON body fetched from the bucket/key
/// named in an S3 notification, §6) into instance and tag events.
pub fn parse_audit_object(body: &[u8]) -> Result<ParsedRecord, UsageError> {
    #[derive(Deserialize)]
    struct AuditObject {
        #[serde(rename = "Records", default)]
        records: Vec<AuditRecord>,
    }
    let object: AuditObject = serde_json::from_slice(body)
        .map_err(|e| UsageError::CorruptPayload(e.to_string()))?;

    let mut instance_events = Vec::new();
    let mut tag_events = Vec::new();
    for record in &object.records {
        instance_events.extend(parse_instance_events(record));
        tag_events.extend(parse_tag_events(record));
    }
    Ok(ParsedRecord {
        instance_events,
        tag_events,
    })
}
