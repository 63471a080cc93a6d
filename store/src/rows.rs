//! `sqlx::FromRow` shapes mirroring the tables in `migrations/0001_init.sql`,
//! with a fallible conversion into each model type so a corrupt enum column
//! surfaces as `UsageError::CorruptPayload` rather than a panic.

use crate::codec::{
    cloud_type_from_text, event_type_from_text, image_platform_from_text, image_status_from_text,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use usage_shared::error::UsageError;
use usage_shared::model::{Account, Instance, InstanceEvent, InstanceTypeDefinition, MachineImage, Run};
use uuid::Uuid;

#[derive(FromRow)]
pub struct AccountRow {
    pub id: Uuid,
    pub cloud_type: String,
    pub cloud_account_id: String,
    pub user_name: String,
    pub arn_or_subscription: String,
    pub created_at: DateTime<Utc>,
    pub enabled_at: Option<DateTime<Utc>>,
}

impl TryFrom<AccountRow> for Account {
    type Error = UsageError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: row.id,
            cloud_type: cloud_type_from_text(&row.cloud_type)?,
            cloud_account_id: row.cloud_account_id,
            user: row.user_name,
            arn_or_subscription: row.arn_or_subscription,
            created_at: row.created_at,
            enabled_at: row.enabled_at,
        })
    }
}

#[derive(FromRow)]
pub struct InstanceRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub cloud_type: String,
    pub cloud_instance_id: String,
    pub region: String,
    pub current_image: Option<Uuid>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = UsageError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Instance {
            id: row.id,
            account_id: row.account_id,
            cloud_type: cloud_type_from_text(&row.cloud_type)?,
            cloud_instance_id: row.cloud_instance_id,
            region: row.region,
            current_image: row.current_image,
        })
    }
}

#[derive(FromRow)]
pub struct EventRow {
    pub instance_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
    pub instance_type: Option<String>,
    pub subnet: Option<String>,
    pub image_ref: Option<Uuid>,
    pub sequence: i64,
}

impl TryFrom<EventRow> for InstanceEvent {
    type Error = UsageError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(InstanceEvent {
            instance_id: row.instance_id,
            occurred_at: row.occurred_at,
            event_type: event_type_from_text(&row.event_type)?,
            instance_type: row.instance_type,
            subnet: row.subnet,
            image_ref: row.image_ref,
            sequence: row.sequence as u64,
        })
    }
}

#[derive(FromRow)]
pub struct RunRow {
    pub instance_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub image_ref: Option<Uuid>,
    pub instance_type: Option<String>,
    pub memory_mib: Option<f64>,
    pub vcpu: Option<i32>,
}

impl From<RunRow> for Run {
    fn from(row: RunRow) -> Self {
        Run {
            instance_id: row.instance_id,
            start_time: row.start_time,
            end_time: row.end_time,
            image_ref: row.image_ref,
            instance_type: row.instance_type,
            memory_mib: row.memory_mib,
            vcpu: row.vcpu,
        }
    }
}

#[derive(FromRow)]
pub struct ImageRow {
    pub id: Uuid,
    pub cloud_type: String,
    pub cloud_image_id: String,
    pub name: Option<String>,
    pub owner_cloud_account_id: Option<String>,
    pub platform: String,
    pub status: String,
    pub inspection_json: Option<serde_json::Value>,
    pub rhel_detected_by_tag: bool,
    pub openshift_detected: bool,
    pub rhel_challenged: bool,
    pub openshift_challenged: bool,
    pub is_encrypted: bool,
    pub is_marketplace: bool,
    pub is_cloud_access: bool,
    pub inspection_attempts: i32,
    pub openshift_tag_applied_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

impl TryFrom<ImageRow> for MachineImage {
    type Error = UsageError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let inspection_json = row
            .inspection_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| UsageError::CorruptPayload(e.to_string()))?;
        Ok(MachineImage {
            id: row.id,
            cloud_type: cloud_type_from_text(&row.cloud_type)?,
            cloud_image_id: row.cloud_image_id,
            name: row.name,
            owner_cloud_account_id: row.owner_cloud_account_id,
            platform: image_platform_from_text(&row.platform)?,
            status: image_status_from_text(&row.status)?,
            inspection_json,
            rhel_detected_by_tag: row.rhel_detected_by_tag,
            openshift_detected: row.openshift_detected,
            rhel_challenged: row.rhel_challenged,
            openshift_challenged: row.openshift_challenged,
            is_encrypted: row.is_encrypted,
            is_marketplace: row.is_marketplace,
            is_cloud_access: row.is_cloud_access,
            inspection_attempts: row.inspection_attempts as u32,
            openshift_tag_applied_at: row.openshift_tag_applied_at,
            discovered_at: row.discovered_at,
        })
    }
}

#[derive(FromRow)]
pub struct InstanceTypeRow {
    pub cloud_type: String,
    pub instance_type: String,
    pub vcpu: i32,
    pub memory_mib: f64,
}

impl TryFrom<InstanceTypeRow> for InstanceTypeDefinition {
    type Error = UsageError;

    fn try_from(row: InstanceTypeRow) -> Result<Self, Self::Error> {
        Ok(InstanceTypeDefinition {
            cloud_type: cloud_type_from_text(&row.cloud_type)?,
            instance_type: row.instance_type,
            vcpu: row.vcpu,
            memory_mib: row.memory_mib,
        })
    }
}

/// A run joined with the `MachineImage` it's bound to, for
/// `load_runs_for_day` (§4.F) — `img_*` columns are all `NULL` when the run
/// has no bound image yet.
#[derive(FromRow)]
pub struct RunWithImageRow {
    pub instance_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub image_ref: Option<Uuid>,
    pub instance_type: Option<String>,
    pub memory_mib: Option<f64>,
    pub vcpu: Option<i32>,
    pub img_id: Option<Uuid>,
    pub img_cloud_type: Option<String>,
    pub img_cloud_image_id: Option<String>,
    pub img_name: Option<String>,
    pub img_owner_cloud_account_id: Option<String>,
    pub img_platform: Option<String>,
    pub img_status: Option<String>,
    pub img_inspection_json: Option<serde_json::Value>,
    pub img_rhel_detected_by_tag: Option<bool>,
    pub img_openshift_detected: Option<bool>,
    pub img_rhel_challenged: Option<bool>,
    pub img_openshift_challenged: Option<bool>,
    pub img_is_encrypted: Option<bool>,
    pub img_is_marketplace: Option<bool>,
    pub img_is_cloud_access: Option<bool>,
    pub img_inspection_attempts: Option<i32>,
    pub img_openshift_tag_applied_at: Option<DateTime<Utc>>,
    pub img_discovered_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunWithImageRow> for (Run, Option<MachineImage>) {
    type Error = UsageError;

    fn try_from(row: RunWithImageRow) -> Result<Self, Self::Error> {
        let run = Run {
            instance_id: row.instance_id,
            start_time: row.start_time,
            end_time: row.end_time,
            image_ref: row.image_ref,
            instance_type: row.instance_type,
            memory_mib: row.memory_mib,
            vcpu: row.vcpu,
        };
        let image = match row.img_id {
            None => None,
            Some(id) => {
                let inspection_json = row
                    .img_inspection_json
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| UsageError::CorruptPayload(e.to_string()))?;
                Some(MachineImage {
                    id,
                    cloud_type: cloud_type_from_text(&row.img_cloud_type.unwrap_or_default())?,
                    cloud_image_id: row.img_cloud_image_id.unwrap_or_default(),
                    name: row.img_name,
                    owner_cloud_account_id: row.img_owner_cloud_account_id,
                    platform: image_platform_from_text(&row.img_platform.unwrap_or_default())?,
                    status: image_status_from_text(&row.img_status.unwrap_or_default())?,
                    inspection_json,
                    rhel_detected_by_tag: row.img_rhel_detected_by_tag.unwrap_or(false),
                    openshift_detected: row.img_openshift_detected.unwrap_or(false),
                    rhel_challenged: row.img_rhel_challenged.unwrap_or(false),
                    openshift_challenged: row.img_openshift_challenged.unwrap_or(false),
                    is_encrypted: row.img_is_encrypted.unwrap_or(false),
                    is_marketplace: row.img_is_marketplace.unwrap_or(false),
                    is_cloud_access: row.img_is_cloud_access.unwrap_or(false),
                    inspection_attempts: row.img_inspection_attempts.unwrap_or(0) as u32,
                    openshift_tag_applied_at: row.img_openshift_tag_applied_at,
                    discovered_at: row.img_discovered_at.unwrap_or(DateTime::UNIX_EPOCH),
                })
            }
        };
        Ok((run, image))
    }
}

pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_hms_opt(0, 0, 0).unwrap().and_utc();
    (start, start + chrono::Duration::days(1))
}
