//! The Postgres-backed [`Store`] implementation (§5, §9's persistence
//! discussion): one `sqlx::PgPool`, one SQL statement per trait method,
//! runtime-checked rather than `query_as!`-checked since no database is
//! available at workspace build time — the same choice the pack's
//! `scheduler-reconciler.rs` reference makes for its own `PgPool` queries.
//!
//! The teacher has no relational store of its own (its `KubeInterface`
//! treats the Kubernetes API server as the datastore); this crate is new,
//! grounded on the broader pack's sqlx usage rather than on any one
//! teacher file.

mod codec;
mod rows;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use codec::{
    cloud_type_to_text, event_type_to_text, image_platform_to_text, image_status_to_text,
};
use rows::{
    day_bounds, AccountRow, EventRow, ImageRow, InstanceRow, InstanceTypeRow, RunRow,
    RunWithImageRow,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use usage_shared::error::{Resource, UsageError};
use usage_shared::model::{
    Account, AccountId, CloudType, ConcurrentUsage, ImageId, Instance, InstanceEvent, InstanceId,
    InstanceTypeDefinition, MachineImage, Run,
};
use usage_shared::store::Store;

/// Embeds `migrations/` into the binary so `PgStore::connect` can bring a
/// fresh database up to date without a separate deploy step.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, UsageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| UsageError::Other(anyhow::anyhow!(e)))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), UsageError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| UsageError::Other(anyhow::anyhow!(e)))
    }
}

fn db_err(e: sqlx::Error) -> UsageError {
    UsageError::Other(anyhow::anyhow!(e))
}

#[async_trait]
impl Store for PgStore {
    async fn get_account(&self, id: AccountId) -> Result<Account, UsageError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, cloud_type, cloud_account_id, user_name, arn_or_subscription, created_at, enabled_at
             FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| UsageError::NotFound(Resource::Account, id.to_string()))?;
        row.try_into()
    }

    async fn find_account_by_cloud_id(
        &self,
        cloud_type: CloudType,
        cloud_account_id: &str,
    ) -> Result<Option<Account>, UsageError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, cloud_type, cloud_account_id, user_name, arn_or_subscription, created_at, enabled_at
             FROM accounts WHERE cloud_type = $1 AND cloud_account_id = $2",
        )
        .bind(cloud_type_to_text(cloud_type))
        .bind(cloud_account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn upsert_instance(&self, instance: Instance) -> Result<Instance, UsageError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "INSERT INTO instances (id, account_id, cloud_type, cloud_instance_id, region, current_image)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (cloud_type, cloud_instance_id) DO UPDATE SET region = excluded.region
             RETURNING id, account_id, cloud_type, cloud_instance_id, region, current_image",
        )
        .bind(instance.id)
        .bind(instance.account_id)
        .bind(cloud_type_to_text(instance.cloud_type))
        .bind(&instance.cloud_instance_id)
        .bind(&instance.region)
        .bind(instance.current_image)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_into()
    }

    async fn find_instance_by_cloud_id(
        &self,
        account_id: AccountId,
        cloud_instance_id: &str,
    ) -> Result<Option<Instance>, UsageError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, account_id, cloud_type, cloud_instance_id, region, current_image
             FROM instances WHERE account_id = $1 AND cloud_instance_id = $2",
        )
        .bind(account_id)
        .bind(cloud_instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Instance, UsageError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, account_id, cloud_type, cloud_instance_id, region, current_image
             FROM instances WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| UsageError::NotFound(Resource::Instance, id.to_string()))?;
        row.try_into()
    }

    async fn bind_instance_image_if_unset(
        &self,
        id: InstanceId,
        image_ref: ImageId,
    ) -> Result<Instance, UsageError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "UPDATE instances SET current_image = $2
             WHERE id = $1 AND current_image IS NULL
             RETURNING id, account_id, cloud_type, cloud_instance_id, region, current_image",
        )
        .bind(id)
        .bind(image_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => row.try_into(),
            None => self.get_instance(id).await,
        }
    }

    async fn append_events(&self, events: Vec<InstanceEvent>) -> Result<(), UsageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for event in events {
            sqlx::query(
                "INSERT INTO instance_events
                     (instance_id, occurred_at, event_type, instance_type, subnet, image_ref, sequence)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (instance_id, occurred_at, event_type, sequence) DO NOTHING",
            )
            .bind(event.instance_id)
            .bind(event.occurred_at)
            .bind(event_type_to_text(event.event_type))
            .bind(&event.instance_type)
            .bind(&event.subnet)
            .bind(event.image_ref)
            .bind(event.sequence as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn load_events_since(
        &self,
        instance_id: InstanceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<InstanceEvent>, UsageError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT instance_id, occurred_at, event_type, instance_type, subnet, image_ref, sequence
             FROM instance_events
             WHERE instance_id = $1 AND occurred_at >= $2
             ORDER BY occurred_at ASC, sequence ASC",
        )
        .bind(instance_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn load_anchor_event(
        &self,
        instance_id: InstanceId,
        before: DateTime<Utc>,
    ) -> Result<Option<InstanceEvent>, UsageError> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT instance_id, occurred_at, event_type, instance_type, subnet, image_ref, sequence
             FROM instance_events
             WHERE instance_id = $1 AND occurred_at < $2
             ORDER BY occurred_at DESC, sequence DESC
             LIMIT 1",
        )
        .bind(instance_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn load_runs_for_instance(&self, instance_id: InstanceId) -> Result<Vec<Run>, UsageError> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT instance_id, start_time, end_time, image_ref, instance_type, memory_mib, vcpu
             FROM runs WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn replace_runs_from_watermark(
        &self,
        instance_id: InstanceId,
        watermark: DateTime<Utc>,
        runs: Vec<Run>,
    ) -> Result<(), UsageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "DELETE FROM runs
             WHERE instance_id = $1 AND (end_time IS NULL OR start_time >= $2)",
        )
        .bind(instance_id)
        .bind(watermark)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        for run in runs {
            sqlx::query(
                "INSERT INTO runs (instance_id, start_time, end_time, image_ref, instance_type, memory_mib, vcpu)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(run.instance_id)
            .bind(run.start_time)
            .bind(run.end_time)
            .bind(run.image_ref)
            .bind(&run.instance_type)
            .bind(run.memory_mib)
            .bind(run.vcpu)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn load_runs_for_day(
        &self,
        user: &str,
        day: NaiveDate,
    ) -> Result<Vec<(Run, Option<MachineImage>)>, UsageError> {
        let (day_start, day_end) = day_bounds(day);
        let rows = sqlx::query_as::<_, RunWithImageRow>(
            "SELECT r.instance_id, r.start_time, r.end_time, r.image_ref, r.instance_type,
                    r.memory_mib, r.vcpu,
                    mi.id AS img_id, mi.cloud_type AS img_cloud_type,
                    mi.cloud_image_id AS img_cloud_image_id, mi.name AS img_name,
                    mi.owner_cloud_account_id AS img_owner_cloud_account_id,
                    mi.platform AS img_platform, mi.status AS img_status,
                    mi.inspection_json AS img_inspection_json,
                    mi.rhel_detected_by_tag AS img_rhel_detected_by_tag,
                    mi.openshift_detected AS img_openshift_detected,
                    mi.rhel_challenged AS img_rhel_challenged,
                    mi.openshift_challenged AS img_openshift_challenged,
                    mi.is_encrypted AS img_is_encrypted,
                    mi.is_marketplace AS img_is_marketplace,
                    mi.is_cloud_access AS img_is_cloud_access,
                    mi.inspection_attempts AS img_inspection_attempts,
                    mi.openshift_tag_applied_at AS img_openshift_tag_applied_at,
                    mi.discovered_at AS img_discovered_at
             FROM runs r
             JOIN instances i ON i.id = r.instance_id
             JOIN accounts a ON a.id = i.account_id
             LEFT JOIN machine_images mi ON mi.id = r.image_ref
             WHERE a.user_name = $1
               AND r.start_time < $3
               AND (r.end_time IS NULL OR r.end_time > $2)",
        )
        .bind(user)
        .bind(day_start)
        .bind(day_end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn upsert_image_stub(
        &self,
        cloud_type: CloudType,
        cloud_image_id: &str,
    ) -> Result<MachineImage, UsageError> {
        let row = sqlx::query_as::<_, ImageRow>(
            "INSERT INTO machine_images (id, cloud_type, cloud_image_id, platform, status)
             VALUES ($1, $2, $3, 'none', 'pending')
             ON CONFLICT (cloud_type, cloud_image_id) DO UPDATE SET cloud_type = excluded.cloud_type
             RETURNING id, cloud_type, cloud_image_id, name, owner_cloud_account_id, platform, status,
                       inspection_json, rhel_detected_by_tag, openshift_detected, rhel_challenged,
                       openshift_challenged, is_encrypted, is_marketplace, is_cloud_access,
                       inspection_attempts, openshift_tag_applied_at, discovered_at",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(cloud_type_to_text(cloud_type))
        .bind(cloud_image_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_into()
    }

    async fn find_image_by_cloud_id(
        &self,
        cloud_type: CloudType,
        cloud_image_id: &str,
    ) -> Result<Option<MachineImage>, UsageError> {
        let row = sqlx::query_as::<_, ImageRow>(
            "SELECT id, cloud_type, cloud_image_id, name, owner_cloud_account_id, platform, status,
                    inspection_json, rhel_detected_by_tag, openshift_detected, rhel_challenged,
                    openshift_challenged, is_encrypted, is_marketplace, is_cloud_access,
                    inspection_attempts, openshift_tag_applied_at, discovered_at
             FROM machine_images WHERE cloud_type = $1 AND cloud_image_id = $2",
        )
        .bind(cloud_type_to_text(cloud_type))
        .bind(cloud_image_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_image(&self, id: ImageId) -> Result<MachineImage, UsageError> {
        let row = sqlx::query_as::<_, ImageRow>(
            "SELECT id, cloud_type, cloud_image_id, name, owner_cloud_account_id, platform, status,
                    inspection_json, rhel_detected_by_tag, openshift_detected, rhel_challenged,
                    openshift_challenged, is_encrypted, is_marketplace, is_cloud_access,
                    inspection_attempts, openshift_tag_applied_at, discovered_at
             FROM machine_images WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| UsageError::NotFound(Resource::MachineImage, id.to_string()))?;
        row.try_into()
    }

    async fn save_image(&self, image: MachineImage) -> Result<MachineImage, UsageError> {
        let inspection_json = image
            .inspection_json
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| UsageError::CorruptPayload(e.to_string()))?;
        let row = sqlx::query_as::<_, ImageRow>(
            "UPDATE machine_images SET
                 name = $2, owner_cloud_account_id = $3, platform = $4, status = $5,
                 inspection_json = $6, rhel_detected_by_tag = $7, openshift_detected = $8,
                 rhel_challenged = $9, openshift_challenged = $10, is_encrypted = $11,
                 is_marketplace = $12, is_cloud_access = $13, inspection_attempts = $14,
                 openshift_tag_applied_at = $15
             WHERE id = $1
             RETURNING id, cloud_type, cloud_image_id, name, owner_cloud_account_id, platform, status,
                       inspection_json, rhel_detected_by_tag, openshift_detected, rhel_challenged,
                       openshift_challenged, is_encrypted, is_marketplace, is_cloud_access,
                       inspection_attempts, openshift_tag_applied_at, discovered_at",
        )
        .bind(image.id)
        .bind(&image.name)
        .bind(&image.owner_cloud_account_id)
        .bind(image_platform_to_text(image.platform))
        .bind(image_status_to_text(image.status))
        .bind(inspection_json)
        .bind(image.rhel_detected_by_tag)
        .bind(image.openshift_detected)
        .bind(image.rhel_challenged)
        .bind(image.openshift_challenged)
        .bind(image.is_encrypted)
        .bind(image.is_marketplace)
        .bind(image.is_cloud_access)
        .bind(image.inspection_attempts as i32)
        .bind(image.openshift_tag_applied_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| UsageError::NotFound(Resource::MachineImage, image.id.to_string()))?;
        row.try_into()
    }

    async fn load_pending_images(&self, limit: u32) -> Result<Vec<MachineImage>, UsageError> {
        let rows = sqlx::query_as::<_, ImageRow>(
            "SELECT id, cloud_type, cloud_image_id, name, owner_cloud_account_id, platform, status,
                    inspection_json, rhel_detected_by_tag, openshift_detected, rhel_challenged,
                    openshift_challenged, is_encrypted, is_marketplace, is_cloud_access,
                    inspection_attempts, openshift_tag_applied_at, discovered_at
             FROM machine_images
             WHERE status = 'pending'
             ORDER BY discovered_at ASC
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn load_instance_type_definitions(&self) -> Result<Vec<InstanceTypeDefinition>, UsageError> {
        let rows = sqlx::query_as::<_, InstanceTypeRow>(
            "SELECT cloud_type, instance_type, vcpu, memory_mib FROM instance_type_definitions",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn save_concurrent_usage(&self, usage: ConcurrentUsage) -> Result<(), UsageError> {
        sqlx::query(
            "INSERT INTO concurrent_usage
                 (user_name, date, rhel_max_vcpu, rhel_max_memory_mib, rhel_max_instances,
                  openshift_max_vcpu, openshift_max_memory_mib, openshift_max_instances)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (user_name, date) DO UPDATE SET
                 rhel_max_vcpu = excluded.rhel_max_vcpu,
                 rhel_max_memory_mib = excluded.rhel_max_memory_mib,
                 rhel_max_instances = excluded.rhel_max_instances,
                 openshift_max_vcpu = excluded.openshift_max_vcpu,
                 openshift_max_memory_mib = excluded.openshift_max_memory_mib,
                 openshift_max_instances = excluded.openshift_max_instances",
        )
        .bind(&usage.user)
        .bind(usage.date)
        .bind(usage.rhel_max_vcpu)
        .bind(usage.rhel_max_memory_mib)
        .bind(usage.rhel_max_instances)
        .bind(usage.openshift_max_vcpu)
        .bind(usage.openshift_max_memory_mib)
        .bind(usage.openshift_max_instances)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_distinct_users_active_on(&self, day: NaiveDate) -> Result<Vec<String>, UsageError> {
        let (day_start, day_end) = day_bounds(day);
        let rows = sqlx::query(
            "SELECT DISTINCT a.user_name
             FROM runs r
             JOIN instances i ON i.id = r.instance_id
             JOIN accounts a ON a.id = i.account_id
             WHERE r.start_time < $2 AND (r.end_time IS NULL OR r.end_time > $1)",
        )
        .bind(day_start)
        .bind(day_end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("user_name").map_err(db_err))
            .collect()
    }
}
