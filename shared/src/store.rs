//! The persistence seam shared by `registry`, `reconciler`, `inspector` and
//! `rollup`: one mockable trait per the teacher's `KubeInterface`/
//! `SlotQuery` pattern, so those crates hold no SQL and no connection pool
//! of their own. The `store` crate supplies the real (sqlx/Postgres)
//! implementation; tests use `MockStore`.

use crate::error::UsageError;
use crate::model::{
    Account, AccountId, ConcurrentUsage, ImageId, Instance, InstanceEvent, InstanceId,
    InstanceTypeDefinition, MachineImage, Run,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

/// Everything the core pipeline reads or writes, expressed as one seam so
/// each component crate stays a pure function plus this trait object,
/// mirroring the teacher's separation of `main.rs`'s orchestration from
/// `k8s::KubeInterface`'s API calls.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    // -- accounts --------------------------------------------------------

    async fn get_account(&self, id: AccountId) -> Result<Account, UsageError>;

    async fn find_account_by_cloud_id(
        &self,
        cloud_type: crate::model::CloudType,
        cloud_account_id: &str,
    ) -> Result<Option<Account>, UsageError>;

    // -- instances ---------------------------------------------------------

    async fn upsert_instance(&self, instance: Instance) -> Result<Instance, UsageError>;

    async fn find_instance_by_cloud_id(
        &self,
        account_id: AccountId,
        cloud_instance_id: &str,
    ) -> Result<Option<Instance>, UsageError>;

    async fn get_instance(&self, id: InstanceId) -> Result<Instance, UsageError>;

    /// Applies the bind-once image rule transactionally, taking an
    /// instance-row lock for the duration so concurrent ingest for the same
    /// instance can't race past it (§5).
    async fn bind_instance_image_if_unset(
        &self,
        id: InstanceId,
        image_ref: ImageId,
    ) -> Result<Instance, UsageError>;

    // -- events --------------------------------------------------------

    /// Appends newly normalized events; duplicates (same instance,
    /// `occurred_at`, `event_type`, `sequence`) are silently absorbed, not
    /// an error, since redelivery is expected (§4.D idempotence).
    async fn append_events(&self, events: Vec<InstanceEvent>) -> Result<(), UsageError>;

    /// Loads every event for `instance_id` at or after `since`, in
    /// `order_key` order, the input to a watermark-anchored reconcile pass
    /// (§4.D).
    async fn load_events_since(
        &self,
        instance_id: InstanceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<InstanceEvent>, UsageError>;

    /// The single event immediately preceding `before`, if any — the
    /// "anchor" that lets a watermark-anchored reconcile pass correctly
    /// classify the first event in its window (e.g. recognize a duplicate
    /// `power_on` whose match is just outside the loaded window) (§4.D).
    async fn load_anchor_event(
        &self,
        instance_id: InstanceId,
        before: DateTime<Utc>,
    ) -> Result<Option<InstanceEvent>, UsageError>;

    /// All runs currently stored for `instance_id`, in no particular order.
    async fn load_runs_for_instance(&self, instance_id: InstanceId) -> Result<Vec<Run>, UsageError>;

    // -- runs --------------------------------------------------------

    /// Replaces every run for `instance_id` with `end_time.is_none()` or
    /// `start_time >= watermark` with `runs`, leaving closed runs before
    /// the watermark untouched. This is the reconciler's only write and is
    /// expected to run inside one transaction per instance (§4.D, §5).
    async fn replace_runs_from_watermark(
        &self,
        instance_id: InstanceId,
        watermark: DateTime<Utc>,
        runs: Vec<Run>,
    ) -> Result<(), UsageError>;

    /// Every run that overlaps `day` (in UTC, before the caller narrows to
    /// the user's effective timezone) for any instance owned by any of
    /// `user`'s accounts, paired with the `MachineImage` each run is bound
    /// to so the roll-up can classify rhel/openshift without a second
    /// round trip per run (§4.F).
    async fn load_runs_for_day(
        &self,
        user: &str,
        day: NaiveDate,
    ) -> Result<Vec<(Run, Option<MachineImage>)>, UsageError>;

    // -- machine images --------------------------------------------------

    async fn upsert_image_stub(
        &self,
        cloud_type: crate::model::CloudType,
        cloud_image_id: &str,
    ) -> Result<MachineImage, UsageError>;

    async fn find_image_by_cloud_id(
        &self,
        cloud_type: crate::model::CloudType,
        cloud_image_id: &str,
    ) -> Result<Option<MachineImage>, UsageError>;

    async fn get_image(&self, id: ImageId) -> Result<MachineImage, UsageError>;

    async fn save_image(&self, image: MachineImage) -> Result<MachineImage, UsageError>;

    /// Images still awaiting inspection, oldest-discovered first, used by
    /// the inspector's polling loop (§4.E).
    async fn load_pending_images(&self, limit: u32) -> Result<Vec<MachineImage>, UsageError>;

    // -- instance type cache --------------------------------------------

    async fn load_instance_type_definitions(
        &self,
    ) -> Result<Vec<InstanceTypeDefinition>, UsageError>;

    // -- usage roll-up --------------------------------------------------

    async fn save_concurrent_usage(&self, usage: ConcurrentUsage) -> Result<(), UsageError>;

    async fn load_distinct_users_active_on(
        &self,
        day: NaiveDate,
    ) -> Result<Vec<String>, UsageError>;
}
