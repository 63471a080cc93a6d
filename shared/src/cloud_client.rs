//! The cloud-describe seam: the one place the normalizer and inspection
//! orchestrator reach out to the live cloud API. Grounded on
//! `shared/src/k8s/mod.rs`'s `KubeInterface` trait — a single mockable
//! trait standing in for "the external system", generic over which cloud
//! by having one implementation per `CloudType` rather than by trait
//! generics (mirrors the teacher's one-`KubeInterface`-per-cluster shape).

use crate::error::UsageError;
use crate::model::CloudType;
use async_trait::async_trait;
use std::collections::HashMap;

/// A single EC2/VM instance as described by the cloud API, independent of
/// any event — used for initial-discovery snapshots (§4.A.1) and for
/// backfilling a normalizer event missing `image_ref`/`instance_type`.
#[derive(Clone, Debug, PartialEq)]
pub struct DescribedInstance {
    pub cloud_instance_id: String,
    pub region: String,
    pub image_id: String,
    pub instance_type: String,
    pub subnet: Option<String>,
    pub is_running: bool,
}

/// A single machine image as described by the cloud API.
#[derive(Clone, Debug, PartialEq)]
pub struct DescribedImage {
    pub cloud_image_id: String,
    pub name: Option<String>,
    pub owner_cloud_account_id: Option<String>,
    pub is_windows: bool,
    pub openshift_tag_present: bool,
}

/// Everything the core pipeline needs from a live cloud account, kept
/// deliberately narrow: list/describe calls only. Side-effecting
/// operations that exist purely to drive inspection (snapshot copy, volume
/// attach/detach) are out of the core's scope per the spec and are not
/// modeled here; the orchestrator issues them as work-queue messages to an
/// external collaborator instead (§4.E).
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait CloudClient: Send + Sync {
    fn cloud_type(&self) -> CloudType;

    /// One describe-all call per region, used for initial discovery and
    /// the Azure periodic poll (§4.A.1, §6).
    async fn describe_all_instances(
        &self,
    ) -> Result<HashMap<String, Vec<DescribedInstance>>, UsageError>;

    /// Scoped describe used by the normalizer's missing-field backfill
    /// (§4.A): a single instance in a known region.
    async fn describe_instance(
        &self,
        region: &str,
        cloud_instance_id: &str,
    ) -> Result<Option<DescribedInstance>, UsageError>;

    async fn describe_images(
        &self,
        region: &str,
        cloud_image_ids: &[String],
    ) -> Result<Vec<DescribedImage>, UsageError>;
}
