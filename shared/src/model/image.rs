use super::CloudType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ImageId = Uuid;

/// Platform hint attached to an image at discovery time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagePlatform {
    None,
    Windows,
}

/// Inspection lifecycle status. The transition DAG is enforced by the
/// `inspector` crate's state machine (component E); this type only carries
/// the value, it does not validate transitions itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Preparing,
    Inspecting,
    Inspected,
    Error,
    /// The image was referenced but could not be described (revoked
    /// permission, deregistered). A stub row in this state keeps
    /// downstream joins (runs -> image) from breaking.
    Unavailable,
}

impl ImageStatus {
    /// `true` once a status can never again change (§7, §8.7: status
    /// monotonicity).
    pub fn is_terminal(self) -> bool {
        matches!(self, ImageStatus::Inspected | ImageStatus::Error)
    }
}

/// Raw per-source RHEL inspection signals, stored verbatim as received
/// from the inspection verdict queue (§6).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionJson {
    #[serde(default)]
    pub rhel_enabled_repos_found: bool,
    #[serde(default)]
    pub rhel_product_certs_found: bool,
    #[serde(default)]
    pub rhel_release_files_found: bool,
    #[serde(default)]
    pub rhel_signed_packages_found: bool,
}

/// A machine image, independent of any one instance or account.
///
/// Uniqueness is on `(cloud_type, cloud_image_id)`. The `rhel`/`openshift`
/// booleans in §3 are derived, not stored; they're exposed as methods here
/// so every reader computes them the same way.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineImage {
    pub id: ImageId,
    pub cloud_type: CloudType,
    pub cloud_image_id: String,
    pub name: Option<String>,
    pub owner_cloud_account_id: Option<String>,
    pub platform: ImagePlatform,
    pub status: ImageStatus,
    pub inspection_json: Option<InspectionJson>,
    pub rhel_detected_by_tag: bool,
    pub openshift_detected: bool,
    pub rhel_challenged: bool,
    pub openshift_challenged: bool,
    pub is_encrypted: bool,
    pub is_marketplace: bool,
    pub is_cloud_access: bool,
    /// Number of inspection attempts made so far; bounds retry (§4.E).
    pub inspection_attempts: u32,
    /// `occurred_at` of the last tag event applied to `openshift_detected`,
    /// so an out-of-order `DeleteTags` can't undo a later `CreateTags`
    /// (§4.B tag-delta recency rule, §10.6).
    pub openshift_tag_applied_at: Option<chrono::DateTime<chrono::Utc>>,
    /// When this image was first referenced (the row's creation time). The
    /// retry sweep's `inspection.min_age_seconds` grace period (§4.E,
    /// §10.6) is measured from this, not from the sweep's own clock.
    pub discovered_at: chrono::DateTime<chrono::Utc>,
}

impl MachineImage {
    /// `rhel = (any detection signal) XOR rhel_challenged` (§3).
    pub fn rhel(&self) -> bool {
        let detected = self.rhel_detected_by_tag
            || self.is_cloud_access
            || self
                .inspection_json
                .as_ref()
                .is_some_and(|j| {
                    j.rhel_enabled_repos_found
                        || j.rhel_product_certs_found
                        || j.rhel_release_files_found
                        || j.rhel_signed_packages_found
                });
        detected ^ self.rhel_challenged
    }

    /// `openshift = openshift_detected XOR openshift_challenged` (§3).
    pub fn openshift(&self) -> bool {
        self.openshift_detected ^ self.openshift_challenged
    }

    /// Images we should never attempt to inspect (no content to read, or
    /// content that's already fully known): Windows, marketplace,
    /// cloud-access, or tag-detected RHEL all short-circuit to `inspected`
    /// at discovery (§4.E).
    pub fn skips_inspection(&self) -> bool {
        matches!(self.platform, ImagePlatform::Windows)
            || self.is_marketplace
            || self.is_cloud_access
            || self.rhel_detected_by_tag
    }
}

/// Pure classification of marketplace / cloud-access status from an image's
/// name and owner account id (§4.B `classify`, §8.8 classification laws).
///
/// Case-insensitive substring match on `name`; both require the owner to be
/// in the configured owner-account set. A name with no owner never
/// classifies as either, since §3 requires owner membership as well as the
/// substring match.
pub fn classify(
    name: Option<&str>,
    owner_cloud_account_id: Option<&str>,
    marketplace_tokens: &[String],
    cloud_access_tokens: &[String],
    rhel_image_owner_accounts: &std::collections::HashSet<String>,
) -> (bool, bool) {
    let Some(owner) = owner_cloud_account_id else {
        return (false, false);
    };
    if !rhel_image_owner_accounts.contains(owner) {
        return (false, false);
    }
    let Some(name) = name else {
        return (false, false);
    };
    let lower = name.to_lowercase();
    let is_marketplace = marketplace_tokens
        .iter()
        .any(|token| lower.contains(&token.to_lowercase()));
    let is_cloud_access = cloud_access_tokens
        .iter()
        .any(|token| lower.contains(&token.to_lowercase()));
    (is_marketplace, is_cloud_access)
}
