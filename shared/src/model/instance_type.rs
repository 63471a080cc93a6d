use super::CloudType;

/// Process-wide cached definition of a cloud instance type's resources.
/// Refreshed by a periodic job; readers take a shared lock, the refresher
/// takes an exclusive lock only while swapping the fully built map (§5).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceTypeDefinition {
    pub cloud_type: CloudType,
    pub instance_type: String,
    pub vcpu: i32,
    pub memory_mib: f64,
}
