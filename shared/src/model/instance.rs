use super::{AccountId, CloudType, ImageId};
use uuid::Uuid;

pub type InstanceId = Uuid;

/// A per-account instance record, owned by its `Account` (cascade-deleted
/// with it). Uniqueness is on `(cloud_type, cloud_instance_id)`.
///
/// `current_image` binds once: the first non-null `image_ref` presented
/// for an instance fills it, and it is never overwritten by a later event
/// (§4.C). Only an explicit re-discovery path may rebind it.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub account_id: AccountId,
    pub cloud_type: CloudType,
    pub cloud_instance_id: String,
    pub region: String,
    pub current_image: Option<ImageId>,
}

impl Instance {
    pub fn new(
        account_id: AccountId,
        cloud_type: CloudType,
        cloud_instance_id: String,
        region: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            cloud_type,
            cloud_instance_id,
            region,
            current_image: None,
        }
    }

    /// Applies the bind-once rule: fills `current_image` only if it was
    /// previously unset.
    pub fn bind_image_if_unset(&mut self, image_ref: ImageId) {
        if self.current_image.is_none() {
            self.current_image = Some(image_ref);
        }
    }
}
