//! Instance Registry operations (§4.C).

use usage_shared::error::UsageError;
use usage_shared::model::{AccountId, CloudType, ImageId, Instance};
use usage_shared::store::Store;

/// `upsert(account, cloud_instance_id, region, image_ref?)` (§4.C). If the
/// instance already exists and carries a null `current_image`, a non-null
/// `image_ref` fills it once (bind-once, enforced by the store's
/// conditional update); later events never overwrite a binding.
pub async fn upsert_instance(
    store: &dyn Store,
    account_id: AccountId,
    cloud_type: CloudType,
    cloud_instance_id: &str,
    region: &str,
    image_ref: Option<ImageId>,
) -> Result<Instance, UsageError> {
    match store
        .find_instance_by_cloud_id(account_id, cloud_instance_id)
        .await?
    {
        Some(existing) => match image_ref {
            Some(image_ref) => {
                store
                    .bind_instance_image_if_unset(existing.id, image_ref)
                    .await
            }
            None => Ok(existing),
        },
        None => {
            let mut instance = Instance::new(
                account_id,
                cloud_type,
                cloud_instance_id.to_string(),
                region.to_string(),
            );
            instance.current_image = image_ref;
            store.upsert_instance(instance).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usage_shared::store::MockStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn creates_a_new_instance_when_none_exists() {
        let account_id = Uuid::new_v4();
        let image_id = Uuid::new_v4();
        let mut store = MockStore::new();
        store
            .expect_find_instance_by_cloud_id()
            .returning(|_, _| Ok(None));
        store.expect_upsert_instance().returning(Ok);

        let instance = upsert_instance(
            &store,
            account_id,
            CloudType::Aws,
            "i-1",
            "us-east-1",
            Some(image_id),
        )
        .await
        .unwrap();
        assert_eq!(instance.current_image, Some(image_id));
    }

    #[tokio::test]
    async fn does_not_rebind_an_already_bound_instance() {
        let account_id = Uuid::new_v4();
        let first_image = Uuid::new_v4();
        let second_image = Uuid::new_v4();
        let existing = Instance {
            id: Uuid::new_v4(),
            account_id,
            cloud_type: CloudType::Aws,
            cloud_instance_id: "i-1".to_string(),
            region: "us-east-1".to_string(),
            current_image: Some(first_image),
        };
        let mut store = MockStore::new();
        store
            .expect_find_instance_by_cloud_id()
            .returning(move |_, _| Ok(Some(existing.clone())));
        store
            .expect_bind_instance_image_if_unset()
            .returning(move |id, _image_ref| {
                Ok(Instance {
                    id,
                    account_id,
                    cloud_type: CloudType::Aws,
                    cloud_instance_id: "i-1".to_string(),
                    region: "us-east-1".to_string(),
                    current_image: Some(first_image),
                })
            });

        let instance = upsert_instance(
            &store,
            account_id,
            CloudType::Aws,
            "i-1",
            "us-east-1",
            Some(second_image),
        )
        .await
        .unwrap();
        assert_eq!(instance.current_image, Some(first_image));
    }
}
