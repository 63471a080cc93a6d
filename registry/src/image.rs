//! Image Registry operations (§4.B).

use chrono::{DateTime, Utc};
use usage_shared::config::Settings;
use usage_shared::error::UsageError;
use usage_shared::model::{classify, CloudType, ImageId, ImagePlatform, ImageStatus, MachineImage};
use usage_shared::store::Store;
use uuid::Uuid;

/// Attributes discovered about an image the first time it is referenced,
/// independent of any later events.
#[derive(Clone, Debug, Default)]
pub struct DiscoveredImageAttrs {
    pub name: Option<String>,
    pub owner_cloud_account_id: Option<String>,
    pub is_windows: bool,
    pub is_encrypted: bool,
    pub rhel_detected_by_tag: bool,
}

/// `upsert(cloud_type, cloud_image_id, discovered_attrs) -> (image, was_new)`
/// (§4.B). Never mutates an existing image's discovery-time attributes;
/// only a brand-new row is classified and possibly short-circuited straight
/// to `inspected` (Windows / marketplace / cloud-access / tag-detected
/// RHEL, §4.E, §10.6).
pub async fn upsert_image(
    store: &dyn Store,
    cloud_type: CloudType,
    cloud_image_id: &str,
    attrs: DiscoveredImageAttrs,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<(MachineImage, bool), UsageError> {
    if let Some(existing) = store.find_image_by_cloud_id(cloud_type, cloud_image_id).await? {
        return Ok((existing, false));
    }

    let (is_marketplace, is_cloud_access) = classify(
        attrs.name.as_deref(),
        attrs.owner_cloud_account_id.as_deref(),
        &settings.marketplace_tokens,
        &settings.cloud_access_tokens,
        &settings.rhel_image_owner_accounts,
    );

    let mut image = MachineImage {
        id: Uuid::new_v4(),
        cloud_type,
        cloud_image_id: cloud_image_id.to_string(),
        name: attrs.name,
        owner_cloud_account_id: attrs.owner_cloud_account_id,
        platform: if attrs.is_windows {
            ImagePlatform::Windows
        } else {
            ImagePlatform::None
        },
        status: ImageStatus::Pending,
        inspection_json: None,
        rhel_detected_by_tag: attrs.rhel_detected_by_tag,
        openshift_detected: false,
        rhel_challenged: false,
        openshift_challenged: false,
        is_encrypted: attrs.is_encrypted,
        is_marketplace,
        is_cloud_access,
        inspection_attempts: 0,
        openshift_tag_applied_at: None,
        discovered_at: now,
    };

    if image.skips_inspection() {
        log::info!(
            "image {} short-circuits to inspected at discovery (windows={}, marketplace={}, cloud_access={}, tag_rhel={})",
            image.cloud_image_id,
            attrs.is_windows,
            image.is_marketplace,
            image.is_cloud_access,
            image.rhel_detected_by_tag
        );
        image.status = ImageStatus::Inspected;
    }

    let saved = store.save_image(image).await?;
    Ok((saved, true))
}

/// Creates a stub row in `unavailable` status for an image that was
/// referenced but could not be described — revoked permission or
/// deregistered image (§4.B). Downstream joins (runs -> image) stay intact.
pub async fn upsert_unavailable_image(
    store: &dyn Store,
    cloud_type: CloudType,
    cloud_image_id: &str,
    now: DateTime<Utc>,
) -> Result<MachineImage, UsageError> {
    if let Some(existing) = store.find_image_by_cloud_id(cloud_type, cloud_image_id).await? {
        return Ok(existing);
    }
    let image = MachineImage {
        id: Uuid::new_v4(),
        cloud_type,
        cloud_image_id: cloud_image_id.to_string(),
        name: None,
        owner_cloud_account_id: None,
        platform: ImagePlatform::None,
        status: ImageStatus::Unavailable,
        inspection_json: None,
        rhel_detected_by_tag: false,
        openshift_detected: false,
        rhel_challenged: false,
        openshift_challenged: false,
        is_encrypted: false,
        is_marketplace: false,
        is_cloud_access: false,
        inspection_attempts: 0,
        openshift_tag_applied_at: None,
        discovered_at: now,
    };
    store.save_image(image).await
}

/// The state-machine transition table of §4.E, expressed the way the
/// teacher's `PodActionInfo::select_pod_action` expresses its decision
/// table: one pure function from (current, target) to whether the move is
/// legal. `Unavailable` is assigned only at creation and has no outgoing
/// transitions here.
pub fn valid_transition(from: ImageStatus, to: ImageStatus) -> bool {
    use ImageStatus::*;
    matches!(
        (from, to),
        (Pending, Preparing)
            | (Pending, Inspected)
            | (Preparing, Inspecting)
            | (Inspecting, Inspected)
            | (Pending, Error)
            | (Preparing, Error)
            | (Inspecting, Error)
    )
}

/// `set_status(image_id, target)` (§4.B) under the transition rules of
/// §4.E. A terminal status (`inspected`/`error`) is never rewritten —
/// status monotonicity (§7, §8.7) — so a request to move a terminal image
/// is silently a no-op rather than an error: the transition already
/// happened and this caller lost the race.
pub async fn set_status(
    store: &dyn Store,
    image_id: ImageId,
    target: ImageStatus,
) -> Result<MachineImage, UsageError> {
    let image = store.get_image(image_id).await?;
    if image.status.is_terminal() {
        log::trace!(
            "image {image_id}: ignoring transition to {target:?}, already terminal at {:?}",
            image.status
        );
        return Ok(image);
    }
    if !valid_transition(image.status, target) {
        log::warn!(
            "image {image_id}: rejected illegal transition {:?} -> {target:?}",
            image.status
        );
        return Ok(image);
    }
    let mut updated = image;
    updated.status = target;
    store.save_image(updated).await
}

/// `apply_tag_delta(image_id, tag_key, present)` (§4.B): only the
/// chronologically latest tag event counts, so an out-of-order
/// `DeleteTags` can never undo a later `CreateTags` (§10.6). Pure
/// function over the image's current `openshift_tag_applied_at`
/// watermark; the caller persists the result.
pub fn apply_openshift_tag_delta(
    image: &mut MachineImage,
    tag_present: bool,
    occurred_at: DateTime<Utc>,
) {
    if let Some(last) = image.openshift_tag_applied_at {
        if occurred_at <= last {
            log::trace!(
                "image {}: dropping stale tag event at {occurred_at} (last applied {last})",
                image.cloud_image_id
            );
            return;
        }
    }
    image.openshift_detected = tag_present;
    image.openshift_tag_applied_at = Some(occurred_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use usage_shared::store::MockStore;

    fn attrs() -> DiscoveredImageAttrs {
        DiscoveredImageAttrs::default()
    }

    fn now() -> DateTime<Utc> {
        DateTime::UNIX_EPOCH
    }

    #[tokio::test]
    async fn upsert_creates_a_new_image_when_none_exists() {
        let mut store = MockStore::new();
        store
            .expect_find_image_by_cloud_id()
            .returning(|_, _| Ok(None));
        store.expect_save_image().returning(Ok);

        let (image, was_new) = upsert_image(
            &store,
            CloudType::Aws,
            "ami-1",
            attrs(),
            &Settings::default(),
            now(),
        )
        .await
        .unwrap();
        assert!(was_new);
        assert_eq!(image.status, ImageStatus::Pending);
    }

    #[tokio::test]
    async fn upsert_never_mutates_an_existing_image() {
        let existing = MachineImage {
            id: Uuid::new_v4(),
            cloud_type: CloudType::Aws,
            cloud_image_id: "ami-1".to_string(),
            name: Some("old-name".to_string()),
            owner_cloud_account_id: None,
            platform: ImagePlatform::None,
            status: ImageStatus::Inspected,
            inspection_json: None,
            rhel_detected_by_tag: false,
            openshift_detected: false,
            rhel_challenged: false,
            openshift_challenged: false,
            is_encrypted: false,
            is_marketplace: false,
            is_cloud_access: false,
            inspection_attempts: 0,
            openshift_tag_applied_at: None,
            discovered_at: now(),
        };
        let expected = existing.clone();
        let mut store = MockStore::new();
        store
            .expect_find_image_by_cloud_id()
            .returning(move |_, _| Ok(Some(expected.clone())));

        let (image, was_new) = upsert_image(
            &store,
            CloudType::Aws,
            "ami-1",
            DiscoveredImageAttrs {
                name: Some("new-name".to_string()),
                ..attrs()
            },
            &Settings::default(),
            now(),
        )
        .await
        .unwrap();
        assert!(!was_new);
        assert_eq!(image.name.as_deref(), Some("old-name"));
    }

    #[tokio::test]
    async fn windows_image_short_circuits_to_inspected() {
        let mut store = MockStore::new();
        store
            .expect_find_image_by_cloud_id()
            .returning(|_, _| Ok(None));
        store.expect_save_image().returning(Ok);

        let (image, _) = upsert_image(
            &store,
            CloudType::Aws,
            "ami-win",
            DiscoveredImageAttrs {
                is_windows: true,
                ..attrs()
            },
            &Settings::default(),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(image.platform, ImagePlatform::Windows);
        assert_eq!(image.status, ImageStatus::Inspected);
    }

    #[test]
    fn transition_table_matches_the_state_diagram() {
        use ImageStatus::*;
        assert!(valid_transition(Pending, Preparing));
        assert!(valid_transition(Preparing, Inspecting));
        assert!(valid_transition(Inspecting, Inspected));
        assert!(valid_transition(Pending, Inspected));
        assert!(valid_transition(Preparing, Error));
        assert!(!valid_transition(Inspected, Preparing));
        assert!(!valid_transition(Pending, Inspecting));
    }

    #[tokio::test]
    async fn set_status_is_a_no_op_once_terminal() {
        let image = MachineImage {
            id: Uuid::new_v4(),
            cloud_type: CloudType::Aws,
            cloud_image_id: "ami-2".to_string(),
            name: None,
            owner_cloud_account_id: None,
            platform: ImagePlatform::None,
            status: ImageStatus::Error,
            inspection_json: None,
            rhel_detected_by_tag: false,
            openshift_detected: false,
            rhel_challenged: false,
            openshift_challenged: false,
            is_encrypted: false,
            is_marketplace: false,
            is_cloud_access: false,
            inspection_attempts: 3,
            openshift_tag_applied_at: None,
            discovered_at: now(),
        };
        let image_id = image.id;
        let mut store = MockStore::new();
        store.expect_get_image().returning(move |_| Ok(image.clone()));
        store.expect_save_image().times(0);

        let result = set_status(&store, image_id, ImageStatus::Inspecting)
            .await
            .unwrap();
        assert_eq!(result.status, ImageStatus::Error);
    }

    #[test]
    fn tag_delta_ignores_events_older_than_the_last_applied_one() {
        let mut image = MachineImage {
            id: Uuid::new_v4(),
            cloud_type: CloudType::Aws,
            cloud_image_id: "ami-3".to_string(),
            name: None,
            owner_cloud_account_id: None,
            platform: ImagePlatform::None,
            status: ImageStatus::Pending,
            inspection_json: None,
            rhel_detected_by_tag: false,
            openshift_detected: true,
            rhel_challenged: false,
            openshift_challenged: false,
            is_encrypted: false,
            is_marketplace: false,
            is_cloud_access: false,
            inspection_attempts: 0,
            openshift_tag_applied_at: Some(chrono::DateTime::UNIX_EPOCH + chrono::Duration::hours(5)),
            discovered_at: now(),
        };
        apply_openshift_tag_delta(
            &mut image,
            false,
            chrono::DateTime::UNIX_EPOCH + chrono::Duration::hours(2),
        );
        assert!(image.openshift_detected, "stale DeleteTags must not win");
    }
}
