//! The inspection orchestrator (component E): a bounded state machine
//! driving each newly discovered machine image from `pending` through
//! `preparing`/`inspecting` to a terminal `inspected`/`error` (§4.E).
//!
//! Grounded on `api/clouds/aws/tasks/inspection.py` and
//! `account/util.py::start_image_inspection` (original_source) for the
//! short-circuit conditions (marketplace/cloud-access/tag-detected skip
//! straight to `inspected`; an encrypted customer snapshot moves straight
//! to `error`) and on the teacher's
//! `controller/src/util/pod_action.rs::PodActionInfo::select_pod_action`
//! for the table-driven decision-function idiom reused here as
//! [`ImageActionInfo::select_transition`].

mod state_machine;

pub use state_machine::{select_transition, ImageAction, ImageActionInfo};

use chrono::Utc;
use usage_queue::WorkQueue;
use usage_shared::config::Settings;
use usage_shared::error::UsageError;
use usage_shared::model::{ImageId, ImageStatus, MachineImage};
use usage_shared::store::Store;

/// One step of the side-effecting pipeline that actually reads an image's
/// root volume (copy snapshot -> copy volume -> attach -> release -> ingest
/// verdict). None of this is normative per §4.E — only the state machine,
/// retry bound, and terminal idempotence are — so the orchestrator enqueues
/// it onto the work queue rather than performing it itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectionWork {
    pub image_id: ImageId,
}

/// Drives one image's discovery-time decision: either it short-circuits
/// straight to a terminal state (§4.E), or it moves to `preparing` and an
/// [`InspectionWork`] message is enqueued to start the snapshot-copy
/// pipeline.
pub async fn on_image_discovered(
    store: &dyn Store,
    queue: &dyn WorkQueue<InspectionWork>,
    image_id: ImageId,
) -> Result<MachineImage, UsageError> {
    let image = store.get_image(image_id).await?;
    let info = ImageActionInfo::for_image(&image);
    match info.select_transition() {
        ImageAction::ShortCircuitInspected => {
            log::info!(
                "image {image_id}: short-circuits to inspected at discovery \
                 (marketplace={}, cloud_access={}, tag_rhel={})",
                image.is_marketplace,
                image.is_cloud_access,
                image.rhel_detected_by_tag
            );
            set_status(store, image_id, ImageStatus::Inspected).await
        }
        ImageAction::ShortCircuitError => {
            log::warn!("image {image_id}: encrypted at discovery, short-circuits to error");
            set_status(store, image_id, ImageStatus::Error).await
        }
        ImageAction::Advance(target) => {
            let updated = set_status(store, image_id, target).await?;
            queue
                .enqueue(image_id.to_string(), InspectionWork { image_id })
                .await
                .map_err(|e| UsageError::Other(anyhow::anyhow!(e)))?;
            Ok(updated)
        }
        ImageAction::NoAction => Ok(image),
    }
}

/// Moves an image one step forward in the state machine (preparing ->
/// inspecting, or either of those -> error on failure), enforcing the
/// retry bound (§4.E) before allowing another attempt.
pub async fn advance(
    store: &dyn Store,
    image_id: ImageId,
    outcome: StepOutcome,
    settings: &Settings,
) -> Result<MachineImage, UsageError> {
    let image = store.get_image(image_id).await?;
    match outcome {
        StepOutcome::Success(target) => set_status(store, image_id, target).await,
        StepOutcome::Encrypted => {
            log::warn!("image {image_id}: target snapshot is encrypted, moving to error");
            set_status(store, image_id, ImageStatus::Error).await
        }
        StepOutcome::SnapshotNotFound => {
            log::warn!("image {image_id}: customer snapshot could not be located, moving to error");
            set_status(store, image_id, ImageStatus::Error).await
        }
        StepOutcome::CopyDenied => {
            log::warn!("image {image_id}: snapshot copy denied, moving to error");
            set_status(store, image_id, ImageStatus::Error).await
        }
        StepOutcome::Failed => {
            let mut updated = image;
            updated.inspection_attempts += 1;
            if updated.inspection_attempts >= settings.inspection.max_attempts {
                log::warn!(
                    "image {image_id}: exhausted {} inspection attempts, moving to error",
                    settings.inspection.max_attempts
                );
                updated.status = ImageStatus::Error;
            }
            store.save_image(updated).await
        }
    }
}

/// Result of one side-effecting inspection step, fed back into [`advance`].
///
/// `Encrypted`, `SnapshotNotFound`, and `CopyDenied` are the three §4.E
/// conditions that short-circuit straight to `error` on first occurrence
/// without consuming a retry attempt; only `Failed` (a transient step
/// failure worth retrying) counts against `inspection_attempts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Success(ImageStatus),
    Encrypted,
    /// The customer's root-volume snapshot could not be located.
    SnapshotNotFound,
    /// The snapshot copy was denied for a reason other than marketplace or
    /// public-image sharing rules (§4.E).
    CopyDenied,
    Failed,
}

/// Status transition with the monotonicity guard §7/§8.7 requires: a
/// terminal status is never rewritten by an older in-flight step.
async fn set_status(
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
    let mut updated = image;
    updated.status = target;
    store.save_image(updated).await
}

/// The retry sweep (§4.E, §10.6): periodically re-drives `pending` images
/// that are older than `inspection.min_age_seconds`, skipping ones likely
/// still being claimed by the step that just created them.
pub async fn retry_sweep(
    store: &dyn Store,
    queue: &dyn WorkQueue<InspectionWork>,
    settings: &Settings,
    limit: u32,
    now: chrono::DateTime<Utc>,
    discovered_at: impl Fn(&MachineImage) -> chrono::DateTime<Utc>,
) -> Result<u32, UsageError> {
    let pending = store.load_pending_images(limit).await?;
    let min_age = chrono::Duration::seconds(settings.inspection.min_age_seconds as i64);
    let mut retried = 0;
    for image in pending {
        if now - discovered_at(&image) < min_age {
            continue;
        }
        on_image_discovered(store, queue, image.id).await?;
        retried += 1;
    }
    Ok(retried)
}

/// Applies an inspection verdict from the verdict queue (§6): stores the
/// raw JSON verbatim and moves the image to `inspected`.
pub async fn apply_verdict(
    store: &dyn Store,
    image_id: ImageId,
    inspection_json: usage_shared::model::InspectionJson,
) -> Result<MachineImage, UsageError> {
    let mut image = store.get_image(image_id).await?;
    if image.status.is_terminal() {
        log::trace!("image {image_id}: verdict arrived after already terminal, ignoring");
        return Ok(image);
    }
    image.inspection_json = Some(inspection_json);
    image.status = ImageStatus::Inspected;
    store.save_image(image).await
}
