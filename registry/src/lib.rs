//! The image and instance registries (components B and C): dedup
//! machine-image identifiers across ingest paths, track per-image
//! inspection lifecycle, and bind each instance to exactly one current
//! image. Grounded on `account/util.py`'s `save_new_aws_machine_image` /
//! `create_new_machine_images` for the upsert-and-classify shape, and on
//! the teacher's `controller/src/util/pod_action.rs`
//! `PodActionInfo::select_pod_action` for the table-driven transition
//! decision idiom used by [`image::valid_transition`].

pub mod image;
pub mod instance;

pub use image::{upsert_image, upsert_unavailable_image, DiscoveredImageAttrs};
pub use instance::upsert_instance;
