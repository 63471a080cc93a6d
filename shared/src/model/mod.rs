//! Entities from the data model: `Account`, `MachineImage`, `Instance`,
//! `InstanceEvent`, `Run`, `InstanceTypeDefinition`, `ConcurrentUsage`.

mod account;
mod event;
mod image;
mod instance;
mod instance_type;
mod run;
mod usage;

pub use account::{Account, AccountId};
pub use event::{EventType, InstanceEvent};
pub use image::{classify, ImageId, ImagePlatform, ImageStatus, InspectionJson, MachineImage};
pub use instance::{Instance, InstanceId};
pub use instance_type::InstanceTypeDefinition;
pub use run::Run;
pub use usage::ConcurrentUsage;

/// Which cloud a record belongs to.
///
/// The source models this with per-cloud ORM subclasses
/// (`AwsInstance`/`AwsMachineImage`/...); here it is a tagged variant
/// discriminator carried alongside cloud-neutral fields, with no runtime
/// re-dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudType {
    Aws,
    Azure,
}

impl std::fmt::Display for CloudType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudType::Aws => write!(f, "aws"),
            CloudType::Azure => write!(f, "azure"),
        }
    }
}
