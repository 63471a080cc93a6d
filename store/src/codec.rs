//! `TEXT`-column codecs for the model's small enums. None of them derive
//! `sqlx::Type` — keeping the mapping explicit here means a renamed variant
//! is a compile error at the call site instead of a silent schema mismatch.

use usage_shared::error::UsageError;
use usage_shared::model::{CloudType, EventType, ImagePlatform, ImageStatus};

pub fn cloud_type_to_text(v: CloudType) -> &'static str {
    match v {
        CloudType::Aws => "aws",
        CloudType::Azure => "azure",
    }
}

pub fn cloud_type_from_text(s: &str) -> Result<CloudType, UsageError> {
    match s {
        "aws" => Ok(CloudType::Aws),
        "azure" => Ok(CloudType::Azure),
        other => Err(UsageError::CorruptPayload(format!("unknown cloud_type {other:?}"))),
    }
}

pub fn event_type_to_text(v: EventType) -> &'static str {
    match v {
        EventType::PowerOn => "power_on",
        EventType::PowerOff => "power_off",
        EventType::AttributeChange => "attribute_change",
    }
}

pub fn event_type_from_text(s: &str) -> Result<EventType, UsageError> {
    match s {
        "power_on" => Ok(EventType::PowerOn),
        "power_off" => Ok(EventType::PowerOff),
        "attribute_change" => Ok(EventType::AttributeChange),
        other => Err(UsageError::CorruptPayload(format!("unknown event_type {other:?}"))),
    }
}

pub fn image_platform_to_text(v: ImagePlatform) -> &'static str {
    match v {
        ImagePlatform::None => "none",
        ImagePlatform::Windows => "windows",
    }
}

pub fn image_platform_from_text(s: &str) -> Result<ImagePlatform, UsageError> {
    match s {
        "none" => Ok(ImagePlatform::None),
        "windows" => Ok(ImagePlatform::Windows),
        other => Err(UsageError::CorruptPayload(format!("unknown platform {other:?}"))),
    }
}

pub fn image_status_to_text(v: ImageStatus) -> &'static str {
    match v {
        ImageStatus::Pending => "pending",
        ImageStatus::Preparing => "preparing",
        ImageStatus::Inspecting => "inspecting",
        ImageStatus::Inspected => "inspected",
        ImageStatus::Error => "error",
        ImageStatus::Unavailable => "unavailable",
    }
}

pub fn image_status_from_text(s: &str) -> Result<ImageStatus, UsageError> {
    match s {
        "pending" => Ok(ImageStatus::Pending),
        "preparing" => Ok(ImageStatus::Preparing),
        "inspecting" => Ok(ImageStatus::Inspecting),
        "inspected" => Ok(ImageStatus::Inspected),
        "error" => Ok(ImageStatus::Error),
        "unavailable" => Ok(ImageStatus::Unavailable),
        other => Err(UsageError::CorruptPayload(format!("unknown image status {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_type_round_trips() {
        for v in [CloudType::Aws, CloudType::Azure] {
            assert_eq!(cloud_type_from_text(cloud_type_to_text(v)).unwrap(), v);
        }
    }

    #[test]
    fn event_type_round_trips() {
        for v in [EventType::PowerOn, EventType::PowerOff, EventType::AttributeChange] {
            assert_eq!(event_type_from_text(event_type_to_text(v)).unwrap(), v);
        }
    }

    #[test]
    fn image_platform_round_trips() {
        for v in [ImagePlatform::None, ImagePlatform::Windows] {
            assert_eq!(image_platform_from_text(image_platform_to_text(v)).unwrap(), v);
        }
    }

    #[test]
    fn image_status_round_trips() {
        for v in [
            ImageStatus::Pending,
            ImageStatus::Preparing,
            ImageStatus::Inspecting,
            ImageStatus::Inspected,
            ImageStatus::Error,
            ImageStatus::Unavailable,
        ] {
            assert_eq!(image_status_from_text(image_status_to_text(v)).unwrap(), v);
        }
    }

    #[test]
    fn unknown_text_is_a_typed_error_not_a_panic() {
        assert!(cloud_type_from_text("gcp").is_err());
    }
}
