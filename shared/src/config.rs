//! Typed configuration, layered from environment variables (prefix
//! `USAGE_ENGINE_`) and an optional config file, covering every option in
//! §6's configuration surface. The teacher reads individual env vars
//! directly where needed (`METRICS_PORT`); this repo has a dozen-odd
//! related options so they're collected into one `Settings` value built
//! once at startup and threaded through instead.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionSettings {
    pub max_attempts: u32,
    pub min_age_seconds: u64,
}

impl Default for InspectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_age_seconds: 3600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueBatchSizes {
    pub receive: u8,
    pub send: u8,
}

impl Default for QueueBatchSizes {
    fn default() -> Self {
        Self {
            receive: 10,
            send: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub inspection: InspectionSettings,
    pub queue_batch_size: QueueBatchSizes,
    pub marketplace_tokens: Vec<String>,
    pub cloud_access_tokens: Vec<String>,
    pub rhel_image_owner_accounts: HashSet<String>,
    pub default_timezone: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inspection: InspectionSettings::default(),
            queue_batch_size: QueueBatchSizes::default(),
            marketplace_tokens: vec!["marketplace".to_string()],
            cloud_access_tokens: vec!["cloud access".to_string(), "cloud-access".to_string()],
            rhel_image_owner_accounts: HashSet::new(),
            default_timezone: "UTC".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from environment variables prefixed `USAGE_ENGINE`
    /// (double-underscore separated, e.g. `USAGE_ENGINE__INSPECTION__MAX_ATTEMPTS=5`),
    /// falling back to the defaults above for anything unset.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?)
            .add_source(
                config::Environment::with_prefix("USAGE_ENGINE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let settings = Settings::default();
        assert_eq!(settings.inspection.max_attempts, 3);
        assert_eq!(settings.inspection.min_age_seconds, 3600);
        assert_eq!(settings.queue_batch_size.receive, 10);
        assert_eq!(settings.queue_batch_size.send, 10);
        assert_eq!(settings.default_timezone, "UTC");
    }

    #[test]
    fn load_falls_back_to_defaults_when_unset() {
        let settings = Settings::load().expect("settings should load with only defaults");
        assert_eq!(settings.inspection.max_attempts, 3);
    }
}
