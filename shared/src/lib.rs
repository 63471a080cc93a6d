//! Shared domain model, configuration, and persistence/cloud-client seams
//! for the usage-reconciliation engine.

pub mod cloud_client;
pub mod config;
pub mod error;
pub mod model;
pub mod store;

pub use cloud_client::CloudClient;
pub use error::UsageError;
pub use store::Store;
