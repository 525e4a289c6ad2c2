pub mod catalog;
pub mod sync;

pub use catalog::{CatalogSnapshot, ModelConfig, ModelRegistry, ModelType, TenantModelGrant};
pub use sync::{ConfigSyncWorker, ControlPlaneClient, GrantRecord, HttpControlPlane};
