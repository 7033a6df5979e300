// Object storage entry: provider configuration and the opendal-backed store

pub mod storage;
pub mod storage_config;

pub use storage::{ObjectStore, DEFAULT_BACKEND_RETRIES};
pub use storage_config::{BackendConfig, CloudBackend, LocalBackend};
