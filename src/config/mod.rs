//! Configuration Management Module
//!
//! Persistent settings for connection defaults, the known hosts location,
//! the Bitwarden executable and the transport strategy.

pub mod storage;
pub mod types;

pub use storage::{config_dir, settings_file, ConfigStorage, StorageError};
pub use types::{Settings, CONFIG_VERSION};
