//! Configuration Management Module
//!
//! Persistent trust settings: known hosts location, auto-accept override,
//! rejection policy and decision timeout.

pub mod storage;
pub mod types;

pub use storage::{config_dir, trust_config_file, ConfigStorage, StorageError};
pub use types::{TrustConfig, CONFIG_VERSION};
