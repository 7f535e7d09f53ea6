//! Configuration Management Module
//!
//! The connection data model, its sanitizer and schema migration, the
//! saved-connection store, and on-disk persistence of the application state.

pub mod migrate;
pub mod sanitize;
pub mod storage;
pub mod store;
pub mod types;

pub use migrate::{merge, migrate, schema_version};
pub use storage::{config_dir, state_file, ConfigStorage, StorageError};
pub use store::{ConnectionStore, StoreError};
pub use types::{
    default_port, normalize_type, AppState, ConnectionConfig, DbType, DriverOptions,
    SavedConnection, SortPreference, SshConfig, CONFIG_VERSION,
};
