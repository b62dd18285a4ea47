//! Data types, configuration and persistence

pub mod config;
pub mod persistence;
pub mod state;
pub mod types;

pub use config::{load_installer_config, save_installer_config, FallbackConfig, InstallerConfig};
pub use persistence::{read_optional, remove_optional, write_atomic, StateLayout, StateLock};
pub use state::{BackupSnapshot, FallbackState, SnapshotMeta, StateRecord, StateStore};
pub use types::{Completion, Outcome, StageResult};
