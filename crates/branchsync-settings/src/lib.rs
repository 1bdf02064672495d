//! # branchsync-settings
//!
//! Layered configuration for the sync gateway: compiled defaults, an optional
//! JSON settings file, then `BRANCHSYNC_*` environment overrides.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{EngineSettings, LoggingSettings, ServerSettings, SyncSettings, default_modules};
