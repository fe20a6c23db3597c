//! Shared types, error model, and configuration for indexsync.
//!
//! This crate is the foundation depended on by all other indexsync crates.
//! It provides:
//! - [`IndexSyncError`]: the unified error type
//! - Manifest types ([`ManifestEntry`], [`Fingerprint`])
//! - Configuration ([`AppConfig`], [`JobsConfig`], [`SourceConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, IndexConfig, JobsConfig, PipelineConfig, SourceConfig, SourceKind, config_dir,
    config_file_path, init_config, load_config, load_config_from, read_secret,
};
pub use error::{IndexSyncError, Result};
pub use types::{Fingerprint, ManifestEntry};
