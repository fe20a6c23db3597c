//! Remote content sources.
//!
//! This crate provides:
//! - [`RemoteSource`]: enumerate a source's manifest and download items
//! - [`HttpSource`]: JSON-over-HTTP implementation with transparent pagination
//! - [`ClientCache`]: HTTP clients keyed by credential identity

pub mod client;
pub mod http;

use async_trait::async_trait;

use indexsync_shared::{ManifestEntry, Result};

pub use client::{ClientCache, CredentialKey, USER_AGENT};
pub use http::HttpSource;

/// A place items are listed and downloaded from.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Source name, used in logs and manifest paths.
    fn name(&self) -> &str;

    /// Full remote manifest, across every page.
    async fn list(&self) -> Result<Vec<ManifestEntry>>;

    /// Raw bytes of one item.
    async fn fetch(&self, entry: &ManifestEntry) -> Result<Vec<u8>>;
}
