//! Publishing artifacts into the downstream search index.
//!
//! Updates are always remove-then-add: the caller retracts the ids an item
//! was last published under before publishing it again.

mod http;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use indexsync_shared::{ManifestEntry, Result};

pub use http::HttpIndexClient;

/// Document body sent to the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    /// Stable key derived from source and item id.
    pub key: String,
    pub source: String,
    pub item_id: String,
    pub path: String,
    pub title: String,
    pub content_type: String,
    /// Markdown body.
    pub content: String,
    /// Hex SHA-256 of `content`.
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

impl IndexDocument {
    pub fn new(source: &str, entry: &ManifestEntry, title: String, content: String) -> Self {
        Self {
            key: document_key(source, &entry.id),
            source: source.to_string(),
            item_id: entry.id.clone(),
            path: entry.path.clone(),
            title,
            content_type: entry.content_type.clone(),
            content_hash: hex_sha256(content.as_bytes()),
            content,
            modified_at: entry.fingerprint.modified_at().map(|t| t.to_rfc3339()),
        }
    }
}

/// `sha256("{source}\0{item_id}")`, hex encoded.
pub fn document_key(source: &str, item_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(item_id.as_bytes());
    hex(&hasher.finalize())
}

fn hex_sha256(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Index the pipeline writes to.
#[async_trait]
pub trait IndexPublisher: Send + Sync {
    /// Add a document. Returns the ids the index assigned to it.
    async fn publish(&self, doc: &IndexDocument) -> Result<Vec<String>>;

    /// Remove previously published documents by id.
    async fn retract(&self, ids: &[String]) -> Result<()>;
}
