//! Manifest data model shared by the planner, the content client and the pipeline.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Cheap "did this change" proxy: byte size plus last-modified time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Content length in bytes.
    pub size: u64,
    /// Last-modified time in Unix seconds. `None` or `0` means unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
}

impl Fingerprint {
    pub fn new(size: u64, mtime: i64) -> Self {
        Self {
            size,
            mtime: Some(mtime),
        }
    }

    /// Whether the timestamp can be trusted for skip decisions.
    pub fn has_timestamp(&self) -> bool {
        self.mtime.is_some_and(|t| t > 0)
    }

    /// Two fingerprints match only if both carry a usable timestamp.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        self.has_timestamp() && other.has_timestamp() && self == other
    }

    /// The timestamp as a UTC datetime, if known.
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.mtime
            .filter(|t| *t > 0)
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
    }
}

// ---------------------------------------------------------------------------
// ManifestEntry
// ---------------------------------------------------------------------------

/// One remote or local item description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Stable identifier assigned by the content source.
    pub id: String,
    /// Size + mtime fingerprint.
    pub fingerprint: Fingerprint,
    /// Logical relative path within the source.
    pub path: String,
    /// Display name.
    pub name: String,
    /// MIME-like content type (`text/html`, `text/markdown`, ...).
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "application/octet-stream".into()
}

impl ManifestEntry {
    pub fn new(
        id: impl Into<String>,
        fingerprint: Fingerprint,
        path: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        Self {
            id: id.into(),
            fingerprint,
            path,
            name,
            content_type: content_type.into(),
        }
    }
}
