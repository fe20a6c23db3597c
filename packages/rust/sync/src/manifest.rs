//! Per-source manifest persistence under `{data_dir}/{source}/`.
//!
//! ```text
//! {data_dir}/{source}/
//!   manifest.json     local manifest, committed after each download stage
//!   published.json    what the index currently holds, with publish ids
//!   files/            fetched items at their logical path
//!   artifacts/        transformed, publishable documents
//! ```
//!
//! Manifests are written with temp file + rename so a crash never leaves a
//! half-written manifest behind.

use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use indexsync_shared::{IndexSyncError, ManifestEntry, Result};

const LOCAL_MANIFEST: &str = "manifest.json";
const PUBLISHED_MANIFEST: &str = "published.json";
const DRY_RUN_DIR: &str = ".dry-run";

/// One entry as last published, with the ids the index assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEntry {
    #[serde(flatten)]
    pub entry: ManifestEntry,
    #[serde(default)]
    pub published_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedManifest {
    #[serde(default)]
    pub entries: Vec<PublishedEntry>,
}

impl PublishedManifest {
    /// Manifest entries only, for planning.
    pub fn manifest(&self) -> Vec<ManifestEntry> {
        self.entries.iter().map(|p| p.entry.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&PublishedEntry> {
        self.entries.iter().find(|p| p.entry.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<PublishedEntry> {
        let pos = self.entries.iter().position(|p| p.entry.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Insert or replace by id.
    pub fn upsert(&mut self, published: PublishedEntry) {
        match self
            .entries
            .iter_mut()
            .find(|p| p.entry.id == published.entry.id)
        {
            Some(slot) => *slot = published,
            None => self.entries.push(published),
        }
    }
}

/// Manifest and content locations for one source.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    source: String,
    /// Where manifests are written.
    manifest_dir: PathBuf,
    /// Where manifests are read from when `manifest_dir` has none yet.
    seed_dir: Option<PathBuf>,
    /// Root of `files/` and `artifacts/`.
    content_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(data_dir: &Path, source: &str) -> Self {
        let root = data_dir.join(source);
        Self {
            source: source.to_string(),
            manifest_dir: root.clone(),
            seed_dir: None,
            content_dir: root,
        }
    }

    /// A store whose manifest writes land in a run-scoped scratch directory.
    ///
    /// Reads fall back to the durable manifests until the first write, and
    /// content paths still point at the durable tree (read-only use).
    pub fn dry_run(data_dir: &Path, run_id: &str, source: &str) -> Self {
        let durable = Self::new(data_dir, source);
        Self {
            source: source.to_string(),
            manifest_dir: Self::dry_run_root(data_dir, run_id).join(source),
            seed_dir: Some(durable.manifest_dir),
            content_dir: durable.content_dir,
        }
    }

    /// Scratch root shared by every source of one dry run.
    pub fn dry_run_root(data_dir: &Path, run_id: &str) -> PathBuf {
        data_dir.join(DRY_RUN_DIR).join(run_id)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn manifest_dir(&self) -> &Path {
        &self.manifest_dir
    }

    pub fn files_dir(&self) -> PathBuf {
        self.content_dir.join("files")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.content_dir.join("artifacts")
    }

    /// Local copy of a fetched item.
    pub fn file_path(&self, entry: &ManifestEntry) -> Result<PathBuf> {
        Ok(self.files_dir().join(safe_relative_path(&entry.path)?))
    }

    /// Transformed document for an item (always a `.md` file).
    pub fn artifact_path(&self, entry: &ManifestEntry) -> Result<PathBuf> {
        let rel = safe_relative_path(&entry.path)?;
        let rel = if rel.extension().is_some_and(|ext| ext == "md") {
            rel
        } else {
            let mut name = rel.into_os_string();
            name.push(".md");
            PathBuf::from(name)
        };
        Ok(self.artifacts_dir().join(rel))
    }

    pub fn load_local(&self) -> Result<Vec<ManifestEntry>> {
        Ok(self.read_json(LOCAL_MANIFEST)?.unwrap_or_default())
    }

    pub fn save_local(&self, entries: &[ManifestEntry]) -> Result<()> {
        self.write_json(LOCAL_MANIFEST, &entries)
    }

    pub fn load_published(&self) -> Result<PublishedManifest> {
        Ok(self.read_json(PUBLISHED_MANIFEST)?.unwrap_or_default())
    }

    pub fn save_published(&self, manifest: &PublishedManifest) -> Result<()> {
        self.write_json(PUBLISHED_MANIFEST, manifest)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn read_json<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Result<Option<T>> {
        let primary = self.manifest_dir.join(file);
        let candidates = std::iter::once(primary).chain(self.seed_dir.iter().map(|d| d.join(file)));

        for path in candidates {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(IndexSyncError::io(&path, e)),
            };
            let value = serde_json::from_str(&content).map_err(|e| {
                IndexSyncError::parse(format!("invalid {}: {e}", path.display()))
            })?;
            return Ok(Some(value));
        }
        Ok(None)
    }

    fn write_json<T: Serialize + ?Sized>(&self, file: &str, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.manifest_dir)
            .map_err(|e| IndexSyncError::io(&self.manifest_dir, e))?;
        let path = self.manifest_dir.join(file);
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| IndexSyncError::parse(format!("cannot serialize {file}: {e}")))?;
        atomic_write(&path, &json)?;
        debug!(source = %self.source, path = %path.display(), "manifest written");
        Ok(())
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| IndexSyncError::io(&tmp, e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| IndexSyncError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| IndexSyncError::io(path, e))?;
    #[cfg(unix)]
    if let Some(dir) = path.parent().and_then(|p| File::open(p).ok()) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Turn an item's logical path into a relative path that cannot escape its root.
pub fn safe_relative_path(logical: &str) -> Result<PathBuf> {
    let trimmed = logical.trim_start_matches('/');
    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(IndexSyncError::validation(format!(
                    "item path '{logical}' leaves the source directory"
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(IndexSyncError::validation(format!("empty item path '{logical}'")));
    }
    Ok(out)
}
