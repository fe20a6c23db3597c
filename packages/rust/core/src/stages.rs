//! Per-source stage execution.
//!
//! Each stage checks the job's control markers before every item. After a
//! cancel the running stage commits what it has done and the later stages
//! are skipped.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use tracing::{debug, info, instrument, warn};

use indexsync_jobs::JobWriter;
use indexsync_publish::IndexDocument;
use indexsync_shared::{IndexSyncError, ManifestEntry, Result};
use indexsync_source::RemoteSource;
use indexsync_sync::{ManifestStore, PlanMode, PublishedEntry, SyncPlan, plan};
use indexsync_transform::TransformInput;

use crate::pipeline::{Pipeline, ProgressReporter, RunOptions, SourceReport, Stage};

pub(crate) struct SourceRun<'a> {
    pipeline: &'a Pipeline,
    source: &'a dyn RemoteSource,
    store: ManifestStore,
    options: &'a RunOptions,
    job: &'a mut JobWriter,
    progress: &'a dyn ProgressReporter,
    pub(crate) report: SourceReport,
    pub(crate) cancelled: bool,
}

impl<'a> SourceRun<'a> {
    pub(crate) fn new(
        pipeline: &'a Pipeline,
        source: &'a dyn RemoteSource,
        store: ManifestStore,
        options: &'a RunOptions,
        job: &'a mut JobWriter,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            report: SourceReport::new(source.name()),
            pipeline,
            source,
            store,
            options,
            job,
            progress,
            cancelled: false,
        }
    }

    pub(crate) async fn execute(&mut self) -> Result<()> {
        let (manifest, fetched) = self.download().await?;
        if self.cancelled {
            return Ok(());
        }
        let ready = self.transform(&manifest, &fetched).await?;
        if self.cancelled {
            return Ok(());
        }
        self.publish(&manifest, &ready).await
    }

    // -----------------------------------------------------------------------
    // Download
    // -----------------------------------------------------------------------

    /// Returns the committed local manifest and the ids fetched this run.
    #[instrument(skip_all, fields(source = %self.source.name()))]
    async fn download(&mut self) -> Result<(Vec<ManifestEntry>, HashSet<String>)> {
        self.progress.phase(&format!("{}: listing", self.source.name()));
        let remote = self.source.list().await?;
        let local = self.store.load_local()?;
        let mode = if self.options.full {
            PlanMode::Full
        } else {
            PlanMode::Incremental
        };
        let plan = plan(&remote, &local, mode);

        self.report.listed = remote.len();
        self.report.added = plan.added.len();
        self.report.changed = plan.changed.len();
        self.report.removed = plan.removed.len();
        self.report.unchanged = plan.unchanged.len();
        info!(
            added = plan.added.len(),
            changed = plan.changed.len(),
            removed = plan.removed.len(),
            unchanged = plan.unchanged.len(),
            "download plan"
        );
        self.log(format!(
            "download plan: {} added, {} changed, {} removed, {} unchanged",
            plan.added.len(),
            plan.changed.len(),
            plan.removed.len(),
            plan.unchanged.len()
        ))?;

        let mut fetched = HashSet::new();
        let mut deleted = HashSet::new();
        let total = plan.added.len() + plan.changed.len() + plan.removed.len();
        let mut current = 0;

        if !plan.is_noop() {
            self.progress.phase(&format!("{}: downloading", self.source.name()));
        }

        for entry in plan.to_apply() {
            if self.checkpoint().await? {
                break;
            }
            current += 1;
            self.progress.item(Stage::Download, &entry.path, current, total);

            if self.options.dry_run {
                self.log(format!("[dry run] would fetch {}", entry.path))?;
                self.report.fetched += 1;
                fetched.insert(entry.id.clone());
                continue;
            }

            match self.fetch_one(entry).await {
                Ok(bytes) => {
                    debug!(path = %entry.path, bytes, "item fetched");
                    self.report.fetched += 1;
                    fetched.insert(entry.id.clone());
                }
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "fetch failed, skipping item");
                    self.log(format!("fetch failed for {}: {e}", entry.path))?;
                    self.report.fetch_failed += 1;
                }
            }
        }

        if !self.cancelled {
            for entry in &plan.removed {
                if self.checkpoint().await? {
                    break;
                }
                current += 1;
                self.progress.item(Stage::Download, &entry.path, current, total);

                if self.options.dry_run {
                    self.log(format!("[dry run] would delete {}", entry.path))?;
                } else if let Err(e) = self.delete_local(entry) {
                    warn!(path = %entry.path, error = %e, "delete failed, keeping entry");
                    self.log(format!("delete failed for {}: {e}", entry.path))?;
                    continue;
                } else {
                    self.log(format!("deleted {}", entry.path))?;
                }
                self.report.deleted += 1;
                deleted.insert(entry.id.clone());
            }
        }

        let manifest = next_local_manifest(&remote, &plan, &local, &fetched, &deleted);
        self.store.save_local(&manifest)?;
        Ok((manifest, fetched))
    }

    async fn fetch_one(&self, entry: &ManifestEntry) -> Result<usize> {
        let bytes = self.source.fetch(entry).await?;
        // The artifact goes before the manifest commit so a run stopped
        // before Transform cannot publish it for the new content.
        remove_if_exists(&self.store.artifact_path(entry)?)?;
        let path = self.store.file_path(entry)?;
        write_file(&path, &bytes)?;
        if let Some(at) = entry.fingerprint.modified_at() {
            let file = std::fs::File::options()
                .write(true)
                .open(&path)
                .map_err(|e| IndexSyncError::io(&path, e))?;
            file.set_modified(SystemTime::from(at))
                .map_err(|e| IndexSyncError::io(&path, e))?;
        }
        Ok(bytes.len())
    }

    fn delete_local(&self, entry: &ManifestEntry) -> Result<()> {
        remove_if_exists(&self.store.file_path(entry)?)?;
        remove_if_exists(&self.store.artifact_path(entry)?)
    }

    // -----------------------------------------------------------------------
    // Transform
    // -----------------------------------------------------------------------

    /// Returns the ids with a fresh (or, in a dry run, would-be) artifact.
    #[instrument(skip_all, fields(source = %self.source.name()))]
    async fn transform(
        &mut self,
        manifest: &[ManifestEntry],
        fetched: &HashSet<String>,
    ) -> Result<HashSet<String>> {
        let mut pending = Vec::new();
        for entry in manifest {
            if fetched.contains(&entry.id) || !self.store.artifact_path(entry)?.exists() {
                pending.push(entry);
            }
        }

        let mut ready = HashSet::new();
        if pending.is_empty() {
            return Ok(ready);
        }
        self.progress.phase(&format!("{}: transforming", self.source.name()));

        let total = pending.len();
        for (i, entry) in pending.into_iter().enumerate() {
            if self.checkpoint().await? {
                break;
            }
            self.progress.item(Stage::Transform, &entry.path, i + 1, total);

            if !self.pipeline.transforms.is_supported(entry) {
                debug!(path = %entry.path, content_type = %entry.content_type, "unsupported, skipping");
                self.report.unsupported += 1;
                continue;
            }
            if self.options.dry_run {
                self.log(format!("[dry run] would transform {}", entry.path))?;
                self.report.transformed += 1;
                ready.insert(entry.id.clone());
                continue;
            }

            match self.transform_one(entry) {
                Ok(true) => {
                    self.report.transformed += 1;
                    ready.insert(entry.id.clone());
                }
                Ok(false) => self.report.unsupported += 1,
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "transform failed, skipping item");
                    self.log(format!("transform failed for {}: {e}", entry.path))?;
                    self.report.transform_failed += 1;
                }
            }
        }
        Ok(ready)
    }

    /// `Ok(false)` when no transformer accepts the item.
    fn transform_one(&self, entry: &ManifestEntry) -> Result<bool> {
        let artifact_path = self.store.artifact_path(entry)?;
        remove_if_exists(&artifact_path)?;

        let file = self.store.file_path(entry)?;
        let bytes = std::fs::read(&file).map_err(|e| IndexSyncError::io(&file, e))?;
        let input = TransformInput {
            source: self.source.name(),
            entry,
            bytes: &bytes,
        };
        let Some(artifact) = self.pipeline.transforms.transform(&input)? else {
            return Ok(false);
        };
        write_file(&artifact_path, artifact.markdown.as_bytes())?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(source = %self.source.name()))]
    async fn publish(&mut self, manifest: &[ManifestEntry], ready: &HashSet<String>) -> Result<()> {
        let mut published = self.store.load_published()?;
        let mode = if self.options.full {
            PlanMode::Force
        } else {
            PlanMode::Incremental
        };
        let plan = plan(manifest, &published.manifest(), mode);
        if plan.is_noop() {
            debug!("nothing to publish");
            return Ok(());
        }
        self.log(format!(
            "publish plan: {} new, {} changed, {} removed",
            plan.added.len(),
            plan.changed.len(),
            plan.removed.len()
        ))?;
        self.progress.phase(&format!("{}: publishing", self.source.name()));

        let total = plan.removed.len() + plan.added.len() + plan.changed.len();
        let mut current = 0;

        for entry in &plan.removed {
            if self.checkpoint().await? {
                break;
            }
            current += 1;
            self.progress.item(Stage::Publish, &entry.path, current, total);

            let ids = published
                .get(&entry.id)
                .map(|p| p.published_ids.clone())
                .unwrap_or_default();
            if self.retract(entry, &ids).await? {
                published.remove(&entry.id);
            }
        }

        let changed: HashSet<&str> = plan.changed.iter().map(|e| e.id.as_str()).collect();
        let upserts: Vec<&ManifestEntry> = plan.to_apply().collect();
        for entry in upserts {
            if self.checkpoint().await? {
                break;
            }
            current += 1;
            self.progress.item(Stage::Publish, &entry.path, current, total);

            let artifact_path = self.store.artifact_path(entry)?;
            if !ready.contains(&entry.id) && !artifact_path.exists() {
                debug!(path = %entry.path, "no artifact, not publishing");
                self.report.not_ready += 1;
                continue;
            }

            if changed.contains(entry.id.as_str()) {
                let ids = published
                    .get(&entry.id)
                    .map(|p| p.published_ids.clone())
                    .unwrap_or_default();
                if !self.retract(entry, &ids).await? {
                    continue;
                }
                published.remove(&entry.id);
            }

            if self.options.dry_run {
                self.log(format!("[dry run] would publish {}", entry.path))?;
                self.report.published += 1;
                published.upsert(PublishedEntry {
                    entry: entry.clone(),
                    published_ids: Vec::new(),
                });
                continue;
            }

            match self.publish_one(entry, &artifact_path).await {
                Ok(ids) => {
                    self.report.published += 1;
                    published.upsert(PublishedEntry {
                        entry: entry.clone(),
                        published_ids: ids,
                    });
                }
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "publish failed, skipping item");
                    self.log(format!("publish failed for {}: {e}", entry.path))?;
                    self.report.publish_failed += 1;
                }
            }
        }

        self.store.save_published(&published)
    }

    async fn publish_one(&self, entry: &ManifestEntry, artifact_path: &Path) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(artifact_path)
            .map_err(|e| IndexSyncError::io(artifact_path, e))?;
        let title = artifact_title(&content).unwrap_or_else(|| entry.name.clone());
        let doc = IndexDocument::new(self.source.name(), entry, title, content);
        self.pipeline.publisher.publish(&doc).await
    }

    /// Retract an item's ids. `Ok(false)` when the index refused.
    async fn retract(&mut self, entry: &ManifestEntry, ids: &[String]) -> Result<bool> {
        if self.options.dry_run {
            self.log(format!("[dry run] would retract {}", entry.path))?;
            self.report.retracted += 1;
            return Ok(true);
        }
        match self.pipeline.publisher.retract(ids).await {
            Ok(()) => {
                debug!(path = %entry.path, ids = ids.len(), "item retracted");
                self.report.retracted += 1;
                Ok(true)
            }
            Err(e) => {
                warn!(path = %entry.path, error = %e, "retract failed, skipping item");
                self.log(format!("retract failed for {}: {e}", entry.path))?;
                self.report.publish_failed += 1;
                Ok(false)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Poll control markers. Returns `true` once a cancel has been seen.
    async fn checkpoint(&mut self) -> Result<bool> {
        if !self.cancelled && self.job.check_control().await?.cancel_requested {
            info!(source = self.source.name(), "cancel requested, stopping");
            self.cancelled = true;
        }
        Ok(self.cancelled)
    }

    fn log(&mut self, message: String) -> Result<()> {
        self.job.emit_log(format!("{}: {message}", self.source.name()))
    }
}

/// Local manifest after a download stage, in remote order.
///
/// Unchanged entries stay. Applied items take their remote entry once
/// fetched; otherwise the previous entry (if any) is kept so the item is
/// retried. Removed entries go only once their local copy is deleted, and
/// until then follow in local order.
fn next_local_manifest(
    remote: &[ManifestEntry],
    plan: &SyncPlan,
    local: &[ManifestEntry],
    fetched: &HashSet<String>,
    deleted: &HashSet<String>,
) -> Vec<ManifestEntry> {
    let previous: HashMap<&str, &ManifestEntry> =
        local.iter().map(|e| (e.id.as_str(), e)).collect();
    let planned: HashMap<&str, &ManifestEntry> = plan
        .unchanged
        .iter()
        .chain(plan.to_apply())
        .map(|e| (e.id.as_str(), e))
        .collect();
    let unchanged: HashSet<&str> = plan.unchanged.iter().map(|e| e.id.as_str()).collect();

    let mut next = Vec::with_capacity(remote.len());
    let mut emitted: HashSet<&str> = HashSet::new();
    // The planner keeps the last occurrence of a repeated id.
    for entry in remote.iter().rev() {
        let id = entry.id.as_str();
        let Some(target) = planned.get(id) else {
            continue;
        };
        if !emitted.insert(id) {
            continue;
        }
        if unchanged.contains(id) || fetched.contains(id) {
            next.push((*target).clone());
        } else if let Some(old) = previous.get(id) {
            next.push((*old).clone());
        }
    }
    next.reverse();

    next.extend(
        plan.removed
            .iter()
            .filter(|e| !deleted.contains(&e.id))
            .cloned(),
    );
    next
}

/// `title: "..."` from a frontmatter block, else the first `# ` heading.
fn artifact_title(markdown: &str) -> Option<String> {
    if let Some(rest) = markdown.strip_prefix("---\n") {
        let frontmatter = rest.split("\n---").next().unwrap_or_default();
        let title = frontmatter
            .lines()
            .find_map(|line| line.strip_prefix("title:"))
            .map(|value| unquote(value.trim()));
        if let Some(title) = title.filter(|t| !t.is_empty()) {
            return Some(title);
        }
    }
    markdown
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IndexSyncError::io(parent, e))?;
    }
    let mut file = std::fs::File::create(path).map_err(|e| IndexSyncError::io(path, e))?;
    file.write_all(bytes).map_err(|e| IndexSyncError::io(path, e))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IndexSyncError::io(path, e)),
    }
}
