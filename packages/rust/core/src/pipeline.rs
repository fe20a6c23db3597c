//! The sync pipeline: for each source, Download → Transform → Publish.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use indexsync_jobs::JobWriter;
use indexsync_publish::{HttpIndexClient, IndexPublisher};
use indexsync_shared::{AppConfig, IndexSyncError, Result};
use indexsync_source::{ClientCache, HttpSource, RemoteSource};
use indexsync_sync::ManifestStore;
use indexsync_transform::TransformRegistry;

use crate::stages::SourceRun;

// ---------------------------------------------------------------------------
// Options and reports
// ---------------------------------------------------------------------------

/// Options for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Treat every remote item as new and republish everything.
    pub full: bool,
    /// Plan and log only; durable state is left untouched.
    pub dry_run: bool,
    /// Sources to run, by name. Empty means all configured sources.
    pub sources: Vec<String>,
}

/// Counters for one source. In a dry run they count would-be actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub listed: usize,
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub deleted: usize,
    pub transformed: usize,
    pub transform_failed: usize,
    pub unsupported: usize,
    pub published: usize,
    pub retracted: usize,
    pub publish_failed: usize,
    /// Planned for publishing but no artifact exists yet.
    pub not_ready: usize,
    /// Infrastructure error that aborted this source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceReport {
    pub(crate) fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }

    /// Per-item failures across all stages.
    pub fn item_failures(&self) -> usize {
        self.fetch_failed + self.transform_failed + self.publish_failed
    }
}

/// Outcome of [`Pipeline::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub dry_run: bool,
    pub full: bool,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    /// No source hit an infrastructure error.
    pub fn ok(&self) -> bool {
        self.sources.iter().all(|s| s.error.is_none())
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| s.error.is_some())
            .map(|s| s.source.as_str())
            .collect()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let total = |f: fn(&SourceReport) -> usize| self.sources.iter().map(f).sum::<usize>();
        format!(
            "{} source(s): {} fetched, {} transformed, {} published, {} retracted, {} item failure(s){}{}",
            self.sources.len(),
            total(|s| s.fetched),
            total(|s| s.transformed),
            total(|s| s.published),
            total(|s| s.retracted),
            total(SourceReport::item_failures),
            if self.cancelled { ", cancelled" } else { "" },
            if self.dry_run { " (dry run)" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Pipeline stage, for progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Transform,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Download => "download",
            Self::Transform => "transform",
            Self::Publish => "publish",
        })
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called before each item a stage acts on.
    fn item(&self, stage: Stage, path: &str, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item(&self, _stage: Stage, _path: &str, _current: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Sources, transformers and index for a run.
pub struct Pipeline {
    pub(crate) data_dir: PathBuf,
    pub(crate) sources: Vec<Arc<dyn RemoteSource>>,
    pub(crate) publisher: Arc<dyn IndexPublisher>,
    pub(crate) transforms: TransformRegistry,
}

impl Pipeline {
    pub fn new(data_dir: impl Into<PathBuf>, publisher: Arc<dyn IndexPublisher>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sources: Vec::new(),
            publisher,
            transforms: TransformRegistry::new(),
        }
    }

    /// HTTP sources and index client from the config, sharing `cache`.
    pub fn from_config(config: &AppConfig, cache: &ClientCache) -> Result<Self> {
        config.validate()?;
        let publisher = Arc::new(HttpIndexClient::new(&config.index, cache)?);
        let mut pipeline = Self::new(&config.pipeline.data_dir, publisher);
        for source in &config.sources {
            pipeline = pipeline.with_source(Arc::new(HttpSource::new(source, cache)?));
        }
        Ok(pipeline)
    }

    pub fn with_source(mut self, source: Arc<dyn RemoteSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_transforms(mut self, transforms: TransformRegistry) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Sources selected by `names`, in configured order.
    fn select(&self, names: &[String]) -> Result<Vec<&dyn RemoteSource>> {
        if let Some(unknown) = names
            .iter()
            .find(|n| !self.sources.iter().any(|s| s.name() == n.as_str()))
        {
            return Err(IndexSyncError::validation(format!("unknown source '{unknown}'")));
        }
        Ok(self
            .sources
            .iter()
            .filter(|s| names.is_empty() || names.iter().any(|n| n == s.name()))
            .map(|s| s.as_ref())
            .collect())
    }

    /// Run every selected source in order, logging to `job`.
    ///
    /// Per-item failures are counted; a source infrastructure error is
    /// recorded on that source's report and the next source proceeds. Only
    /// job-record failures and option errors are returned as `Err`.
    #[instrument(skip_all, fields(full = options.full, dry_run = options.dry_run))]
    pub async fn run(
        &self,
        job: &mut JobWriter,
        options: &RunOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let selected = self.select(&options.sources)?;
        let run_id = uuid::Uuid::now_v7().to_string();

        info!(%run_id, sources = selected.len(), "starting sync run");
        job.emit_log(format!(
            "run {run_id}: {} source(s){}{}",
            selected.len(),
            if options.full { ", full" } else { "" },
            if options.dry_run { ", dry run" } else { "" },
        ))?;

        let mut report = RunReport {
            run_id: run_id.clone(),
            dry_run: options.dry_run,
            full: options.full,
            cancelled: false,
            elapsed_ms: 0,
            sources: Vec::new(),
        };

        for source in selected {
            let store = if options.dry_run {
                ManifestStore::dry_run(&self.data_dir, &run_id, source.name())
            } else {
                ManifestStore::new(&self.data_dir, source.name())
            };

            let mut run = SourceRun::new(self, source, store, options, job, progress);
            let outcome = run.execute().await;
            let cancelled = run.cancelled;
            let mut source_report = run.report;

            if let Err(e) = outcome {
                if is_job_record_error(job, &e) {
                    return Err(e);
                }
                warn!(source = source.name(), error = %e, "source failed, continuing");
                job.emit_log(format!("{}: failed: {e}", source.name()))?;
                source_report.error = Some(e.to_string());
            }
            report.sources.push(source_report);

            if cancelled {
                report.cancelled = true;
                job.emit_log("cancel requested, skipping remaining sources")?;
                break;
            }
        }

        if options.dry_run {
            let scratch = ManifestStore::dry_run_root(&self.data_dir, &run_id);
            if let Err(e) = std::fs::remove_dir_all(&scratch) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %scratch.display(), error = %e, "failed to remove dry-run scratch dir");
                }
            }
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(%run_id, ok = report.ok(), cancelled = report.cancelled, "sync run finished");
        job.emit_log(report.summary())?;
        progress.done(&report);
        Ok(report)
    }
}

/// Errors writing the job file itself end the run rather than the source.
fn is_job_record_error(job: &JobWriter, err: &IndexSyncError) -> bool {
    match err {
        IndexSyncError::Io { path, .. } => path.starts_with(job.dir()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeIndex, FakeSource, scratch_dir};
    use indexsync_jobs::{ControlAction, JobState, JobStore, WriterOptions, control};
    use indexsync_sync::PublishedManifest;

    struct Harness {
        root: PathBuf,
        index: Arc<FakeIndex>,
    }

    impl Harness {
        fn new(label: &str) -> Self {
            Self {
                root: scratch_dir(label),
                index: Arc::new(FakeIndex::default()),
            }
        }

        fn data_dir(&self) -> PathBuf {
            self.root.join("data")
        }

        fn jobs_dir(&self) -> PathBuf {
            self.root.join("jobs")
        }

        fn pipeline(&self, sources: &[&Arc<FakeSource>]) -> Pipeline {
            let mut pipeline = Pipeline::new(self.data_dir(), self.index.clone());
            for source in sources {
                let source = Arc::clone(*source) as Arc<dyn RemoteSource>;
                pipeline = pipeline.with_source(source);
            }
            pipeline
        }

        fn job(&self) -> JobWriter {
            let options = WriterOptions {
                log_buffer: 1,
                poll_interval: std::time::Duration::from_millis(10),
            };
            let mut job = JobWriter::create(&self.jobs_dir(), "sync", "sync", None, options).unwrap();
            job.emit_start(serde_json::json!({"trigger": "test"})).unwrap();
            job
        }

        async fn run(&self, pipeline: &Pipeline, options: RunOptions) -> RunReport {
            let mut job = self.job();
            let report = pipeline.run(&mut job, &options, &SilentProgress).await.unwrap();
            job.finalize().unwrap();
            report
        }

        /// Run and return the job's log messages along with the report.
        async fn run_logged(&self, pipeline: &Pipeline, options: RunOptions) -> (RunReport, Vec<String>) {
            let mut job = self.job();
            let id = job.job_id();
            let report = pipeline.run(&mut job, &options, &SilentProgress).await.unwrap();
            job.finalize().unwrap();
            let logs = JobStore::new(self.jobs_dir())
                .get(id)
                .unwrap()
                .logs()
                .map(|l| l.message.clone())
                .collect();
            (report, logs)
        }

        fn manifest_bytes(&self, source: &str) -> (Vec<u8>, Vec<u8>) {
            let dir = self.data_dir().join(source);
            (
                std::fs::read(dir.join("manifest.json")).unwrap_or_default(),
                std::fs::read(dir.join("published.json")).unwrap_or_default(),
            )
        }

        fn published(&self, source: &str) -> PublishedManifest {
            ManifestStore::new(&self.data_dir(), source).load_published().unwrap()
        }
    }

    fn notes() -> Arc<FakeSource> {
        let source = FakeSource::new("notes");
        source.put("1", "a.md", 100, "# Alpha\n\nfirst\n");
        source.put("2", "b/b.md", 200, "# Beta\n\nsecond\n");
        Arc::new(source)
    }

    #[tokio::test]
    async fn first_run_downloads_transforms_and_publishes() {
        let h = Harness::new("pipe-first");
        let source = notes();
        let report = h.run(&h.pipeline(&[&source]), RunOptions::default()).await;

        assert!(report.ok());
        let r = &report.sources[0];
        assert_eq!((r.added, r.fetched, r.transformed, r.published), (2, 2, 2, 2));
        assert_eq!(h.index.live_paths(), vec!["a.md", "b/b.md"]);

        let files = h.data_dir().join("notes/files");
        assert_eq!(std::fs::read_to_string(files.join("b/b.md")).unwrap(), "# Beta\n\nsecond\n");
        let modified = std::fs::metadata(files.join("a.md")).unwrap().modified().unwrap();
        let secs = modified.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 100);

        let published = h.published("notes");
        assert_eq!(published.entries.len(), 2);
        assert!(published.entries.iter().all(|e| !e.published_ids.is_empty()));
    }

    #[tokio::test]
    async fn second_run_without_changes_does_nothing() {
        let h = Harness::new("pipe-idem");
        let source = notes();
        let pipeline = h.pipeline(&[&source]);
        h.run(&pipeline, RunOptions::default()).await;
        let fetches = source.fetch_count();
        let calls = h.index.calls().len();
        let before = h.manifest_bytes("notes");

        let report = h.run(&pipeline, RunOptions::default()).await;
        let r = &report.sources[0];
        assert_eq!((r.added, r.changed, r.removed, r.unchanged), (0, 0, 0, 2));
        assert_eq!(source.fetch_count(), fetches);
        assert_eq!(h.index.calls().len(), calls);
        assert_eq!(h.manifest_bytes("notes"), before);
    }

    #[tokio::test]
    async fn changed_item_is_retracted_before_republish() {
        let h = Harness::new("pipe-changed");
        let source = notes();
        let pipeline = h.pipeline(&[&source]);
        h.run(&pipeline, RunOptions::default()).await;

        source.put("1", "a.md", 150, "# Alpha\n\nrevised\n");
        let report = h.run(&pipeline, RunOptions::default()).await;
        assert_eq!(report.sources[0].changed, 1);
        assert_eq!(report.sources[0].retracted, 1);

        let calls = h.index.calls();
        assert_eq!(&calls[calls.len() - 2..], ["retract a.md", "publish a.md"]);
        let live = h.index.live.lock().unwrap();
        let doc = live.values().find(|d| d.path == "a.md").unwrap();
        assert!(doc.content.contains("revised"));
    }

    #[tokio::test]
    async fn change_fetched_before_a_cancel_is_published_on_the_next_run() {
        let h = Harness::new("pipe-cancel-fetch");
        let source = notes();
        let pipeline = h.pipeline(&[&source]);
        h.run(&pipeline, RunOptions::default()).await;

        source.put("1", "a.md", 150, "# Alpha\n\nrevised\n");
        let mut job = h.job();
        source.cancel_during_fetch("1", job.dir(), job.job_id());
        let report = pipeline
            .run(&mut job, &RunOptions::default(), &SilentProgress)
            .await
            .unwrap();
        job.finalize().unwrap();
        let r = &report.sources[0];
        assert!(report.cancelled);
        assert_eq!((r.fetched, r.transformed, r.published), (1, 0, 0));
        assert!(!h.data_dir().join("notes/artifacts/a.md").exists());

        let report = h.run(&pipeline, RunOptions::default()).await;
        let r = &report.sources[0];
        assert_eq!((r.changed, r.transformed, r.published), (0, 1, 1));
        {
            let live = h.index.live.lock().unwrap();
            let doc = live.values().find(|d| d.path == "a.md").unwrap();
            assert!(doc.content.contains("revised"));
            assert_eq!(live.len(), 2);
        }
        let published = h.published("notes");
        assert_eq!(published.get("1").map(|p| p.entry.fingerprint.mtime), Some(Some(150)));
    }

    #[tokio::test]
    async fn removed_item_is_deleted_and_retracted() {
        let h = Harness::new("pipe-removed");
        let source = notes();
        let pipeline = h.pipeline(&[&source]);
        h.run(&pipeline, RunOptions::default()).await;

        source.drop_item("2");
        let report = h.run(&pipeline, RunOptions::default()).await;
        let r = &report.sources[0];
        assert_eq!((r.removed, r.deleted, r.retracted), (1, 1, 1));
        assert!(!h.data_dir().join("notes/files/b/b.md").exists());
        assert!(!h.data_dir().join("notes/artifacts/b/b.md").exists());
        assert_eq!(h.index.live_paths(), vec!["a.md"]);
        assert!(h.published("notes").get("2").is_none());
    }

    #[tokio::test]
    async fn failed_fetch_is_isolated_and_retried() {
        let h = Harness::new("pipe-item-fail");
        let source = notes();
        source.fail_fetch("2");
        let pipeline = h.pipeline(&[&source]);

        let report = h.run(&pipeline, RunOptions::default()).await;
        assert!(report.ok());
        let r = &report.sources[0];
        assert_eq!((r.fetched, r.fetch_failed, r.published), (1, 1, 1));
        assert_eq!(h.index.live_paths(), vec!["a.md"]);

        source.heal();
        let report = h.run(&pipeline, RunOptions::default()).await;
        assert_eq!(report.sources[0].added, 1);
        assert_eq!(h.index.live_paths(), vec!["a.md", "b/b.md"]);
    }

    #[tokio::test]
    async fn failed_change_keeps_the_old_entry() {
        let h = Harness::new("pipe-change-fail");
        let source = notes();
        let pipeline = h.pipeline(&[&source]);
        h.run(&pipeline, RunOptions::default()).await;

        source.put("1", "a.md", 150, "# Alpha\n\nrevised\n");
        source.fail_fetch("1");
        let report = h.run(&pipeline, RunOptions::default()).await;
        assert_eq!(report.sources[0].fetch_failed, 1);
        assert_eq!(report.sources[0].published, 0);

        let local = ManifestStore::new(&h.data_dir(), "notes").load_local().unwrap();
        let a = local.iter().find(|e| e.id == "1").unwrap();
        assert_eq!(a.fingerprint.mtime, Some(100));

        source.heal();
        let report = h.run(&pipeline, RunOptions::default()).await;
        assert_eq!(report.sources[0].changed, 1);
        assert_eq!(report.sources[0].published, 1);
    }

    #[tokio::test]
    async fn unreachable_source_does_not_stop_the_others() {
        let h = Harness::new("pipe-infra");
        let broken = Arc::new(FakeSource::unreachable("wiki"));
        let source = notes();
        let report = h
            .run(&h.pipeline(&[&broken, &source]), RunOptions::default())
            .await;

        assert!(!report.ok());
        assert_eq!(report.failed_sources(), vec!["wiki"]);
        assert!(report.sources[0].error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(report.sources[1].published, 2);
    }

    #[tokio::test]
    async fn unsupported_items_are_skipped_and_not_published() {
        let h = Harness::new("pipe-unsupported");
        let source = notes();
        source.put_entry(
            indexsync_shared::ManifestEntry::new(
                "3",
                indexsync_shared::Fingerprint::new(4, 300),
                "logo.png",
                "image/png",
            ),
            b"\x89PNG".to_vec(),
        );
        let report = h.run(&h.pipeline(&[&source]), RunOptions::default()).await;
        let r = &report.sources[0];
        assert_eq!((r.fetched, r.unsupported, r.published, r.not_ready), (3, 1, 2, 1));
        assert!(h.published("notes").get("3").is_none());
    }

    #[tokio::test]
    async fn html_items_are_converted() {
        let h = Harness::new("pipe-html");
        let source = FakeSource::new("site");
        let body = "<html><body><main><h1>Install</h1><p>Run it.</p></main></body></html>";
        source.put_entry(
            indexsync_shared::ManifestEntry::new(
                "p1",
                indexsync_shared::Fingerprint::new(body.len() as u64, 10),
                "guide/install.html",
                "text/html",
            ),
            body.as_bytes().to_vec(),
        );
        let source = Arc::new(source);
        h.run(&h.pipeline(&[&source]), RunOptions::default()).await;

        let artifact = h.data_dir().join("site/artifacts/guide/install.html.md");
        let markdown = std::fs::read_to_string(artifact).unwrap();
        assert!(markdown.contains("# Install"));
        let live = h.index.live.lock().unwrap();
        let doc = live.values().next().unwrap();
        assert_eq!(doc.title, "Install");
        assert_eq!(doc.source, "site");
    }

    #[tokio::test]
    async fn full_run_refetches_and_replaces_everything() {
        let h = Harness::new("pipe-full");
        let source = notes();
        let pipeline = h.pipeline(&[&source]);
        h.run(&pipeline, RunOptions::default()).await;

        let full = RunOptions {
            full: true,
            ..RunOptions::default()
        };
        let report = h.run(&pipeline, full).await;
        let r = &report.sources[0];
        assert_eq!((r.added, r.fetched, r.retracted, r.published), (2, 2, 2, 2));
        assert_eq!(source.fetch_count(), 4);
        assert_eq!(h.index.live_paths(), vec!["a.md", "b/b.md"]);
    }

    #[tokio::test]
    async fn dry_run_leaves_durable_state_untouched() {
        let h = Harness::new("pipe-dry");
        let source = notes();
        let pipeline = h.pipeline(&[&source]);
        let real = h.run(&pipeline, RunOptions::default()).await;
        let before = h.manifest_bytes("notes");
        let fetches = source.fetch_count();
        let calls = h.index.calls().len();

        let dry = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let unchanged = h.run(&pipeline, dry.clone()).await;
        assert_eq!(unchanged.sources[0].unchanged, real.sources[0].added);
        assert_eq!(unchanged.sources[0].published, 0);

        source.put("1", "a.md", 150, "# Alpha\n\nrevised\n");
        source.put("3", "c.md", 300, "# Gamma\n");
        source.drop_item("2");
        let report = h.run(&pipeline, dry).await;
        let r = &report.sources[0];
        assert!(report.dry_run);
        assert_eq!((r.added, r.changed, r.removed), (1, 1, 1));
        assert_eq!((r.fetched, r.published, r.retracted), (2, 2, 2));

        assert_eq!(h.manifest_bytes("notes"), before);
        assert_eq!(source.fetch_count(), fetches);
        assert_eq!(h.index.calls().len(), calls);
        assert!(h.data_dir().join("notes/files/b/b.md").exists());
        assert!(!h.data_dir().join(".dry-run").join(&report.run_id).exists());
    }

    #[tokio::test]
    async fn dry_run_decisions_match_a_real_run() {
        let h = Harness::new("pipe-dry-log");
        let source = notes();
        let pipeline = h.pipeline(&[&source]);
        h.run(&pipeline, RunOptions::default()).await;

        let dry = h
            .run(
                &pipeline,
                RunOptions {
                    dry_run: true,
                    ..RunOptions::default()
                },
            )
            .await;
        let real = h.run(&pipeline, RunOptions::default()).await;

        let decisions = |r: &RunReport| {
            let mut s = r.sources[0].clone();
            s.source.clear();
            s
        };
        assert_eq!(decisions(&dry), decisions(&real));
    }

    #[tokio::test]
    async fn dry_run_logs_the_same_plans_as_a_real_run() {
        let h = Harness::new("pipe-dry-plans");
        let source = notes();
        let pipeline = h.pipeline(&[&source]);
        h.run(&pipeline, RunOptions::default()).await;

        source.put("1", "a.md", 150, "# Alpha\n\nrevised\n");
        source.put("3", "c.md", 300, "# Gamma\n");
        source.drop_item("2");

        let dry = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let (_, dry_logs) = h.run_logged(&pipeline, dry).await;
        let (_, real_logs) = h.run_logged(&pipeline, RunOptions::default()).await;

        let plans = |logs: &[String]| -> Vec<String> {
            logs.iter().filter(|m| m.contains(" plan: ")).cloned().collect()
        };
        assert_eq!(
            plans(&dry_logs),
            vec![
                "notes: download plan: 1 added, 1 changed, 1 removed, 0 unchanged",
                "notes: publish plan: 1 new, 1 changed, 1 removed",
            ]
        );
        assert_eq!(plans(&dry_logs), plans(&real_logs));
        assert!(dry_logs.iter().any(|m| m == "notes: [dry run] would publish c.md"));
    }

    #[tokio::test]
    async fn cancel_stops_the_run_and_keeps_progress() {
        let h = Harness::new("pipe-cancel");
        let first = notes();
        let second = Arc::new(FakeSource::new("wiki"));
        second.put("w", "w.md", 1, "# W\n");
        let pipeline = h.pipeline(&[&first, &second]);

        let mut job = h.job();
        control::request(job.dir(), job.job_id(), ControlAction::Cancel).unwrap();
        let report = pipeline
            .run(&mut job, &RunOptions::default(), &SilentProgress)
            .await
            .unwrap();
        job.emit_end(indexsync_jobs::JobResult::success(serde_json::Value::Null), true)
            .unwrap();
        job.finalize().unwrap();

        assert!(report.cancelled);
        assert_eq!(report.sources.len(), 1);
        assert_eq!(first.fetch_count(), 0);
        assert_eq!(second.fetch_count(), 0);
        assert!(h.index.calls().is_empty());

        let store = JobStore::new(h.jobs_dir());
        let jobs = store.list(Some("sync"), Some(JobState::Cancelled)).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].logs().any(|l| l.message.contains("cancel requested")));

        // The next run picks up where the cancelled one stopped.
        let report = h.run(&pipeline, RunOptions::default()).await;
        assert_eq!(report.sources[0].added, 2);
        assert_eq!(report.sources[1].added, 1);
    }

    #[tokio::test]
    async fn source_filter_selects_and_validates() {
        let h = Harness::new("pipe-filter");
        let first = notes();
        let second = Arc::new(FakeSource::new("wiki"));
        let pipeline = h.pipeline(&[&first, &second]);

        let only_wiki = RunOptions {
            sources: vec!["wiki".into()],
            ..RunOptions::default()
        };
        let report = h.run(&pipeline, only_wiki).await;
        assert_eq!(report.sources.len(), 1);
        assert_eq!(report.sources[0].source, "wiki");
        assert_eq!(first.fetch_count(), 0);

        let mut job = h.job();
        let unknown = RunOptions {
            sources: vec!["nope".into()],
            ..RunOptions::default()
        };
        let err = pipeline.run(&mut job, &unknown, &SilentProgress).await.unwrap_err();
        assert!(matches!(err, IndexSyncError::Validation { .. }));
    }
}
