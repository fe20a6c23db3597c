//! Job wrapper: every long-running operation gets a job record that always
//! ends up in a terminal state.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{error, info, instrument};

use indexsync_jobs::{JobResult, JobState, JobWriter, WriterOptions};
use indexsync_shared::{IndexSyncError, JobsConfig, Result};

use crate::pipeline::{Pipeline, ProgressReporter, RunOptions};

/// Category for pipeline runs.
pub const SYNC_CATEGORY: &str = "sync";

/// How a job body finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    /// Ran to the end but has errors to surface; ends with `ok=false`.
    Failed { error: String, data: Value },
    Cancelled(Value),
}

/// Work run inside a job.
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn run(&self, job: &mut JobWriter) -> Result<Outcome>;
}

/// Identity of a job to create.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub category: String,
    pub action: String,
    pub object_id: Option<String>,
    /// Recorded verbatim in the start event.
    pub source: Value,
}

impl JobSpec {
    pub fn new(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            action: action.into(),
            object_id: None,
            source: Value::Null,
        }
    }

    pub fn object(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn source(mut self, source: Value) -> Self {
        self.source = source;
        self
    }
}

/// A finished job.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub job_id: u64,
    pub state: JobState,
    pub result: JobResult,
}

/// Create a job, run `body`, and record how it ended.
///
/// A body error becomes `ok=false` with the error text. The job is
/// finalized on every path, so it never stays `running` after this returns.
#[instrument(skip_all, fields(category = %spec.category, action = %spec.action))]
pub async fn run_job(config: &JobsConfig, spec: JobSpec, body: &dyn JobBody) -> Result<JobRun> {
    let mut job = JobWriter::create(
        &config.dir,
        &spec.category,
        &spec.action,
        spec.object_id.as_deref(),
        WriterOptions::from(config),
    )?;
    let job_id = job.job_id();

    let outcome = match job.emit_start(spec.source) {
        Ok(()) => body.run(&mut job).await,
        Err(e) => Err(e),
    };

    let (result, cancelled) = match outcome {
        Ok(Outcome::Completed(data)) => (JobResult::success(data), false),
        Ok(Outcome::Failed { error, data }) => (JobResult::failure(error, data), false),
        Ok(Outcome::Cancelled(data)) => (JobResult::failure("cancelled by operator", data), true),
        Err(e) => {
            error!(job_id, error = %e, "job body failed");
            (JobResult::failure(e.to_string(), Value::Null), false)
        }
    };

    let ended = job.emit_end(result.clone(), cancelled);
    let finalized = job.finalize();
    ended?;
    finalized?;

    let state = job.state();
    info!(job_id, %state, ok = result.ok, "job finished");
    Ok(JobRun {
        job_id,
        state,
        result,
    })
}

// ---------------------------------------------------------------------------
// Sync jobs
// ---------------------------------------------------------------------------

/// A pipeline run as a job body.
pub struct SyncJob<'a> {
    pub pipeline: &'a Pipeline,
    pub options: &'a RunOptions,
    pub progress: &'a dyn ProgressReporter,
}

#[async_trait]
impl JobBody for SyncJob<'_> {
    async fn run(&self, job: &mut JobWriter) -> Result<Outcome> {
        let report = self.pipeline.run(job, self.options, self.progress).await?;
        let data = serde_json::to_value(&report)
            .map_err(|e| IndexSyncError::parse(format!("run report: {e}")))?;
        Ok(if report.cancelled {
            Outcome::Cancelled(data)
        } else if report.ok() {
            Outcome::Completed(data)
        } else {
            Outcome::Failed {
                error: format!("sources failed: {}", report.failed_sources().join(", ")),
                data,
            }
        })
    }
}

/// Run the pipeline as a `sync` job.
pub async fn run_sync_job(
    config: &JobsConfig,
    pipeline: &Pipeline,
    options: &RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<JobRun> {
    let action = if options.dry_run { "dry-run" } else { "sync" };
    let mut spec = JobSpec::new(SYNC_CATEGORY, action).source(json!({
        "sources": options.sources,
        "full": options.full,
        "dry_run": options.dry_run,
    }));
    if let [only] = options.sources.as_slice() {
        spec = spec.object(only.clone());
    }
    let body = SyncJob {
        pipeline,
        options,
        progress,
    };
    run_job(config, spec, &body).await
}
