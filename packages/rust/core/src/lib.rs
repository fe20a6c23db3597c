//! Orchestration for indexsync: the sync pipeline, the job wrapper, and selftest.
//!
//! - [`Pipeline`] runs Download → Transform → Publish for each configured source
//! - [`run_job`] wraps any body in a job record with guaranteed finalization
//! - [`selftest`] exercises the job lifecycle end to end against the job directory

pub mod job;
pub mod pipeline;
pub mod selftest;
mod stages;

pub use job::{JobBody, JobRun, JobSpec, Outcome, SyncJob, run_job, run_sync_job};
pub use pipeline::{
    Pipeline, ProgressReporter, RunOptions, RunReport, SilentProgress, SourceReport, Stage,
};
pub use selftest::{SelftestCheck, SelftestReport, selftest};
