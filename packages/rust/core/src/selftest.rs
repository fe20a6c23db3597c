//! Round trip through the job directory: create, log, control, end,
//! finalize, read back, delete.

use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use indexsync_jobs::{ControlAction, JobResult, JobState, JobStore, JobWriter, WriterOptions, control};
use indexsync_shared::{JobsConfig, Result};

pub const SELFTEST_CATEGORY: &str = "selftest";

const LOG_LINES: [&str; 3] = ["selftest: one", "selftest: two", "selftest: three"];

#[derive(Debug, Clone, Serialize)]
pub struct SelftestCheck {
    pub name: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelftestReport {
    pub job_id: u64,
    pub elapsed_ms: u64,
    pub checks: Vec<SelftestCheck>,
}

impl SelftestReport {
    pub fn ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    fn check(&mut self, name: &'static str, ok: bool, detail: impl Into<String>) {
        let detail = if ok { String::new() } else { detail.into() };
        if !ok {
            warn!(check = name, %detail, "selftest check failed");
        }
        self.checks.push(SelftestCheck { name, ok, detail });
    }
}

/// Exercise the job lifecycle against the configured job directory.
///
/// Failed checks are reported, not returned as errors; `Err` means the job
/// directory itself could not be used.
#[instrument(skip_all, fields(dir = %config.dir.display()))]
pub async fn selftest(config: &JobsConfig) -> Result<SelftestReport> {
    let start = Instant::now();
    let mut job = JobWriter::create(
        &config.dir,
        SELFTEST_CATEGORY,
        "selftest",
        None,
        WriterOptions::from(config),
    )?;
    let job_id = job.job_id();
    let mut report = SelftestReport {
        job_id,
        elapsed_ms: 0,
        checks: Vec::new(),
    };

    job.emit_start(json!({"trigger": "selftest"}))?;
    for line in LOG_LINES {
        job.emit_log(line)?;
    }
    job.flush()?;

    let store = JobStore::new(&config.dir);
    let running = store.get(job_id)?;
    report.check(
        "running while open",
        running.state == JobState::Running,
        format!("state is {}", running.state),
    );

    control::request(job.dir(), job_id, ControlAction::Cancel)?;
    let outcome = job.check_control().await?;
    report.check(
        "cancel marker observed",
        outcome.cancel_requested,
        "check_control did not report the cancel",
    );

    job.emit_end(JobResult::success(json!({"selftest": true})), outcome.cancel_requested)?;
    job.finalize()?;

    let finished = store.get(job_id)?;
    let expected = if outcome.cancel_requested {
        JobState::Cancelled
    } else {
        JobState::Completed
    };
    report.check(
        "terminal state after finalize",
        finished.state == expected,
        format!("expected {expected}, found {}", finished.state),
    );

    let logs: Vec<&str> = finished
        .logs()
        .map(|l| l.message.as_str())
        .filter(|m| m.starts_with("selftest:"))
        .collect();
    report.check(
        "log lines in order",
        logs == LOG_LINES,
        format!("read back {logs:?}"),
    );
    report.check(
        "control markers cleared",
        control::pending(job.dir(), job_id).is_empty(),
        "markers left behind",
    );

    store.delete(job_id)?;
    report.check(
        "deleted",
        store.find(job_id)?.is_none(),
        "job file still present",
    );

    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(job_id, ok = report.ok(), elapsed_ms = report.elapsed_ms, "selftest finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;

    #[tokio::test]
    async fn selftest_passes_on_a_fresh_directory() {
        let config = JobsConfig {
            dir: scratch_dir("selftest"),
            log_buffer: 20,
            poll_interval_ms: 10,
            ..JobsConfig::default()
        };
        let report = selftest(&config).await.unwrap();
        assert!(report.ok(), "{:?}", report.checks);
        assert_eq!(report.checks.len(), 6);
        assert!(
            JobStore::new(&config.dir)
                .list(Some(SELFTEST_CATEGORY), None)
                .unwrap()
                .is_empty()
        );

        // A second run gets a fresh id.
        let again = selftest(&config).await.unwrap();
        assert!(again.job_id > report.job_id);
    }
}
