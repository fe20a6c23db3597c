//! Observer side of the job directory: enumerate, inspect, delete, override.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use indexsync_shared::{IndexSyncError, Result};

use crate::control::{self, ControlAction};
use crate::naming::JobFileName;
use crate::record::{self, EndRecord, Event, LogRecord};
use crate::state::JobState;

/// Error text recorded by [`JobStore::force_cancel`].
pub const FORCE_CANCEL_ERROR: &str = "force-cancelled by operator";

/// Default age after which an active job counts as stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// Outcome recorded in a job's `end` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub ok: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobResult {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            error: String::new(),
            data,
        }
    }

    pub fn failure(error: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            ok: false,
            error: error.into(),
            data,
        }
    }
}

/// A job as read back from its file.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: u64,
    pub category: String,
    pub action: String,
    pub object_id: Option<String>,
    pub state: JobState,
    pub source: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub events: Vec<Event>,
    pub path: PathBuf,
    pub modified_at: DateTime<Utc>,
}

impl Job {
    fn load(category: &str, path: &Path, name: JobFileName) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| IndexSyncError::io(path, e))?;
        let modified_at = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| IndexSyncError::io(path, e))?;
        let (events, _) = record::decode_complete(&bytes)?;

        let mut started_at = name.started_at;
        let mut source = serde_json::Value::Null;
        let mut finished_at = None;
        let mut result = None;
        for event in &events {
            match event {
                Event::Start(start) => {
                    started_at = start.at;
                    source = start.source.clone();
                }
                Event::End(end) => {
                    finished_at = Some(end.at);
                    result = Some(JobResult {
                        ok: end.ok,
                        error: end.error.clone(),
                        data: end.data.clone(),
                    });
                }
                Event::Log(_) | Event::State(_) => {}
            }
        }

        Ok(Self {
            job_id: name.job_id,
            category: category.to_string(),
            action: name.action,
            object_id: name.object_id,
            state: name.state,
            source,
            started_at,
            finished_at,
            result,
            events,
            path: path.to_path_buf(),
            modified_at: modified_at.into(),
        })
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogRecord> {
        self.events.iter().filter_map(|e| match e {
            Event::Log(log) => Some(log),
            _ => None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Active and not touched for longer than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if !self.is_active() {
            return false;
        }
        let age = now.signed_duration_since(self.modified_at);
        age.to_std().is_ok_and(|age| age > threshold)
    }

    /// Category directory holding the file and its control markers.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// A job file located on disk but not yet read.
#[derive(Debug, Clone)]
struct Located {
    category: String,
    path: PathBuf,
    name: JobFileName,
}

/// Read-mostly view over `{base}/{category}/` job files.
#[derive(Debug, Clone)]
pub struct JobStore {
    base_dir: PathBuf,
    stale_after: Duration,
}

impl JobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.is_stale(now, self.stale_after)
    }

    /// Jobs newest-first by modification time. Unreadable files are skipped.
    pub fn list(&self, category: Option<&str>, state: Option<JobState>) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for located in self.scan(category)? {
            if state.is_some_and(|s| s != located.name.state) {
                continue;
            }
            match Job::load(&located.category, &located.path, located.name) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %located.path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        jobs.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        Ok(jobs)
    }

    pub fn find(&self, job_id: u64) -> Result<Option<Job>> {
        // The owner may rename the file between locating and reading it.
        for _ in 0..3 {
            let Some(located) = self.locate(job_id)? else {
                return Ok(None);
            };
            match Job::load(&located.category, &located.path, located.name) {
                Ok(job) => return Ok(Some(job)),
                Err(IndexSyncError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                    debug!(job_id, "job file moved while reading, relocating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(IndexSyncError::Conflict(format!(
            "job {job_id} kept moving while being read"
        )))
    }

    /// Like [`JobStore::find`], but a missing job is an error.
    pub fn get(&self, job_id: u64) -> Result<Job> {
        self.find(job_id)?
            .ok_or_else(|| IndexSyncError::NotFound(format!("job {job_id}")))
    }

    /// Remove a terminal job's file and any leftover markers.
    pub fn delete(&self, job_id: u64) -> Result<()> {
        let job = self.get(job_id)?;
        if job.is_active() {
            return Err(IndexSyncError::transition(job.state, "deleted"));
        }
        std::fs::remove_file(&job.path).map_err(|e| IndexSyncError::io(&job.path, e))?;
        control::clear(job.dir(), job_id)?;
        info!(job_id, "job deleted");
        Ok(())
    }

    /// Move a stale running/paused job straight to cancelled.
    pub fn force_cancel(&self, job_id: u64) -> Result<Job> {
        let job = self.get(job_id)?;
        match job.state {
            JobState::Cancelled => return Ok(job),
            JobState::Completed => {
                return Err(IndexSyncError::transition(job.state, JobState::Cancelled));
            }
            JobState::Running | JobState::Paused => {}
        }
        if !self.is_stale(&job, Utc::now()) {
            return Err(IndexSyncError::Conflict(format!(
                "job {job_id} is {} and was updated within the last {}s; request a cooperative cancel instead",
                job.state,
                self.stale_after.as_secs()
            )));
        }

        let end = Event::End(EndRecord {
            at: Utc::now(),
            ok: false,
            error: FORCE_CANCEL_ERROR.to_string(),
            data: serde_json::Value::Null,
            state: JobState::Cancelled,
        });
        // A dead owner may have left half an event behind; the end event
        // must start on a block boundary.
        let bytes = std::fs::read(&job.path).map_err(|e| IndexSyncError::io(&job.path, e))?;
        let (_, used) = record::decode_complete(&bytes)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&job.path)
            .map_err(|e| IndexSyncError::io(&job.path, e))?;
        if used < bytes.len() {
            warn!(job_id, dropped = bytes.len() - used, "discarding torn trailing event");
            file.set_len(used as u64)
                .map_err(|e| IndexSyncError::io(&job.path, e))?;
        }
        file.write_all(end.encode().as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| IndexSyncError::io(&job.path, e))?;
        drop(file);

        let Some(name) = job.path.file_name().and_then(|n| n.to_str()).and_then(JobFileName::parse)
        else {
            return Err(IndexSyncError::parse(format!(
                "unparsable job file name {}",
                job.path.display()
            )));
        };
        let target = job.dir().join(name.with_state(JobState::Cancelled).render());
        std::fs::rename(&job.path, &target).map_err(|e| IndexSyncError::io(&job.path, e))?;
        control::clear(job.dir(), job_id)?;
        warn!(job_id, previous = %job.state, "job force-cancelled");

        self.get(job_id)
    }

    /// Validate an operator request against the job's state, then deliver it.
    pub fn request_control(&self, job_id: u64, action: ControlAction, force: bool) -> Result<Job> {
        if force && action == ControlAction::Cancel {
            return self.force_cancel(job_id);
        }

        let job = self.get(job_id)?;
        let invalid = match (action, job.state) {
            (_, state) if state.is_terminal() => true,
            (ControlAction::Pause, JobState::Paused) => true,
            (ControlAction::Resume, JobState::Running) => true,
            _ => false,
        };
        if invalid {
            return Err(IndexSyncError::transition(job.state, requested_state(action)));
        }

        control::request(job.dir(), job_id, action)?;
        info!(job_id, %action, "control requested");
        Ok(job)
    }

    /// Replay a job's events, then stream new ones until it is terminal.
    pub async fn follow<F>(&self, job_id: u64, poll: Duration, mut on_event: F) -> Result<Job>
    where
        F: FnMut(&Event),
    {
        let mut offset = 0usize;
        loop {
            let Some(located) = self.locate(job_id)? else {
                return Err(IndexSyncError::NotFound(format!("job {job_id}")));
            };
            let bytes = match std::fs::read(&located.path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(IndexSyncError::io(&located.path, e)),
            };
            if bytes.len() > offset {
                let (events, used) = record::decode_complete(&bytes[offset..])?;
                events.iter().for_each(&mut on_event);
                offset += used;
            }
            // Terminal renames happen after the last write, so the file is drained.
            if located.name.state.is_terminal() {
                return self.get(job_id);
            }
            tokio::time::sleep(poll).await;
        }
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    fn locate(&self, job_id: u64) -> Result<Option<Located>> {
        Ok(self
            .scan(None)?
            .into_iter()
            .find(|located| located.name.job_id == job_id))
    }

    fn scan(&self, category: Option<&str>) -> Result<Vec<Located>> {
        let categories = match category {
            Some(category) => vec![category.to_string()],
            None => self.categories()?,
        };

        let mut found = Vec::new();
        for category in categories {
            let dir = self.base_dir.join(&category);
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(IndexSyncError::io(&dir, e)),
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str().and_then(JobFileName::parse) else {
                    continue;
                };
                found.push(Located {
                    category: category.clone(),
                    path: entry.path(),
                    name,
                });
            }
        }
        Ok(found)
    }

    fn categories(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IndexSyncError::io(&self.base_dir, e)),
        };
        let mut categories: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .filter(|name| !name.starts_with('.'))
            .collect();
        categories.sort();
        Ok(categories)
    }
}

fn requested_state(action: ControlAction) -> JobState {
    match action {
        ControlAction::Pause => JobState::Paused,
        ControlAction::Resume => JobState::Running,
        ControlAction::Cancel => JobState::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;

    use crate::testutil::scratch_dir;
    use crate::writer::{JobWriter, WriterOptions};

    fn options() -> WriterOptions {
        WriterOptions {
            log_buffer: 1,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn started(base: &Path, category: &str) -> JobWriter {
        let mut job = JobWriter::create(base, category, "sync", None, options()).unwrap();
        job.emit_start(serde_json::json!({"trigger": "test"})).unwrap();
        job
    }

    fn completed(base: &Path, category: &str) -> u64 {
        let mut job = started(base, category);
        job.emit_end(JobResult::success(serde_json::Value::Null), false)
            .unwrap();
        job.finalize().unwrap();
        job.job_id()
    }

    /// Make a job look abandoned by pushing its mtime into the past.
    fn age(path: &Path, secs: u64) {
        let file = OpenOptions::new().append(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn list_filters_and_skips_garbage() {
        let base = scratch_dir("store-list");
        let done = completed(&base, "sync");
        let live = started(&base, "sync");
        let other = completed(&base, "export");

        std::fs::write(base.join("sync").join("notes.txt"), "hello").unwrap();
        std::fs::write(
            base.join("sync").join("20260101T000000000Z_[sync]_[999].running"),
            "start\nnot json\n\n",
        )
        .unwrap();

        let store = JobStore::new(&base);
        let all = store.list(None, None).unwrap();
        let ids: Vec<u64> = all.iter().map(|j| j.job_id).collect();
        assert_eq!(all.len(), 3);
        assert!(ids.contains(&done) && ids.contains(&other));

        let running = store.list(Some("sync"), Some(JobState::Running)).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].job_id, live.job_id());

        let exports = store.list(Some("export"), None).unwrap();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].category, "export");

        drop(live);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn list_is_newest_first() {
        let base = scratch_dir("store-order");
        let older = completed(&base, "sync");
        let newer = completed(&base, "sync");
        let store = JobStore::new(&base);
        let older_path = store.get(older).unwrap().path;
        age(&older_path, 60);

        let ids: Vec<u64> = store.list(None, None).unwrap().iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![newer, older]);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn missing_base_dir_lists_nothing() {
        let store = JobStore::new(std::env::temp_dir().join("indexsync-does-not-exist"));
        assert!(store.list(None, None).unwrap().is_empty());
        assert!(store.find(1).unwrap().is_none());
    }

    #[test]
    fn delete_rules() {
        let base = scratch_dir("store-delete");
        let store = JobStore::new(&base);
        let live = started(&base, "sync");

        let err = store.delete(live.job_id()).unwrap_err();
        assert!(matches!(err, IndexSyncError::InvalidTransition { .. }));
        assert_eq!(err.status_code(), 409);

        let done = completed(&base, "sync");
        store.delete(done).unwrap();
        assert!(store.find(done).unwrap().is_none());

        let err = store.delete(done).unwrap_err();
        assert_eq!(err.status_code(), 404);

        drop(live);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn force_cancel_requires_staleness() {
        let base = scratch_dir("store-force");
        let store = JobStore::new(&base).with_stale_after(Duration::from_secs(30));
        let mut live = started(&base, "sync");
        let id = live.job_id();

        let err = store.force_cancel(id).unwrap_err();
        assert!(matches!(err, IndexSyncError::Conflict(_)));

        age(&live.path(), 120);
        let job = store.force_cancel(id).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        let result = job.result.unwrap();
        assert!(!result.ok);
        assert_eq!(result.error, FORCE_CANCEL_ERROR);

        // Idempotent.
        let again = store.force_cancel(id).unwrap();
        assert_eq!(again.state, JobState::Cancelled);
        assert_eq!(again.events.len(), job.events.len());

        // The dead owner's handle is gone; make sure dropping it does not resurrect anything.
        live.finalize().unwrap_or(());
        drop(live);
        assert_eq!(store.get(id).unwrap().state, JobState::Cancelled);
        let _ = std::fs::remove_dir_all(&base);
    }

    /// Write a job file by hand, as a crashed owner would have left it.
    fn abandoned(base: &Path, id: u64, state: JobState, tail: &str) -> PathBuf {
        let dir = base.join("sync");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("20260101T000000000Z_[sync]_[{id}].{}", state.extension()));
        let start = Event::Start(record::StartRecord {
            at: Utc::now(),
            job_id: id,
            category: "sync".into(),
            action: "sync".into(),
            object_id: None,
            source: serde_json::Value::Null,
        });
        let mut body = start.encode();
        body.push_str(&Event::log("fetching").encode());
        body.push_str(tail);
        std::fs::write(&path, body).unwrap();
        age(&path, 3600);
        path
    }

    #[test]
    fn force_cancel_repairs_a_torn_trailing_event() {
        let base = scratch_dir("store-force-torn");
        let store = JobStore::new(&base).with_stale_after(Duration::from_secs(30));
        abandoned(&base, 7, JobState::Running, "log\n{\"at\":\"2026-");
        assert_eq!(store.get(7).unwrap().logs().count(), 1);

        let job = store.force_cancel(7).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.result.as_ref().unwrap().error, FORCE_CANCEL_ERROR);
        let kinds: Vec<&str> = job.events.iter().map(Event::kind).collect();
        assert_eq!(kinds, vec!["start", "log", "end"]);

        assert_eq!(store.list(None, None).unwrap().len(), 1);
        store.delete(7).unwrap();
        assert!(store.find(7).unwrap().is_none());
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn force_cancel_moves_a_stale_paused_job() {
        let base = scratch_dir("store-force-paused");
        let store = JobStore::new(&base).with_stale_after(Duration::from_secs(30));
        let path = abandoned(&base, 3, JobState::Paused, "");
        control::request(&base.join("sync"), 3, ControlAction::Resume).unwrap();
        assert_eq!(store.get(3).unwrap().state, JobState::Paused);

        let job = store.force_cancel(3).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(!path.exists());
        assert!(job.path.to_string_lossy().ends_with(".cancelled"));
        assert!(control::pending(&base.join("sync"), 3).is_empty());
        match job.events.last() {
            Some(Event::End(end)) => {
                assert!(!end.ok);
                assert_eq!(end.state, JobState::Cancelled);
            }
            other => panic!("unexpected last event {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn force_cancel_rejects_completed() {
        let base = scratch_dir("store-force-completed");
        let store = JobStore::new(&base).with_stale_after(Duration::ZERO);
        let done = completed(&base, "sync");
        let err = store.force_cancel(done).unwrap_err();
        assert!(matches!(err, IndexSyncError::InvalidTransition { .. }));
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn request_control_validates_state() {
        let base = scratch_dir("store-control");
        let store = JobStore::new(&base);
        let live = started(&base, "sync");
        let id = live.job_id();

        let err = store.request_control(id, ControlAction::Resume, false).unwrap_err();
        assert!(matches!(err, IndexSyncError::InvalidTransition { .. }));

        store.request_control(id, ControlAction::Pause, false).unwrap();
        store.request_control(id, ControlAction::Cancel, false).unwrap();
        assert_eq!(
            control::pending(live.dir(), id),
            vec![ControlAction::Pause, ControlAction::Cancel]
        );

        let done = completed(&base, "sync");
        assert!(store.request_control(done, ControlAction::Cancel, false).is_err());
        assert_eq!(
            store.request_control(404, ControlAction::Pause, false).unwrap_err().status_code(),
            404
        );

        drop(live);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn stale_flag() {
        let base = scratch_dir("store-stale");
        let store = JobStore::new(&base).with_stale_after(Duration::from_secs(30));
        let live = started(&base, "sync");
        let job = store.get(live.job_id()).unwrap();
        assert!(!store.is_stale(&job, Utc::now()));
        assert!(store.is_stale(&job, Utc::now() + chrono::Duration::seconds(60)));

        let done = store.get(completed(&base, "sync")).unwrap();
        assert!(!store.is_stale(&done, Utc::now() + chrono::Duration::seconds(60)));

        drop(live);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn follow_streams_until_terminal() {
        let base = scratch_dir("store-follow");
        let mut job = started(&base, "sync");
        job.emit_log("before follow").unwrap();
        let id = job.job_id();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let store = JobStore::new(&base);
        let follower = tokio::spawn(async move {
            store
                .follow(id, Duration::from_millis(5), |event| {
                    sink.lock().unwrap().push(event.kind());
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        job.emit_log("after follow").unwrap();
        job.emit_end(JobResult::success(serde_json::Value::Null), false)
            .unwrap();
        job.finalize().unwrap();

        let finished = follower.await.unwrap().unwrap();
        assert_eq!(finished.state, JobState::Completed);
        assert_eq!(*seen.lock().unwrap(), vec!["start", "log", "log", "end"]);
        let _ = std::fs::remove_dir_all(&base);
    }
}
