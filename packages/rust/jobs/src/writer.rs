//! The single writer of one job's record.
//!
//! A [`JobWriter`] is created at the start of a run and owns the job file
//! until [`JobWriter::finalize`] renames it to its terminal state. `Drop`
//! calls `finalize`, so every exit path (including a panic) closes the
//! record; a job that never reached [`JobWriter::emit_end`] stays in its last
//! running/paused state on disk.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::{debug, info, warn};

use indexsync_shared::{IndexSyncError, JobsConfig, Result};

use crate::control::{self, ControlAction};
use crate::naming::{self, CLAIMS_DIR, JobFileName};
use crate::record::{EndRecord, Event, StartRecord, StateRecord};
use crate::state::JobState;
use crate::store::JobResult;

/// Attempts at claiming a fresh job id before giving up.
pub const MAX_CREATE_ATTEMPTS: usize = 16;

/// Tunables for a writer.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Log events held in memory before an append + flush.
    pub log_buffer: usize,
    /// Sleep between control checks while paused.
    pub poll_interval: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            log_buffer: 20,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&JobsConfig> for WriterOptions {
    fn from(config: &JobsConfig) -> Self {
        Self {
            log_buffer: config.log_buffer,
            poll_interval: config.poll_interval(),
        }
    }
}

/// What a call to [`JobWriter::check_control`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Paused,
    Resumed,
    CancelRequested,
    /// A request that made no sense in the current state (resume while running, ...).
    Ignored(ControlAction),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlOutcome {
    pub events: Vec<ControlEvent>,
    pub cancel_requested: bool,
}

/// Owner of one job file.
#[derive(Debug)]
pub struct JobWriter {
    dir: PathBuf,
    category: String,
    name: JobFileName,
    file: Option<File>,
    buffer: Vec<Event>,
    options: WriterOptions,
    started: bool,
    /// Terminal state chosen by `emit_end`.
    target: Option<JobState>,
    finalized: bool,
}

impl JobWriter {
    /// Allocate a job id and create the job file in state `running`.
    pub fn create(
        base_dir: &Path,
        category: &str,
        action: &str,
        object_id: Option<&str>,
        options: WriterOptions,
    ) -> Result<Self> {
        naming::validate_label("category", category)?;
        naming::validate_label("action", action)?;
        if let Some(object) = object_id {
            naming::validate_label("object id", object)?;
        }

        let dir = base_dir.join(category);
        let claims = base_dir.join(CLAIMS_DIR);
        for d in [&dir, &claims] {
            std::fs::create_dir_all(d).map_err(|e| IndexSyncError::io(d, e))?;
        }

        let started_at = Utc::now();
        let mut candidate = max_job_id(base_dir)? + 1;

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let claim = claims.join(naming::claim_file_name(candidate));
            match OpenOptions::new().write(true).create_new(true).open(&claim) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(candidate, attempt, "job id already claimed, retrying");
                    candidate = (max_job_id(base_dir)? + 1).max(candidate + 1);
                    continue;
                }
                Err(e) => return Err(IndexSyncError::io(&claim, e)),
            }

            let name = JobFileName {
                started_at,
                action: action.to_string(),
                job_id: candidate,
                object_id: object_id.map(String::from),
                state: JobState::Running,
            };
            let path = dir.join(name.render());
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => {
                    info!(job_id = candidate, category, action, "job created");
                    return Ok(Self {
                        dir,
                        category: category.to_string(),
                        name,
                        file: Some(file),
                        buffer: Vec::new(),
                        options,
                        started: false,
                        target: None,
                        finalized: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(candidate, attempt, "job file name collision, retrying");
                    candidate += 1;
                }
                Err(e) => return Err(IndexSyncError::io(&path, e)),
            }
        }

        Err(IndexSyncError::ResourceExhausted(format!(
            "could not allocate a job id after {MAX_CREATE_ATTEMPTS} attempts"
        )))
    }

    pub fn job_id(&self) -> u64 {
        self.name.job_id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn action(&self) -> &str {
        &self.name.action
    }

    pub fn object_id(&self) -> Option<&str> {
        self.name.object_id.as_deref()
    }

    /// State currently encoded on disk.
    pub fn state(&self) -> JobState {
        self.name.state
    }

    /// Directory holding the job file and its control markers.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(self.name.render())
    }

    /// Write the start marker, bypassing the log buffer.
    pub fn emit_start(&mut self, source: serde_json::Value) -> Result<()> {
        self.ensure_writable()?;
        if self.started {
            return Err(IndexSyncError::Conflict(format!(
                "job {} already started",
                self.job_id()
            )));
        }
        let event = Event::Start(StartRecord {
            at: Utc::now(),
            job_id: self.job_id(),
            category: self.category.clone(),
            action: self.name.action.clone(),
            object_id: self.name.object_id.clone(),
            source,
        });
        self.write_now(&event)?;
        self.started = true;
        Ok(())
    }

    /// Queue one log line; flushed once the buffer is full.
    pub fn emit_log(&mut self, message: impl Into<String>) -> Result<()> {
        self.ensure_writable()?;
        if self.target.is_some() {
            return Err(IndexSyncError::Conflict(format!(
                "job {} already ended",
                self.job_id()
            )));
        }
        self.buffer.push(Event::log(message));
        if self.buffer.len() >= self.options.log_buffer.max(1) {
            self.flush()?;
        }
        Ok(())
    }

    /// Append buffered events and flush them to disk.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let text: String = self.buffer.iter().map(Event::encode).collect();
        self.append(text.as_bytes())?;
        self.buffer.clear();
        Ok(())
    }

    /// Cooperative suspension point, called between units of work.
    ///
    /// Cancel wins over everything, including while paused. A pause request
    /// blocks here, polling every `poll_interval`, until a resume or cancel
    /// marker shows up.
    pub async fn check_control(&mut self) -> Result<ControlOutcome> {
        let mut outcome = ControlOutcome::default();
        if self.finalized || self.target.is_some() {
            return Ok(outcome);
        }
        let id = self.job_id();

        if control::take(&self.dir, id, ControlAction::Cancel)? {
            self.note_cancel(&mut outcome)?;
            return Ok(outcome);
        }

        if !control::take(&self.dir, id, ControlAction::Pause)? {
            if control::take(&self.dir, id, ControlAction::Resume)? {
                self.emit_log("resume requested while running, ignored")?;
                outcome.events.push(ControlEvent::Ignored(ControlAction::Resume));
            }
            return Ok(outcome);
        }

        self.emit_log("pause requested")?;
        self.transition(JobState::Paused)?;
        outcome.events.push(ControlEvent::Paused);
        info!(job_id = id, "job paused");

        loop {
            tokio::time::sleep(self.options.poll_interval).await;

            if control::take(&self.dir, id, ControlAction::Cancel)? {
                self.note_cancel(&mut outcome)?;
                break;
            }
            if control::take(&self.dir, id, ControlAction::Resume)? {
                self.transition(JobState::Running)?;
                self.emit_log("resumed")?;
                outcome.events.push(ControlEvent::Resumed);
                info!(job_id = id, "job resumed");
                break;
            }
            if control::take(&self.dir, id, ControlAction::Pause)? {
                outcome.events.push(ControlEvent::Ignored(ControlAction::Pause));
            }
            // Keep the mtime fresh so a live paused job never reads as stale.
            self.touch()?;
        }

        Ok(outcome)
    }

    /// Write the terminal event. The rename happens in [`JobWriter::finalize`].
    pub fn emit_end(&mut self, result: JobResult, cancelled: bool) -> Result<()> {
        self.ensure_writable()?;
        if self.target.is_some() {
            return Err(IndexSyncError::Conflict(format!(
                "job {} already ended",
                self.job_id()
            )));
        }
        let state = if cancelled {
            JobState::Cancelled
        } else {
            JobState::Completed
        };
        self.flush()?;
        self.write_now(&Event::End(EndRecord {
            at: Utc::now(),
            ok: result.ok,
            error: result.error,
            data: result.data,
            state,
        }))?;
        self.target = Some(state);
        Ok(())
    }

    /// Close the file and rename it to the terminal state chosen by `emit_end`.
    ///
    /// Idempotent. Without a prior `emit_end` the file keeps its current
    /// running/paused extension.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        self.flush()?;
        self.file = None;

        let Some(target) = self.target else {
            warn!(
                job_id = self.job_id(),
                state = %self.name.state,
                "job finalized without an end event"
            );
            return Ok(());
        };

        control::clear(&self.dir, self.job_id())?;
        if self.name.state != target {
            self.rename_to(target)?;
        }
        info!(job_id = self.job_id(), state = %target, "job finalized");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_writable(&self) -> Result<()> {
        if self.finalized {
            return Err(IndexSyncError::Conflict(format!(
                "job {} already finalized",
                self.job_id()
            )));
        }
        Ok(())
    }

    fn note_cancel(&mut self, outcome: &mut ControlOutcome) -> Result<()> {
        self.emit_log("cancel requested")?;
        self.flush()?;
        outcome.events.push(ControlEvent::CancelRequested);
        outcome.cancel_requested = true;
        info!(job_id = self.job_id(), "cancel requested");
        Ok(())
    }

    /// running ⇄ paused, with a `state` marker written before the rename.
    fn transition(&mut self, next: JobState) -> Result<()> {
        let current = self.name.state;
        if !current.can_transition_to(next) {
            return Err(IndexSyncError::transition(current, next));
        }
        self.flush()?;
        self.write_now(&Event::State(StateRecord {
            at: Utc::now(),
            state: next,
        }))?;
        self.rename_to(next)
    }

    fn rename_to(&mut self, next: JobState) -> Result<()> {
        let from = self.path();
        let next_name = self.name.with_state(next);
        let to = self.dir.join(next_name.render());

        // Close before renaming; reopened lazily on the next write.
        self.file = None;
        std::fs::rename(&from, &to).map_err(|e| IndexSyncError::io(&from, e))?;
        sync_dir(&self.dir);
        debug!(job_id = self.job_id(), from = %self.name.state, to = %next, "job file renamed");
        self.name = next_name;
        Ok(())
    }

    fn write_now(&mut self, event: &Event) -> Result<()> {
        self.append(event.encode().as_bytes())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let path = self.path();
        let file = self.handle()?;
        file.write_all(bytes)
            .and_then(|_| file.sync_data())
            .map_err(|e| IndexSyncError::io(&path, e))
    }

    fn touch(&mut self) -> Result<()> {
        let path = self.path();
        self.handle()?
            .set_modified(SystemTime::now())
            .map_err(|e| IndexSyncError::io(&path, e))
    }

    fn handle(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let path = self.path();
                OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(|e| IndexSyncError::io(&path, e))?
            }
        };
        Ok(self.file.insert(file))
    }
}

impl Drop for JobWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!(job_id = self.job_id(), error = %e, "failed to finalize job");
        }
    }
}

/// Highest job id seen in any category directory or id claim.
fn max_job_id(base_dir: &Path) -> Result<u64> {
    let mut max = 0;
    let entries = match std::fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(IndexSyncError::io(base_dir, e)),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let is_claims = entry.file_name() == CLAIMS_DIR;
        let Ok(files) = std::fs::read_dir(&path) else {
            continue;
        };
        for file in files.flatten() {
            let name = file.file_name();
            let Some(name) = name.to_str() else { continue };
            let id = if is_claims {
                naming::claim_id_of(name)
            } else {
                naming::job_id_of(name)
            };
            if let Some(id) = id {
                max = max.max(id);
            }
        }
    }
    Ok(max)
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}
