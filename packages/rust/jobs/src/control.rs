//! File-based control channel between operators and running jobs.
//!
//! Creating `[{job-id}].{action}_requested` next to the job file sends the
//! request. The owning [`JobWriter`](crate::JobWriter) consumes it by deleting
//! the marker; a successful `remove_file` is what makes consumption
//! at-most-once. Creating a marker that already exists is a no-op, so
//! duplicate unconsumed requests collapse into one.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use indexsync_shared::{IndexSyncError, Result};

/// Operator request addressed to a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

impl ControlAction {
    pub const ALL: [ControlAction; 3] = [
        ControlAction::Pause,
        ControlAction::Resume,
        ControlAction::Cancel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ControlAction {
    type Err = IndexSyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| IndexSyncError::validation(format!("invalid control action '{s}'")))
    }
}

pub fn marker_name(job_id: u64, action: ControlAction) -> String {
    format!("[{job_id}].{action}_requested")
}

pub fn marker_path(dir: &Path, job_id: u64, action: ControlAction) -> PathBuf {
    dir.join(marker_name(job_id, action))
}

/// Send `action` to job `job_id` whose file lives in `dir`.
pub fn request(dir: &Path, job_id: u64, action: ControlAction) -> Result<PathBuf> {
    let path = marker_path(dir, job_id, action);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| IndexSyncError::io(&path, e))?;
    debug!(job_id, %action, "control marker written");
    Ok(path)
}

/// Consume a pending request. Returns `true` only for the caller that removed it.
pub fn take(dir: &Path, job_id: u64, action: ControlAction) -> Result<bool> {
    let path = marker_path(dir, job_id, action);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(IndexSyncError::io(&path, e)),
    }
}

pub fn is_pending(dir: &Path, job_id: u64, action: ControlAction) -> bool {
    marker_path(dir, job_id, action).exists()
}

/// All unconsumed requests for a job.
pub fn pending(dir: &Path, job_id: u64) -> Vec<ControlAction> {
    ControlAction::ALL
        .into_iter()
        .filter(|a| is_pending(dir, job_id, *a))
        .collect()
}

/// Drop every marker for a job. Returns how many were removed.
pub fn clear(dir: &Path, job_id: u64) -> Result<usize> {
    let mut removed = 0;
    for action in ControlAction::ALL {
        if take(dir, job_id, action)? {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;

    #[test]
    fn marker_naming() {
        assert_eq!(marker_name(12, ControlAction::Cancel), "[12].cancel_requested");
    }

    #[test]
    fn take_is_at_most_once() {
        let dir = scratch_dir("control-take");
        request(&dir, 5, ControlAction::Pause).unwrap();
        assert!(take(&dir, 5, ControlAction::Pause).unwrap());
        assert!(!take(&dir, 5, ControlAction::Pause).unwrap());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn duplicate_requests_collapse() {
        let dir = scratch_dir("control-dup");
        request(&dir, 5, ControlAction::Cancel).unwrap();
        request(&dir, 5, ControlAction::Cancel).unwrap();
        assert_eq!(pending(&dir, 5), vec![ControlAction::Cancel]);
        assert!(take(&dir, 5, ControlAction::Cancel).unwrap());
        assert!(pending(&dir, 5).is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clear_only_touches_one_job() {
        let dir = scratch_dir("control-clear");
        request(&dir, 1, ControlAction::Pause).unwrap();
        request(&dir, 1, ControlAction::Resume).unwrap();
        request(&dir, 2, ControlAction::Cancel).unwrap();
        assert_eq!(clear(&dir, 1).unwrap(), 2);
        assert_eq!(pending(&dir, 2), vec![ControlAction::Cancel]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn parse_action() {
        assert_eq!("RESUME".parse::<ControlAction>().unwrap(), ControlAction::Resume);
        assert!("stop".parse::<ControlAction>().is_err());
    }
}
