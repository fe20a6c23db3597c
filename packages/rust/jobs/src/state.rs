//! Job lifecycle states and the transitions allowed between them.

use serde::{Deserialize, Serialize};

use indexsync_shared::IndexSyncError;

/// Job state. Encoded on disk as the job file's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Running,
        JobState::Paused,
        JobState::Completed,
        JobState::Cancelled,
    ];

    /// File extension for this state.
    pub fn extension(self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.extension() == ext)
    }

    /// Completed and cancelled are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// running ⇄ paused → {completed | cancelled}
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Paused, Completed)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for JobState {
    type Err = IndexSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(&s.to_ascii_lowercase())
            .ok_or_else(|| IndexSyncError::validation(format!("unknown job state '{s}'")))
    }
}
