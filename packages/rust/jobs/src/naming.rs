//! On-disk naming grammar for job files, control markers and id claims.
//!
//! Job file: `{YYYYMMDDTHHMMSSmmmZ}_[{action}]_[{job-id}]_[{object-id}].{state}`
//! (the object segment is omitted when the job has none).

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

use indexsync_shared::{IndexSyncError, Result};

use crate::state::JobState;

/// UTC start timestamp as it appears in job file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// Directory under the job base dir that holds id claims.
pub const CLAIMS_DIR: &str = ".ids";

const MAX_LABEL_LEN: usize = 120;

static JOB_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<ts>\d{8}T\d{9}Z)_\[(?P<action>[^\[\]/\\]+)\]_\[(?P<id>\d+)\](?:_\[(?P<object>[^\[\]/\\]+)\])?\.(?P<state>[a-z]+)$",
    )
    .expect("valid regex")
});

/// Identity and state of a job as encoded in its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFileName {
    pub started_at: DateTime<Utc>,
    pub action: String,
    pub job_id: u64,
    pub object_id: Option<String>,
    pub state: JobState,
}

impl JobFileName {
    pub fn render(&self) -> String {
        let ts = self.started_at.format(TIMESTAMP_FORMAT);
        match &self.object_id {
            Some(object) => format!(
                "{ts}_[{}]_[{}]_[{object}].{}",
                self.action,
                self.job_id,
                self.state.extension()
            ),
            None => format!(
                "{ts}_[{}]_[{}].{}",
                self.action,
                self.job_id,
                self.state.extension()
            ),
        }
    }

    /// Parse a file name. Returns `None` for anything that is not a job file.
    pub fn parse(name: &str) -> Option<Self> {
        let caps = JOB_FILE_RE.captures(name)?;
        let state = JobState::from_extension(&caps["state"])?;
        let job_id = caps["id"].parse().ok()?;
        let started_at = NaiveDateTime::parse_from_str(&caps["ts"], TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        Some(Self {
            started_at,
            action: caps["action"].to_string(),
            job_id,
            object_id: caps.name("object").map(|m| m.as_str().to_string()),
            state,
        })
    }

    pub fn with_state(&self, state: JobState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

/// Cheap id extraction used by scans that don't need the full parse.
pub fn job_id_of(name: &str) -> Option<u64> {
    JOB_FILE_RE
        .captures(name)
        .and_then(|caps| caps["id"].parse().ok())
}

pub fn claim_file_name(job_id: u64) -> String {
    format!("{job_id}.claim")
}

pub fn claim_id_of(name: &str) -> Option<u64> {
    name.strip_suffix(".claim")?.parse().ok()
}

/// Reject labels that would break the file name grammar or escape the job dir.
pub fn validate_label(what: &str, value: &str) -> Result<()> {
    let bad = value.is_empty()
        || value.len() > MAX_LABEL_LEN
        || value.starts_with('.')
        || value
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '[' | ']') || c.is_control());
    if bad {
        return Err(IndexSyncError::validation(format!("invalid {what} '{value}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(object: Option<&str>) -> JobFileName {
        JobFileName {
            started_at: Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 5).unwrap(),
            action: "sync".into(),
            job_id: 42,
            object_id: object.map(String::from),
            state: JobState::Running,
        }
    }

    #[test]
    fn renders_expected_name() {
        assert_eq!(
            sample(Some("handbook")).render(),
            "20261018T093005000Z_[sync]_[42]_[handbook].running"
        );
        assert_eq!(sample(None).render(), "20261018T093005000Z_[sync]_[42].running");
    }

    #[test]
    fn parse_roundtrip_with_and_without_object() {
        for name in [sample(Some("handbook.v2_x")), sample(None)] {
            let parsed = JobFileName::parse(&name.render()).expect("parse");
            assert_eq!(parsed, name);
        }
    }

    #[test]
    fn state_change_only_touches_extension() {
        let name = sample(Some("handbook"));
        let paused = name.with_state(JobState::Paused).render();
        assert_eq!(paused, "20261018T093005000Z_[sync]_[42]_[handbook].paused");
        assert_eq!(job_id_of(&paused), Some(42));
    }

    #[test]
    fn foreign_files_do_not_parse() {
        assert!(JobFileName::parse("[42].pause_requested").is_none());
        assert!(JobFileName::parse("20261018T093005000Z_[sync]_[42].json").is_none());
        assert!(JobFileName::parse("notes.txt").is_none());
        assert!(job_id_of("42.claim").is_none());
        assert_eq!(claim_id_of("42.claim"), Some(42));
    }

    #[test]
    fn label_validation() {
        assert!(validate_label("action", "sync").is_ok());
        assert!(validate_label("object id", "site-1.v2").is_ok());
        for bad in ["", ".hidden", "a/b", "a]b", "x\ny"] {
            assert!(validate_label("action", bad).is_err(), "{bad:?} accepted");
        }
    }
}
