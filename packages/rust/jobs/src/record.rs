//! Text codec for the append-only job event stream.
//!
//! ```text
//! start
//! {"at":"2026-10-18T09:30:00Z","job_id":7,...}
//!
//! log
//! {"at":"2026-10-18T09:30:01Z","message":"listing remote items"}
//!
//! ```
//!
//! Each event is a kind line, one or more payload lines holding a JSON object,
//! and a terminating blank line. Anything after the last blank line is an
//! event still being written and is left for the next read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use indexsync_shared::{IndexSyncError, Result};

use crate::state::JobState;

const TERMINATOR: &[u8] = b"\n\n";

/// Payload of the `start` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRecord {
    pub at: DateTime<Utc>,
    pub job_id: u64,
    pub category: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// What triggered the job, kept for audit.
    #[serde(default)]
    pub source: serde_json::Value,
}

/// Payload of a `log` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Payload of a `state` event (pause/resume markers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub at: DateTime<Utc>,
    pub state: JobState,
}

/// Payload of the `end` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndRecord {
    pub at: DateTime<Utc>,
    pub ok: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Terminal state the job was heading to when this was written.
    pub state: JobState,
}

/// One entry of a job's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Start(StartRecord),
    Log(LogRecord),
    State(StateRecord),
    End(EndRecord),
}

impl Event {
    pub fn log(message: impl Into<String>) -> Self {
        Event::Log(LogRecord {
            at: Utc::now(),
            message: message.into(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Start(_) => "start",
            Event::Log(_) => "log",
            Event::State(_) => "state",
            Event::End(_) => "end",
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Event::Start(r) => r.at,
            Event::Log(r) => r.at,
            Event::State(r) => r.at,
            Event::End(r) => r.at,
        }
    }

    /// Encode as `kind\npayload\n\n`.
    pub fn encode(&self) -> String {
        let payload = match self {
            Event::Start(r) => serde_json::to_string(r),
            Event::Log(r) => serde_json::to_string(r),
            Event::State(r) => serde_json::to_string(r),
            Event::End(r) => serde_json::to_string(r),
        }
        // Plain structs with string keys always serialize.
        .unwrap_or_else(|_| "{}".to_string());
        format!("{}\n{payload}\n\n", self.kind())
    }

    /// Single-line rendering for terminals and monitors.
    pub fn summary(&self) -> String {
        let at = self.at().format("%Y-%m-%d %H:%M:%S");
        match self {
            Event::Start(r) => format!("{at} start  {} #{}", r.action, r.job_id),
            Event::Log(r) => format!("{at} log    {}", r.message),
            Event::State(r) => format!("{at} state  {}", r.state),
            Event::End(r) if r.ok => format!("{at} end    {} ok", r.state),
            Event::End(r) => format!("{at} end    {} error: {}", r.state, r.error),
        }
    }
}

/// Decode every complete event in `buf`.
///
/// Returns the events and the number of bytes they span, so a follower can
/// resume at that offset once more data has been appended.
pub fn decode_complete(buf: &[u8]) -> Result<(Vec<Event>, usize)> {
    let mut events = Vec::new();
    let mut pos = 0;

    while let Some(rel) = find(&buf[pos..], TERMINATOR) {
        let block = &buf[pos..pos + rel];
        pos += rel + TERMINATOR.len();

        let text = std::str::from_utf8(block)
            .map_err(|e| IndexSyncError::parse(format!("event is not UTF-8: {e}")))?;
        let text = text.trim_matches('\n');
        if text.is_empty() {
            continue;
        }
        events.push(decode_block(text)?);
    }

    Ok((events, pos))
}

fn decode_block(text: &str) -> Result<Event> {
    let (kind, payload) = text
        .split_once('\n')
        .ok_or_else(|| IndexSyncError::parse(format!("event '{text}' has no payload")))?;

    let bad = |e: serde_json::Error| IndexSyncError::parse(format!("bad {kind} payload: {e}"));
    let event = match kind.trim() {
        "start" => Event::Start(serde_json::from_str(payload).map_err(bad)?),
        "log" => Event::Log(serde_json::from_str(payload).map_err(bad)?),
        "state" => Event::State(serde_json::from_str(payload).map_err(bad)?),
        "end" => Event::End(serde_json::from_str(payload).map_err(bad)?),
        other => {
            return Err(IndexSyncError::parse(format!("unknown event kind '{other}'")));
        }
    };
    Ok(event)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
