//! Filesystem-backed job records: lifecycle, control, and discovery.
//!
//! Every job is exactly one file under `{base}/{category}/`. The file name
//! carries the job's identity and its extension carries the current
//! [`JobState`]; state transitions are atomic renames. Nothing else (no
//! database, no daemon) coordinates writers and observers.
//!
//! - [`JobWriter`]: sole writer of one job's file
//! - [`JobStore`]: list/find/delete/force-cancel/follow from the observer side
//! - [`control`]: pause/resume/cancel marker files

pub mod control;
pub mod naming;
pub mod record;
pub mod state;
pub mod store;
pub mod writer;

pub use control::ControlAction;
pub use record::{EndRecord, Event, LogRecord, StartRecord, StateRecord};
pub use state::JobState;
pub use store::{DEFAULT_STALE_AFTER, FORCE_CANCEL_ERROR, Job, JobResult, JobStore};
pub use writer::{ControlEvent, ControlOutcome, JobWriter, MAX_CREATE_ATTEMPTS, WriterOptions};
