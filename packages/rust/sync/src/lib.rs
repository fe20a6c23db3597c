//! Change detection between a remote listing and the last recorded state.
//!
//! - [`plan`] partitions entries into added / changed / removed / unchanged
//! - [`ManifestStore`] persists the local and published manifests per source

pub mod manifest;
pub mod planner;

pub use manifest::{ManifestStore, PublishedEntry, PublishedManifest, safe_relative_path};
pub use planner::{PlanMode, SyncPlan, plan};
