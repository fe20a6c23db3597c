//! Partition remote and local manifests into a sync plan.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use indexsync_shared::ManifestEntry;

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// How fingerprints are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanMode {
    /// Compare fingerprints; matching entries are skipped.
    #[default]
    Incremental,
    /// Ignore the local side for remote entries: everything remote is added.
    /// Local entries missing remotely are still reported removed.
    Full,
    /// Every entry present on both sides is changed, regardless of fingerprint.
    Force,
}

/// Four disjoint sets covering the union of remote and local ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    /// Remote entries with no local counterpart.
    pub added: Vec<ManifestEntry>,
    /// Remote entries whose fingerprint differs from the local one.
    pub changed: Vec<ManifestEntry>,
    /// Local entries no longer present remotely.
    pub removed: Vec<ManifestEntry>,
    /// Remote entries identical to the local ones.
    pub unchanged: Vec<ManifestEntry>,
}

impl SyncPlan {
    /// Nothing to fetch, publish or delete.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Added then changed entries, in plan order.
    pub fn to_apply(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.added.iter().chain(self.changed.iter())
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len() + self.unchanged.len()
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Compute the plan that brings `local` in line with `remote`.
///
/// Output follows remote order (removed entries follow local order). When
/// the remote listing repeats an id, the last occurrence wins. An entry
/// without a usable timestamp on either side is always changed.
pub fn plan(remote: &[ManifestEntry], local: &[ManifestEntry], mode: PlanMode) -> SyncPlan {
    let local_by_id: HashMap<&str, &ManifestEntry> =
        local.iter().map(|e| (e.id.as_str(), e)).collect();

    let last_index: HashMap<&str, usize> = remote
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.as_str(), i))
        .collect();

    let mut out = SyncPlan::default();
    let mut remote_ids: HashSet<&str> = HashSet::with_capacity(last_index.len());

    for (i, entry) in remote.iter().enumerate() {
        if last_index.get(entry.id.as_str()) != Some(&i) {
            continue;
        }
        remote_ids.insert(entry.id.as_str());

        if mode == PlanMode::Full {
            out.added.push(entry.clone());
            continue;
        }

        match local_by_id.get(entry.id.as_str()) {
            None => out.added.push(entry.clone()),
            Some(old) if mode == PlanMode::Incremental && old.fingerprint.matches(&entry.fingerprint) => {
                out.unchanged.push(entry.clone());
            }
            Some(_) => out.changed.push(entry.clone()),
        }
    }

    let mut seen_local: HashSet<&str> = HashSet::new();
    for entry in local {
        if !remote_ids.contains(entry.id.as_str()) && seen_local.insert(entry.id.as_str()) {
            out.removed.push(entry.clone());
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
