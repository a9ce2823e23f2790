//! Optimistic concurrency: per-entity version stamps.
//!
//! The tracker remembers the version each entity had when the session read
//! it. At commit every dirty entity is written with
//! [`Backend::conditional_update`] against that version; the bumped version is
//! only *staged* until the backend transaction commits, then [`settle`]d.
//! An aborted commit calls [`discard_staged`] so the next attempt is checked
//! against the same versions again.
//!
//! [`settle`]: VersionTracker::settle
//! [`discard_staged`]: VersionTracker::discard_staged

use crate::ObjectKey;
use persistkit_core::{Backend, ConflictInfo, Cx, Error, Outcome, UpdateOutcome, Value};
use std::collections::{BTreeMap, HashMap};

/// Result of one version-checked write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// Stored version matched; this is the version the row will carry.
    Bumped(u64),
    /// Stored version differed. Nothing was written.
    Conflict(ConflictInfo),
}

/// Version stamps of the entities managed by one session.
#[derive(Debug, Default)]
pub struct VersionTracker {
    loaded: HashMap<ObjectKey, u64>,
    staged: HashMap<ObjectKey, u64>,
}

impl VersionTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the version an entity was read (or last written) at.
    pub fn record_load(&mut self, key: ObjectKey, version: u64) {
        self.loaded.insert(key, version);
        self.staged.remove(&key);
    }

    /// Version the next write of this entity is checked against.
    #[must_use]
    pub fn expected(&self, key: &ObjectKey) -> Option<u64> {
        self.loaded.get(key).copied()
    }

    /// Stage the version a pending write will produce.
    pub fn stage(&mut self, key: ObjectKey, version: u64) {
        self.staged.insert(key, version);
    }

    /// Staged version of an entity, if a write is pending.
    #[must_use]
    pub fn staged(&self, key: &ObjectKey) -> Option<u64> {
        self.staged.get(key).copied()
    }

    /// Apply every staged version after a successful commit.
    ///
    /// Returns the applied `(identity, version)` pairs so the caller can
    /// update the live instances.
    pub fn settle(&mut self) -> Vec<(ObjectKey, u64)> {
        let settled: Vec<(ObjectKey, u64)> = self.staged.drain().collect();
        for (key, version) in &settled {
            self.loaded.insert(*key, *version);
        }
        tracing::trace!(count = settled.len(), "Settled staged versions");
        settled
    }

    /// Drop staged versions after an aborted commit.
    pub fn discard_staged(&mut self) {
        if !self.staged.is_empty() {
            tracing::trace!(count = self.staged.len(), "Discarding staged versions");
        }
        self.staged.clear();
    }

    /// Stop tracking an entity.
    pub fn forget(&mut self, key: &ObjectKey) {
        self.loaded.remove(key);
        self.staged.remove(key);
    }

    /// Stop tracking everything.
    pub fn clear(&mut self) {
        self.loaded.clear();
        self.staged.clear();
    }

    /// Number of tracked entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    /// Check if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

/// Write one dirty entity with a version check.
///
/// Issues `conditional_update(expected, fields)` and maps the backend's answer
/// to a [`VersionCheck`]. The caller stages a `Bumped` version; nothing is
/// staged here because the tracker may be shared with association loads that
/// run while the backend call is pending.
#[tracing::instrument(level = "debug", skip(cx, backend, fields))]
pub async fn check_and_bump<B: Backend>(
    cx: &Cx,
    backend: &B,
    key: ObjectKey,
    expected: u64,
    fields: BTreeMap<String, Value>,
) -> Outcome<VersionCheck, Error> {
    let outcome = match backend
        .conditional_update(cx, key.entity_type(), key.key(), expected, fields)
        .await
    {
        Outcome::Ok(outcome) => outcome,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    match outcome {
        UpdateOutcome::Applied(version) => {
            tracing::debug!(version, "Version check passed");
            Outcome::Ok(VersionCheck::Bumped(version))
        }
        UpdateOutcome::Conflict { current_version } => {
            tracing::warn!(
                entity_type = key.entity_type(),
                key = %key.key(),
                expected,
                actual = ?current_version,
                "Optimistic lock conflict"
            );
            Outcome::Ok(VersionCheck::Conflict(ConflictInfo {
                entity_type: key.entity_type(),
                key: key.key(),
                expected_version: expected,
                actual_version: current_version,
            }))
        }
    }
}
