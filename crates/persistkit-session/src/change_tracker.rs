//! Change tracking and dirty detection for sessions.
//!
//! Snapshot-based: the scalar fields of every managed entity are captured
//! when it is loaded, refreshed or committed, and compared against the
//! current fields at commit time. Rollback restores fields from the same
//! snapshots.
//!
//! JSON cannot represent every `Value` (non-finite doubles encode as `null`),
//! so the encoded bytes only prove a change; equal bytes fall back to a
//! field-by-field [`Value::same_as`] comparison against the captured map.

use crate::ObjectKey;
use persistkit_core::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Snapshot of an entity's fields at a point in time.
#[derive(Debug)]
pub struct ObjectSnapshot {
    /// Serialized field map (JSON bytes).
    data: Vec<u8>,
    fields: BTreeMap<String, Value>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    /// Capture a field map.
    pub fn new(fields: &BTreeMap<String, Value>) -> Self {
        Self {
            data: encode(fields),
            fields: fields.clone(),
            taken_at: Instant::now(),
        }
    }

    /// Get the snapshot data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The captured fields.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Get the timestamp when the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    fn differs_from(&self, fields: &BTreeMap<String, Value>) -> bool {
        if encode(fields) != self.data {
            return true;
        }
        self.fields.len() != fields.len()
            || self
                .fields
                .iter()
                .any(|(name, value)| fields.get(name).is_none_or(|v| !v.same_as(value)))
    }
}

/// Tracks changes to entities in the session.
#[derive(Default)]
pub struct ChangeTracker {
    snapshots: HashMap<ObjectKey, ObjectSnapshot>,
}

fn encode(fields: &BTreeMap<String, Value>) -> Vec<u8> {
    serde_json::to_vec(fields).unwrap_or_default()
}

impl ChangeTracker {
    /// Create a new empty change tracker.
    pub fn new() -> Self {
        Self {
            snapshots: HashMap::new(),
        }
    }

    /// Take (or retake) a snapshot of an entity's fields.
    #[tracing::instrument(level = "trace", skip(self, fields))]
    pub fn snapshot(&mut self, key: ObjectKey, fields: &BTreeMap<String, Value>) {
        let snapshot = ObjectSnapshot::new(fields);
        tracing::trace!(snapshot_bytes = snapshot.data.len(), "Taking entity snapshot");
        self.snapshots.insert(key, snapshot);
    }

    /// Check if an entity has a snapshot.
    #[must_use]
    pub fn has_snapshot(&self, key: &ObjectKey) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Get the snapshot for an entity.
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<&ObjectSnapshot> {
        self.snapshots.get(key)
    }

    /// Check if an entity's fields differ from its snapshot.
    ///
    /// An entity without a snapshot is treated as dirty.
    #[must_use]
    pub fn is_dirty(&self, key: &ObjectKey, fields: &BTreeMap<String, Value>) -> bool {
        let Some(snapshot) = self.snapshots.get(key) else {
            tracing::trace!(%key, "No snapshot - treating as dirty");
            return true;
        };
        let dirty = snapshot.differs_from(fields);
        tracing::trace!(%key, dirty, "Dirty check result");
        dirty
    }

    /// Names of the fields that differ from the snapshot, in name order.
    ///
    /// Fields removed since the snapshot are reported too. Without a snapshot
    /// every current field counts as changed.
    #[must_use]
    pub fn changed_fields(&self, key: &ObjectKey, fields: &BTreeMap<String, Value>) -> Vec<String> {
        let Some(snapshot) = self.snapshots.get(key) else {
            return fields.keys().cloned().collect();
        };
        if !snapshot.differs_from(fields) {
            return Vec::new();
        }

        let original = &snapshot.fields;
        let mut changed: Vec<String> = fields
            .iter()
            .filter(|(name, value)| original.get(*name).is_none_or(|o| !o.same_as(value)))
            .map(|(name, _)| name.clone())
            .collect();
        changed.extend(
            original
                .keys()
                .filter(|name| !fields.contains_key(*name))
                .cloned(),
        );
        changed.sort();
        tracing::debug!(%key, changed_count = changed.len(), "Computed changed fields");
        changed
    }

    /// The fields as they were when the snapshot was taken.
    #[must_use]
    pub fn original_fields(&self, key: &ObjectKey) -> Option<BTreeMap<String, Value>> {
        self.snapshots.get(key).map(|snapshot| snapshot.fields.clone())
    }

    /// Drop the snapshot of one entity.
    pub fn forget(&mut self, key: &ObjectKey) {
        self.snapshots.remove(key);
    }

    /// Drop all snapshots.
    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    /// Number of snapshots held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Check if no snapshots are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistkit_core::Key;

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_clean_after_snapshot() {
        let mut tracker = ChangeTracker::new();
        let key = ObjectKey::new("author", Key(1));
        let current = fields(&[("name", Value::from("Thorben")), ("age", Value::from(40))]);
        tracker.snapshot(key, &current);

        assert!(!tracker.is_dirty(&key, &current));
        assert!(tracker.changed_fields(&key, &current).is_empty());
        assert!(tracker.has_snapshot(&key));
    }

    #[test]
    fn test_changed_fields_detects_modification() {
        let mut tracker = ChangeTracker::new();
        let key = ObjectKey::new("author", Key(1));
        tracker.snapshot(
            key,
            &fields(&[("name", Value::from("Thorben")), ("age", Value::from(40))]),
        );

        let current = fields(&[("name", Value::from("Changed")), ("age", Value::from(40))]);
        assert!(tracker.is_dirty(&key, &current));
        assert_eq!(tracker.changed_fields(&key, &current), vec!["name".to_string()]);
    }

    #[test]
    fn test_added_and_removed_fields_are_changes() {
        let mut tracker = ChangeTracker::new();
        let key = ObjectKey::new("author", Key(1));
        tracker.snapshot(key, &fields(&[("name", Value::from("A"))]));

        let current = fields(&[("bio", Value::from("..."))]);
        assert_eq!(
            tracker.changed_fields(&key, &current),
            vec!["bio".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn test_no_snapshot_is_dirty() {
        let tracker = ChangeTracker::new();
        let key = ObjectKey::new("author", Key(1));
        let current = fields(&[("name", Value::from("A"))]);
        assert!(tracker.is_dirty(&key, &current));
        assert_eq!(tracker.changed_fields(&key, &current), vec!["name".to_string()]);
    }

    #[test]
    fn test_original_fields_restores_snapshot() {
        let mut tracker = ChangeTracker::new();
        let key = ObjectKey::new("author", Key(1));
        let original = fields(&[
            ("name", Value::from("Thorben")),
            ("bio", Value::Null),
            ("score", Value::from(4.5)),
        ]);
        tracker.snapshot(key, &original);
        assert_eq!(tracker.original_fields(&key), Some(original));
    }

    #[test]
    fn test_non_finite_doubles_are_clean_and_restorable() {
        let mut tracker = ChangeTracker::new();
        let key = ObjectKey::new("author", Key(1));
        let original = fields(&[
            ("name", Value::from("Thorben")),
            ("score", Value::Double(f64::NAN)),
            ("limit", Value::Double(f64::INFINITY)),
        ]);
        tracker.snapshot(key, &original);

        assert!(!tracker.is_dirty(&key, &original));
        assert!(tracker.changed_fields(&key, &original).is_empty());

        let restored = tracker.original_fields(&key).unwrap();
        assert!(restored["score"].same_as(&Value::Double(f64::NAN)));
        assert_eq!(restored["limit"], Value::Double(f64::INFINITY));
    }

    #[test]
    fn test_nan_replaced_by_null_is_a_change() {
        let mut tracker = ChangeTracker::new();
        let key = ObjectKey::new("author", Key(1));
        tracker.snapshot(key, &fields(&[("score", Value::Double(f64::NAN))]));

        // Both encode as JSON null.
        let current = fields(&[("score", Value::Null)]);
        assert!(tracker.is_dirty(&key, &current));
        assert_eq!(tracker.changed_fields(&key, &current), vec!["score".to_string()]);
    }

    #[test]
    fn test_forget_and_clear() {
        let mut tracker = ChangeTracker::new();
        let a = ObjectKey::new("author", Key(1));
        let b = ObjectKey::new("author", Key(2));
        tracker.snapshot(a, &BTreeMap::new());
        tracker.snapshot(b, &BTreeMap::new());
        assert_eq!(tracker.len(), 2);

        tracker.forget(&a);
        assert!(tracker.get(&a).is_none());
        tracker.clear();
        assert!(tracker.is_empty());
    }
}
