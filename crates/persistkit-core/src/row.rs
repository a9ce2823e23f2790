//! Rows exchanged with a backend.

use crate::association::Link;
use crate::value::{Key, Value};
use std::collections::BTreeMap;

/// An association as stored in a row: the target type plus its link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLink {
    /// Entity type on the other side.
    pub target_type: &'static str,
    /// Target identities.
    pub link: Link,
}

impl RowLink {
    /// Create a row link.
    #[must_use]
    pub fn new(target_type: &'static str, link: Link) -> Self {
        Self { target_type, link }
    }
}

/// A stored row, as returned by a backend load.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Primary key.
    pub key: Key,
    /// Stored version stamp.
    pub version: u64,
    /// Scalar fields.
    pub fields: BTreeMap<String, Value>,
    /// Associations by name.
    pub links: BTreeMap<String, RowLink>,
}

impl Row {
    /// Create a row with no fields or links.
    #[must_use]
    pub fn new(key: Key, version: u64) -> Self {
        Self {
            key,
            version,
            fields: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }

    /// Add a field (builder pattern).
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Add a link (builder pattern).
    #[must_use]
    pub fn with_link(mut self, name: impl Into<String>, link: RowLink) -> Self {
        self.links.insert(name.into(), link);
        self
    }
}

/// A row to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRow {
    /// Identity allocated for the row.
    pub key: Key,
    /// Initial version stamp.
    pub version: u64,
    /// Scalar fields.
    pub fields: BTreeMap<String, Value>,
    /// Associations by name.
    pub links: BTreeMap<String, RowLink>,
}

/// Result of a version-checked update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The stored version matched; the row now carries this version.
    Applied(u64),
    /// The stored version differed (`None`: the row is gone). Nothing was written.
    Conflict { current_version: Option<u64> },
}

impl UpdateOutcome {
    /// True if the write was applied.
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}
