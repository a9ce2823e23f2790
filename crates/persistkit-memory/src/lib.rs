//! In-memory reference backend for persistkit.
//!
//! `persistkit-memory` stores rows in process memory and implements the full
//! [`Backend`](persistkit_core::Backend) contract, including per-row
//! conditional writes and commit-time revalidation. It is meant for tests and
//! examples, not for data that must survive the process.
//!
//! - [`MemoryStore`] is the shared storage and the [`BackendSource`].
//! - [`MemoryConnection`] is one session's view: it buffers a transaction's
//!   writes until commit.
//!
//! Outages can be simulated with [`MemoryStore::set_available`]; every
//! operation then fails with `BackendUnavailable`.
//!
//! # Example
//!
//! ```
//! use persistkit_core::{Key, Link, Row, RowLink};
//! use persistkit_memory::MemoryStore;
//!
//! let store = MemoryStore::new();
//! store.seed("book", Row::new(Key(10), 0).with_field("title", "Hibernate Tips"));
//! store.seed(
//!     "author",
//!     Row::new(Key(1), 0)
//!         .with_field("name", "Thorben")
//!         .with_link("books", RowLink::new("book", Link::Many(vec![Key(10)]))),
//! );
//! assert_eq!(store.row("author", Key(1)).unwrap().version, 0);
//! ```

pub mod connection;

pub use connection::MemoryConnection;

use persistkit_core::{
    BackendErrorKind, BackendSource, Error, Key, Result, Row, RowLink, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A row as kept in storage.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredRow {
    pub(crate) version: u64,
    pub(crate) fields: BTreeMap<String, Value>,
    pub(crate) links: BTreeMap<String, RowLink>,
}

impl StoredRow {
    pub(crate) fn to_row(&self, key: Key) -> Row {
        Row {
            key,
            version: self.version,
            fields: self.fields.clone(),
            links: self.links.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) rows: HashMap<&'static str, BTreeMap<Key, StoredRow>>,
    /// Highest key handed out or stored, per entity type.
    pub(crate) sequences: HashMap<&'static str, u64>,
}

impl Tables {
    pub(crate) fn get(&self, entity_type: &'static str, key: Key) -> Option<&StoredRow> {
        self.rows.get(entity_type)?.get(&key)
    }

    pub(crate) fn put(&mut self, entity_type: &'static str, key: Key, row: StoredRow) {
        self.rows.entry(entity_type).or_default().insert(key, row);
        let seq = self.sequences.entry(entity_type).or_insert(0);
        *seq = (*seq).max(key.get());
    }

    pub(crate) fn next_key(&mut self, entity_type: &'static str) -> Key {
        let seq = self.sequences.entry(entity_type).or_insert(0);
        *seq += 1;
        Key(*seq)
    }
}

/// Operation counters, for asserting how often storage was touched.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) row_loads: AtomicU64,
    pub(crate) association_loads: AtomicU64,
    pub(crate) commits: AtomicU64,
}

/// Snapshot of a store's operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// `load_row` calls served.
    pub row_loads: u64,
    /// `load_association` calls served.
    pub association_loads: u64,
    /// Transactions committed.
    pub commits: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StoreInner {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    pub(crate) counters: Counters,
}

impl StoreInner {
    pub(crate) fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            tracing::debug!("Memory store request refused: unavailable");
            Err(Error::backend(
                BackendErrorKind::Unavailable,
                "memory store is unavailable",
            ))
        } else {
            Ok(())
        }
    }
}

/// Shared in-memory storage.
///
/// Cloning a `MemoryStore` yields another handle to the same storage, so a
/// test can keep one handle for seeding and inspection while a session
/// factory owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a row directly, bypassing transactions and version checks.
    ///
    /// Replaces any row with the same key. Later allocated keys never collide
    /// with seeded ones.
    pub fn seed(&self, entity_type: &'static str, row: Row) {
        let key = row.key;
        tracing::trace!(entity_type, key = %key, version = row.version, "Seeding row");
        self.inner.tables().put(
            entity_type,
            key,
            StoredRow {
                version: row.version,
                fields: row.fields,
                links: row.links,
            },
        );
    }

    /// Read a committed row, bypassing availability checks.
    #[must_use]
    pub fn row(&self, entity_type: &'static str, key: Key) -> Option<Row> {
        self.inner
            .tables()
            .get(entity_type, key)
            .map(|stored| stored.to_row(key))
    }

    /// Number of committed rows of one type.
    #[must_use]
    pub fn count(&self, entity_type: &'static str) -> usize {
        self.inner
            .tables()
            .rows
            .get(entity_type)
            .map_or(0, BTreeMap::len)
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        tracing::debug!(available, "Memory store availability changed");
        self.inner.unavailable.store(!available, Ordering::Release);
    }

    /// Whether the store currently accepts requests.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.inner.unavailable.load(Ordering::Acquire)
    }

    /// Current operation counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let c = &self.inner.counters;
        MemoryStats {
            row_loads: c.row_loads.load(Ordering::Relaxed),
            association_loads: c.association_loads.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
        }
    }
}

impl BackendSource for MemoryStore {
    type Backend = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection> {
        self.inner.check_available()?;
        Ok(MemoryConnection::new(Arc::clone(&self.inner)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistkit_core::Link;

    #[test]
    fn test_seed_and_read() {
        let store = MemoryStore::new();
        store.seed(
            "author",
            Row::new(Key(1), 0)
                .with_field("name", "Thorben")
                .with_link("books", RowLink::new("book", Link::Many(vec![Key(10)]))),
        );

        let row = store.row("author", Key(1)).unwrap();
        assert_eq!(row.version, 0);
        assert_eq!(row.fields["name"], Value::from("Thorben"));
        assert_eq!(row.links["books"].link, Link::Many(vec![Key(10)]));
        assert_eq!(store.count("author"), 1);
        assert_eq!(store.count("book"), 0);
        assert!(store.row("author", Key(2)).is_none());
    }

    #[test]
    fn test_clones_share_storage() {
        let store = MemoryStore::new();
        let other = store.clone();
        other.seed("author", Row::new(Key(1), 0));
        assert!(store.row("author", Key(1)).is_some());
    }

    #[test]
    fn test_sequences_skip_seeded_keys() {
        let store = MemoryStore::new();
        store.seed("author", Row::new(Key(5), 0));
        let mut tables = store.inner.tables();
        assert_eq!(tables.next_key("author"), Key(6));
        assert_eq!(tables.next_key("book"), Key(1));
    }

    #[test]
    fn test_connect_when_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(!store.is_available());
        let err = store.connect().err().unwrap();
        assert!(matches!(err, Error::BackendUnavailable(_)));

        store.set_available(true);
        assert!(store.connect().is_ok());
    }
}
