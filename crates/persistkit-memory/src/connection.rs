//! One session's connection to a [`MemoryStore`](crate::MemoryStore).
//!
//! All work happens synchronously under the store's mutex; the async trait
//! methods only wrap the result. Inside a transaction, inserts and
//! conditional updates are buffered and revalidated against committed state
//! when the transaction commits.

use crate::{StoreInner, StoredRow, Tables};
use persistkit_core::{
    Backend, ConflictInfo, Cx, Error, Key, NewRow, Outcome, Result, Row, UpdateOutcome, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
struct StagedUpdate {
    entity_type: &'static str,
    key: Key,
    expected_version: u64,
    new_version: u64,
    fields: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct Transaction {
    inserts: Vec<(&'static str, NewRow)>,
    updates: Vec<StagedUpdate>,
}

impl Transaction {
    /// Version this transaction would leave on a row, if it wrote it.
    fn staged_version(&self, entity_type: &'static str, key: Key) -> Option<u64> {
        self.updates
            .iter()
            .rev()
            .find(|u| u.entity_type == entity_type && u.key == key)
            .map(|u| u.new_version)
    }
}

fn to_outcome<T>(result: Result<T>) -> Outcome<T, Error> {
    result.map_or_else(Outcome::Err, Outcome::Ok)
}

fn apply_update(tables: &mut Tables, update: StagedUpdate) {
    let Some(row) = tables
        .rows
        .get_mut(update.entity_type)
        .and_then(|rows| rows.get_mut(&update.key))
    else {
        return;
    };
    row.fields.extend(update.fields);
    row.version = update.new_version;
}

/// A connection handed to one session.
#[derive(Debug)]
pub struct MemoryConnection {
    store: Arc<StoreInner>,
    tx: Mutex<Option<Transaction>>,
}

impl MemoryConnection {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Self {
            store,
            tx: Mutex::new(None),
        }
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn load_row_sync(&self, entity_type: &'static str, key: Key) -> Result<Option<Row>> {
        self.store.check_available()?;
        self.store.counters.row_loads.fetch_add(1, Ordering::Relaxed);
        let row = self
            .store
            .tables()
            .get(entity_type, key)
            .map(|stored| stored.to_row(key));
        tracing::trace!(entity_type, key = %key, found = row.is_some(), "load_row");
        Ok(row)
    }

    fn load_association_sync(
        &self,
        entity_type: &'static str,
        key: Key,
        association: &str,
    ) -> Result<Vec<Row>> {
        self.store.check_available()?;
        self.store
            .counters
            .association_loads
            .fetch_add(1, Ordering::Relaxed);

        let tables = self.store.tables();
        let owner = tables
            .get(entity_type, key)
            .ok_or(Error::NotFound { entity_type, key })?;
        let link = owner
            .links
            .get(association)
            .ok_or_else(|| Error::UnknownAssociation {
                entity_type,
                association: association.to_string(),
            })?;

        let rows: Vec<Row> = link
            .link
            .keys()
            .into_iter()
            .filter_map(|target| {
                tables
                    .get(link.target_type, target)
                    .map(|stored| stored.to_row(target))
            })
            .collect();
        tracing::trace!(
            entity_type,
            key = %key,
            association,
            rows = rows.len(),
            "load_association"
        );
        Ok(rows)
    }

    fn allocate_key_sync(&self, entity_type: &'static str) -> Result<Key> {
        self.store.check_available()?;
        let key = self.store.tables().next_key(entity_type);
        tracing::trace!(entity_type, key = %key, "Allocated key");
        Ok(key)
    }

    fn insert_row_sync(&self, entity_type: &'static str, row: NewRow) -> Result<Key> {
        self.store.check_available()?;
        let key = row.key;
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tx.as_mut() {
            tx.inserts.push((entity_type, row));
            return Ok(key);
        }

        let mut tables = self.store.tables();
        if tables.get(entity_type, key).is_some() {
            return Err(Error::DuplicateIdentity { entity_type, key });
        }
        tables.put(
            entity_type,
            key,
            StoredRow {
                version: row.version,
                fields: row.fields,
                links: row.links,
            },
        );
        Ok(key)
    }

    fn conditional_update_sync(
        &self,
        entity_type: &'static str,
        key: Key,
        expected_version: u64,
        fields: BTreeMap<String, Value>,
    ) -> Result<UpdateOutcome> {
        self.store.check_available()?;
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tables = self.store.tables();

        let committed = tables.get(entity_type, key).map(|row| row.version);
        let current = tx
            .as_ref()
            .and_then(|tx| tx.staged_version(entity_type, key))
            .or(committed);
        if current != Some(expected_version) {
            tracing::debug!(
                entity_type,
                key = %key,
                expected_version,
                current = ?current,
                "Version check failed"
            );
            return Ok(UpdateOutcome::Conflict {
                current_version: current,
            });
        }

        let update = StagedUpdate {
            entity_type,
            key,
            expected_version,
            new_version: expected_version + 1,
            fields,
        };
        let new_version = update.new_version;
        match tx.as_mut() {
            Some(tx) => tx.updates.push(update),
            None => apply_update(&mut tables, update),
        }
        Ok(UpdateOutcome::Applied(new_version))
    }

    fn begin_sync(&self) -> Result<()> {
        self.store.check_available()?;
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.is_some() {
            return Err(Error::Custom("Already in a transaction".to_string()));
        }
        *tx = Some(Transaction::default());
        Ok(())
    }

    fn commit_sync(&self) -> Result<()> {
        let Some(tx) = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(Error::Custom("Not in a transaction".to_string()));
        };
        self.store.check_available()?;

        let mut tables = self.store.tables();

        // Revalidate every staged write against committed state before
        // applying any of them.
        let mut seen: HashMap<(&'static str, Key), u64> = HashMap::new();
        for update in &tx.updates {
            let current = seen
                .get(&(update.entity_type, update.key))
                .copied()
                .or_else(|| tables.get(update.entity_type, update.key).map(|r| r.version));
            if current != Some(update.expected_version) {
                tracing::debug!(
                    entity_type = update.entity_type,
                    key = %update.key,
                    "Staged version check no longer holds"
                );
                return Err(Error::OptimisticConflict(ConflictInfo {
                    entity_type: update.entity_type,
                    key: update.key,
                    expected_version: update.expected_version,
                    actual_version: current,
                }));
            }
            seen.insert((update.entity_type, update.key), update.new_version);
        }
        for (entity_type, row) in &tx.inserts {
            if tables.get(*entity_type, row.key).is_some() {
                return Err(Error::DuplicateIdentity {
                    entity_type: *entity_type,
                    key: row.key,
                });
            }
        }

        let inserted = tx.inserts.len();
        let updated = tx.updates.len();
        for (entity_type, row) in tx.inserts {
            tables.put(
                entity_type,
                row.key,
                StoredRow {
                    version: row.version,
                    fields: row.fields,
                    links: row.links,
                },
            );
        }
        for update in tx.updates {
            apply_update(&mut tables, update);
        }
        self.store.counters.commits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(inserted, updated, "Memory transaction committed");
        Ok(())
    }

    fn rollback_sync(&self) -> Result<()> {
        let discarded = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if discarded.is_none() {
            return Err(Error::Custom("Not in a transaction".to_string()));
        }
        tracing::debug!("Memory transaction rolled back");
        Ok(())
    }
}

// ── Backend trait impl ────────────────────────────────────────────────────

impl Backend for MemoryConnection {
    fn load_row(
        &self,
        _cx: &Cx,
        entity_type: &'static str,
        key: Key,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self.load_row_sync(entity_type, key);
        async move { to_outcome(result) }
    }

    fn load_association(
        &self,
        _cx: &Cx,
        entity_type: &'static str,
        key: Key,
        association: &str,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.load_association_sync(entity_type, key, association);
        async move { to_outcome(result) }
    }

    fn allocate_key(
        &self,
        _cx: &Cx,
        entity_type: &'static str,
    ) -> impl Future<Output = Outcome<Key, Error>> + Send {
        let result = self.allocate_key_sync(entity_type);
        async move { to_outcome(result) }
    }

    fn insert_row(
        &self,
        _cx: &Cx,
        entity_type: &'static str,
        row: NewRow,
    ) -> impl Future<Output = Outcome<Key, Error>> + Send {
        let result = self.insert_row_sync(entity_type, row);
        async move { to_outcome(result) }
    }

    fn conditional_update(
        &self,
        _cx: &Cx,
        entity_type: &'static str,
        key: Key,
        expected_version: u64,
        fields: BTreeMap<String, Value>,
    ) -> impl Future<Output = Outcome<UpdateOutcome, Error>> + Send {
        let result = self.conditional_update_sync(entity_type, key, expected_version, fields);
        async move { to_outcome(result) }
    }

    fn begin_transaction(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync();
        async move { to_outcome(result) }
    }

    fn commit_transaction(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync();
        async move { to_outcome(result) }
    }

    fn rollback_transaction(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync();
        async move { to_outcome(result) }
    }
}
