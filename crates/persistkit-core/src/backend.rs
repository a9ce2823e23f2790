//! Backend adapter traits.
//!
//! This module defines the contract between the session core and a storage
//! engine:
//!
//! - [`Backend`] - one connection, used by exactly one session
//! - [`BackendSource`] - hands out connections to a session factory
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! context for proper cancellation and timeout handling. Timeouts and outages
//! are reported as [`Error::BackendUnavailable`](crate::Error::BackendUnavailable).

use crate::row::{NewRow, Row, UpdateOutcome};
use crate::value::{Key, Value};
use crate::{Error, Result};
use asupersync::{Cx, Outcome};
use std::collections::BTreeMap;
use std::future::Future;

/// A connection to the storage engine.
///
/// Implementations must serialize the version check and the write of
/// [`Backend::conditional_update`] per row, and must re-validate staged
/// version checks atomically in [`Backend::commit_transaction`], so that of two
/// concurrent commits touching the same row at most one succeeds.
pub trait Backend: Send + Sync + 'static {
    /// Load one row by key, `None` if absent.
    fn load_row(
        &self,
        cx: &Cx,
        entity_type: &'static str,
        key: Key,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Load every row reachable through one association of one row, in link order.
    fn load_association(
        &self,
        cx: &Cx,
        entity_type: &'static str,
        key: Key,
        association: &str,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Allocate a fresh identity for a new row of this type.
    fn allocate_key(
        &self,
        cx: &Cx,
        entity_type: &'static str,
    ) -> impl Future<Output = Outcome<Key, Error>> + Send;

    /// Insert a row inside the current transaction, returning its key.
    fn insert_row(
        &self,
        cx: &Cx,
        entity_type: &'static str,
        row: NewRow,
    ) -> impl Future<Output = Outcome<Key, Error>> + Send;

    /// Write new fields if and only if the stored version equals `expected_version`.
    ///
    /// Fields not named in `fields` keep their stored values. Outside a
    /// transaction the write is applied immediately.
    fn conditional_update(
        &self,
        cx: &Cx,
        entity_type: &'static str,
        key: Key,
        expected_version: u64,
        fields: BTreeMap<String, Value>,
    ) -> impl Future<Output = Outcome<UpdateOutcome, Error>> + Send;

    /// Begin a transaction.
    fn begin_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the current transaction.
    ///
    /// Fails with `OptimisticConflict` if a staged version check no longer
    /// holds. A failed commit leaves no transaction open.
    fn commit_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the current transaction, discarding staged writes.
    fn rollback_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}

/// Source of backend connections, owned by a session factory.
pub trait BackendSource: Send + Sync + 'static {
    /// Connection type handed to each session.
    type Backend: Backend;

    /// Open a connection for a new session.
    fn connect(&self) -> Result<Self::Backend>;
}
