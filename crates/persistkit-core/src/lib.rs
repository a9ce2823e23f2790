//! Core types and traits for persistkit.
//!
//! This crate provides the foundational abstractions shared by the session
//! layer and backends:
//!
//! - `Entity` / `EntityRef` for dynamically shaped persistent records
//! - `AssociationState` for lazily loaded relationships (proxies)
//! - `FetchSpec` for declaring eager association paths
//! - `Backend` / `BackendSource` traits for storage engines
//! - `Error` taxonomy for every contract violation
//! - `Outcome` / `Cx` re-exports from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod association;
pub mod backend;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod row;
pub mod value;

pub use association::{
    Association, AssociationKind, AssociationLoader, AssociationState, AssociationValue, Link,
    LoadFuture, Owner, SessionId,
};
pub use backend::{Backend, BackendSource};
pub use entity::{Entity, EntityRef};
pub use error::{BackendError, BackendErrorKind, ConflictInfo, Error, Result};
pub use fetch::{FetchPath, FetchSpec};
pub use row::{NewRow, Row, RowLink, UpdateOutcome};
pub use value::{Key, Value};
