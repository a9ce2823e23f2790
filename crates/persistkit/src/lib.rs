//! persistkit - persistence sessions for Rust.
//!
//! persistkit is the session core of an object store front-end:
//!
//! - An identity map guaranteeing one in-memory instance per stored row
//! - Lazy associations that load through their session, and only while it is open
//! - Named fetch specs that load association paths eagerly
//! - Optimistic concurrency with version-checked, all-or-nothing commits
//! - Typed errors for every contract violation (detached access, preset
//!   identity, detached entity, conflict, backend outage)
//!
//! Storage is pluggable through [`Backend`]; [`MemoryStore`] is an in-memory
//! reference implementation.
//!
//! # Quick Start
//!
//! ```ignore
//! use persistkit::prelude::*;
//!
//! async fn rename(cx: &Cx, factory: &SessionFactory<MemoryStore>) -> Outcome<(), Error> {
//!     let mut session = match factory.open_session() {
//!         Ok(session) => session,
//!         Err(e) => return Outcome::Err(e),
//!     };
//!
//!     // Identity map first, backend on miss
//!     let author = match session.find(cx, "author", Key(1)).await {
//!         Outcome::Ok(author) => author,
//!         other => return other.map(|_| ()),
//!     };
//!
//!     // Lazy association, resolved through the open session
//!     let books = author.resolve(cx, "books").await;
//!
//!     author.set("name", "Thorben Janssen");
//!     match session.try_commit(cx).await {
//!         Outcome::Ok(CommitOutcome::Conflict(info)) => { /* refresh, reapply, retry */ }
//!         _ => {}
//!     }
//!     Outcome::Ok(())
//! }
//! ```

// Re-export all public types from sub-crates
pub use persistkit_core::{
    // Associations
    Association,
    AssociationKind,
    AssociationLoader,
    AssociationState,
    AssociationValue,
    // Backend contract
    Backend,
    BackendError,
    BackendErrorKind,
    BackendSource,
    ConflictInfo,
    // asupersync re-exports
    Cx,
    // Entities
    Entity,
    EntityRef,
    Error,
    // Fetch specs
    FetchPath,
    FetchSpec,
    Key,
    Link,
    LoadFuture,
    NewRow,
    Outcome,
    Result,
    Row,
    RowLink,
    SessionId,
    UpdateOutcome,
    Value,
};

pub use persistkit_session::{
    ChangeTracker, CommitOutcome, CommitSummary, DirtyChecking, FetchPlanner, IdentityMap,
    ObjectKey, Session, SessionConfig, SessionDebugInfo, SessionFactory, VersionCheck,
    VersionTracker,
};

pub use persistkit_memory::{MemoryConnection, MemoryStats, MemoryStore};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use persistkit::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AssociationKind,
        AssociationValue,
        Backend,
        BackendSource,
        CommitOutcome,
        CommitSummary,
        ConflictInfo,
        Cx,
        Entity,
        EntityRef,
        Error,
        FetchSpec,
        Key,
        Link,
        // Reference backend
        MemoryStore,
        Outcome,
        Result,
        Row,
        RowLink,
        // Session
        Session,
        SessionConfig,
        SessionFactory,
        Value,
    };
}
