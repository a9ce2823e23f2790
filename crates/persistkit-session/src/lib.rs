//! Session and unit of work for persistkit.
//!
//! `persistkit-session` is the **unit-of-work layer**. It coordinates entity
//! identity, lazy association loading, change tracking and optimistic
//! commits over a [`Backend`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory instance per `(entity type, key)`.
//! - **Association proxies**: unloaded associations resolve through the
//!   owning session while it is open, and fail with `DetachedAccess` after.
//! - **Fetch specs**: named association paths loaded eagerly by the
//!   [`FetchPlanner`], so they stay usable after close.
//! - **Optimistic locking**: every dirty entity is written with a version
//!   check; commits are all-or-nothing.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: no autoflush, no automatic retries.
//! - **Conflicts are values** until the session boundary (`try_commit`).
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(store);
//! let mut session = factory.open_session()?;
//!
//! // Identity map first, backend on miss
//! let author = session.find(&cx, "author", Key(1)).await;
//!
//! author.set("name", "Changed");
//! session.commit(&cx).await;
//! session.close()?;
//! ```

mod context;

pub mod change_tracker;
pub mod factory;
pub mod fetch_planner;
pub mod identity_map;
pub mod version_tracker;

pub use change_tracker::{ChangeTracker, ObjectSnapshot};
pub use factory::SessionFactory;
pub use fetch_planner::FetchPlanner;
pub use identity_map::IdentityMap;
pub use version_tracker::{VersionCheck, VersionTracker, check_and_bump};

use context::SessionContext;
use factory::FetchSpecRegistry;
use persistkit_core::{
    AssociationLoader, Backend, ConflictInfo, Cx, EntityRef, Error, FetchSpec, Key, NewRow,
    Outcome, Owner, Result, SessionId, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Session Configuration
// ============================================================================

/// How a session finds the entities it must write at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyChecking {
    /// Entities whose fields differ from their snapshot, plus explicit marks.
    #[default]
    Snapshot,
    /// Only entities passed to [`Session::mark_dirty`].
    Explicit,
}

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How dirty entities are detected.
    pub dirty_checking: DirtyChecking,
    /// Whether an entity marked dirty with no field changes is still written
    /// (bumping its version).
    pub bump_unchanged: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dirty_checking: DirtyChecking::Snapshot,
            bump_unchanged: true,
        }
    }
}

impl SessionConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dirty checking mode (builder pattern).
    #[must_use]
    pub fn dirty_checking(mut self, mode: DirtyChecking) -> Self {
        self.dirty_checking = mode;
        self
    }

    /// Set the `bump_unchanged` option (builder pattern).
    #[must_use]
    pub fn bump_unchanged(mut self, value: bool) -> Self {
        self.bump_unchanged = value;
        self
    }
}

// ============================================================================
// Object Key
// ============================================================================

/// Unique key for an entity in the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    entity_type: &'static str,
    key: Key,
}

impl ObjectKey {
    /// Create an object key from an entity type and key.
    #[must_use]
    pub fn new(entity_type: &'static str, key: Key) -> Self {
        Self { entity_type, key }
    }

    /// Object key of an entity, if it has an identity.
    #[must_use]
    pub fn of(entity: &EntityRef) -> Option<Self> {
        let entity = entity.read();
        entity.key().map(|key| Self::new(entity.entity_type(), key))
    }

    /// Get the entity type.
    #[must_use]
    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    /// Get the key.
    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.key)
    }
}

// ============================================================================
// Commit results
// ============================================================================

/// What a successful commit wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Rows inserted.
    pub inserted: usize,
    /// Rows updated with a version check.
    pub updated: usize,
}

/// Result of [`Session::try_commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Everything was written.
    Committed(CommitSummary),
    /// Nothing was written; this entity was modified concurrently.
    Conflict(ConflictInfo),
}

impl CommitOutcome {
    /// True if the commit went through.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Session id.
    pub id: SessionId,
    /// Whether the session is open.
    pub open: bool,
    /// Total managed instances.
    pub tracked: usize,
    /// Instances pending INSERT.
    pub pending_new: usize,
    /// Instances the next commit would UPDATE.
    pub pending_dirty: usize,
}

struct PlannedInsert {
    key: ObjectKey,
    entity: EntityRef,
    row: NewRow,
}

struct PlannedUpdate {
    key: ObjectKey,
    entity: EntityRef,
    expected: u64,
    fields: BTreeMap<String, Value>,
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It owns one backend connection and tracks every entity loaded through it
/// or persisted into it. A session is single-writer; run concurrent work in
/// separate sessions.
pub struct Session<B: Backend> {
    ctx: Arc<SessionContext<B>>,
    config: SessionConfig,
    fetch_specs: FetchSpecRegistry,
    /// Entities marked as new (need INSERT), in persist order.
    pending_new: Vec<ObjectKey>,
    /// Entities explicitly marked dirty.
    pending_dirty: Vec<ObjectKey>,
}

impl<B: Backend> Session<B> {
    pub(crate) fn new(
        id: SessionId,
        backend: B,
        config: SessionConfig,
        fetch_specs: FetchSpecRegistry,
    ) -> Self {
        Self {
            ctx: SessionContext::new(id, backend),
            config,
            fetch_specs,
            pending_new: Vec::new(),
            pending_dirty: Vec::new(),
        }
    }

    /// Session id, unique within its factory.
    pub fn id(&self) -> SessionId {
        self.ctx.id()
    }

    /// Whether the session is still open.
    pub fn is_open(&self) -> bool {
        self.ctx.is_open()
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The backend connection.
    pub fn backend(&self) -> &B {
        self.ctx.backend()
    }

    /// Look up a fetch spec registered on the factory.
    pub fn fetch_spec(&self, name: &str) -> Option<Arc<FetchSpec>> {
        self.fetch_specs.get(name)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    /// Identity of an entity this session manages, or the reason it is not
    /// managed here.
    fn managed_key(&self, entity: &EntityRef) -> Result<ObjectKey> {
        let Some(okey) = ObjectKey::of(entity) else {
            return Err(Error::Custom(format!(
                "{} instance has no identity; persist it first",
                entity.entity_type()
            )));
        };
        if self.ctx.identity_map().contains_instance(&okey, entity) {
            Ok(okey)
        } else {
            Err(Error::DetachedEntity {
                entity_type: okey.entity_type(),
                key: okey.key(),
            })
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Find an entity by key.
    ///
    /// Returns the managed instance if the identity map has it; otherwise loads
    /// the row, registers a new instance with every association unloaded and
    /// records its version.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity_type: &'static str,
        key: Key,
    ) -> Outcome<EntityRef, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }

        let okey = ObjectKey::new(entity_type, key);
        let cached = self.ctx.identity_map().get(&okey);
        if let Some(entity) = cached {
            tracing::debug!(%okey, "Identity map hit");
            return Outcome::Ok(entity);
        }

        let row = match self.ctx.backend().load_row(cx, entity_type, key).await {
            Outcome::Ok(Some(row)) => row,
            Outcome::Ok(None) => {
                tracing::debug!(%okey, "Row not found");
                return Outcome::Err(Error::NotFound { entity_type, key });
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        match self.ctx.materialize(entity_type, vec![row]).pop() {
            Some(entity) => {
                tracing::debug!(%okey, version = entity.version(), "Loaded entity");
                Outcome::Ok(entity)
            }
            None => Outcome::Err(Error::NotFound { entity_type, key }),
        }
    }

    /// Find an entity and eagerly load the associations named by `spec`.
    ///
    /// The planner runs on identity-map hits too, so every named path is
    /// loaded when this returns.
    #[tracing::instrument(level = "debug", skip(self, cx, spec), fields(spec = spec.name()))]
    pub async fn find_with(
        &mut self,
        cx: &Cx,
        entity_type: &'static str,
        key: Key,
        spec: &FetchSpec,
    ) -> Outcome<EntityRef, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let planner = FetchPlanner::new(spec);
        if let Err(e) = planner.validate_root(entity_type) {
            return Outcome::Err(e);
        }

        let entity = match self.find(cx, entity_type, key).await {
            Outcome::Ok(entity) => entity,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let roots = [entity.clone()];
        match planner.apply(cx, &*self.ctx, &roots).await {
            Outcome::Ok(_) => Outcome::Ok(entity),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// [`find_with`](Self::find_with) using a fetch spec registered on the
    /// factory under `name`.
    pub async fn find_with_named(
        &mut self,
        cx: &Cx,
        entity_type: &'static str,
        key: Key,
        name: &str,
    ) -> Outcome<EntityRef, Error> {
        let Some(spec) = self.fetch_spec(name) else {
            return Outcome::Err(Error::InvalidFetchSpec(format!(
                "no fetch spec named '{name}'"
            )));
        };
        self.find_with(cx, entity_type, key, &spec).await
    }

    /// Reload an entity's fields, version and associations from the backend.
    ///
    /// Local changes are discarded, and the explicit dirty mark is cleared.
    /// This is how a caller recovers after an optimistic conflict.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn refresh(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let okey = match self.managed_key(entity) {
            Ok(okey) => okey,
            Err(e) => return Outcome::Err(e),
        };

        let row = match self
            .ctx
            .backend()
            .load_row(cx, okey.entity_type(), okey.key())
            .await
        {
            Outcome::Ok(Some(row)) => row,
            Outcome::Ok(None) => {
                return Outcome::Err(Error::NotFound {
                    entity_type: okey.entity_type(),
                    key: okey.key(),
                });
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let version = row.version;
        {
            let mut e = entity.write();
            e.replace_fields(row.fields);
            e.set_version(version);
            e.reset_associations(row.links);
        }
        self.ctx.track(okey, entity, version);
        self.pending_dirty.retain(|k| *k != okey);
        tracing::debug!(%okey, version, "Refreshed entity");
        Outcome::Ok(())
    }

    // ========================================================================
    // Change registration
    // ========================================================================

    /// Make a new entity managed; it is inserted on the next commit.
    ///
    /// An entity without identity gets one from the backend right away. An
    /// entity that already has an identity is only accepted if this session
    /// already manages that very instance (then this is a no-op).
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn persist(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }

        let (entity_type, key, owner) = {
            let e = entity.read();
            (e.entity_type(), e.key(), e.owner().cloned())
        };

        if let Some(key) = key {
            let okey = ObjectKey::new(entity_type, key);
            return match owner {
                None => {
                    tracing::debug!(%okey, "Refusing persist of preassigned identity");
                    Outcome::Err(Error::IdentityAlreadyAssigned { entity_type, key })
                }
                Some(owner) if !self.ctx.owns(&owner) => {
                    tracing::debug!(%okey, owner = %owner.session(), "Refusing persist of detached entity");
                    Outcome::Err(Error::DetachedEntity { entity_type, key })
                }
                Some(_) => {
                    let registered = self.ctx.identity_map().get(&okey);
                    match registered {
                        Some(existing) if EntityRef::ptr_eq(&existing, entity) => Outcome::Ok(()),
                        Some(_) => Outcome::Err(Error::DuplicateIdentity { entity_type, key }),
                        // Evicted earlier
                        None => Outcome::Err(Error::DetachedEntity { entity_type, key }),
                    }
                }
            };
        }

        let key = match self.ctx.backend().allocate_key(cx, entity_type).await {
            Outcome::Ok(key) => key,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let okey = ObjectKey::new(entity_type, key);

        if let Err(e) = self.ctx.identity_map().put(okey, entity.clone()) {
            return Outcome::Err(e);
        }
        {
            let mut e = entity.write();
            e.set_key(Some(key));
            e.set_version(0);
            e.set_owner(Some(self.ctx.owner()));
        }
        self.pending_new.push(okey);
        tracing::debug!(%okey, "Entity persisted, pending insert");
        Outcome::Ok(())
    }

    /// Explicitly mark a managed entity as dirty.
    ///
    /// Marking a pending insert is a no-op: it is written in full anyway.
    pub fn mark_dirty(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        let okey = self.managed_key(entity)?;
        if !self.pending_new.contains(&okey) && !self.pending_dirty.contains(&okey) {
            tracing::trace!(%okey, "Marked dirty");
            self.pending_dirty.push(okey);
        }
        Ok(())
    }

    /// Whether the next commit would write this entity.
    pub fn is_dirty(&self, entity: &EntityRef) -> bool {
        let Ok(okey) = self.managed_key(entity) else {
            return false;
        };
        if self.pending_new.contains(&okey) {
            return true;
        }
        self.plan_updates()
            .iter()
            .any(|update| update.key == okey)
    }

    /// Check if this exact instance is managed by the session.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.is_open() && self.managed_key(entity).is_ok()
    }

    /// Stop managing one instance.
    ///
    /// Its unloaded associations can no longer be resolved, its pending
    /// changes are dropped, and a pending insert is cancelled (the instance
    /// loses the identity it was given). Returns whether the instance was
    /// managed.
    pub fn evict(&mut self, entity: &EntityRef) -> bool {
        let Ok(okey) = self.managed_key(entity) else {
            return false;
        };
        self.ctx.identity_map().remove(&okey);
        self.ctx.versions().forget(&okey);
        self.ctx.snapshots().forget(&okey);
        self.pending_dirty.retain(|k| *k != okey);

        let mut e = entity.write();
        if let Some(pos) = self.pending_new.iter().position(|k| *k == okey) {
            self.pending_new.remove(pos);
            e.set_key(None);
            e.set_owner(None);
        } else {
            // Keep the owner so a later persist reports a detached entity.
            let evicted = e.owner().map(Owner::evicted);
            e.set_owner(evicted);
        }
        tracing::debug!(%okey, "Evicted entity");
        true
    }

    // ========================================================================
    // Commit / Rollback
    // ========================================================================

    fn plan_inserts(&self) -> Vec<PlannedInsert> {
        let map = self.ctx.identity_map();
        self.pending_new
            .iter()
            .filter_map(|okey| {
                let entity = map.get(okey)?;
                let row = {
                    let e = entity.read();
                    NewRow {
                        key: okey.key(),
                        version: 1,
                        fields: e.fields().clone(),
                        links: e.links(),
                    }
                };
                Some(PlannedInsert {
                    key: *okey,
                    entity,
                    row,
                })
            })
            .collect()
    }

    fn plan_updates(&self) -> Vec<PlannedUpdate> {
        let map = self.ctx.identity_map();
        let versions = self.ctx.versions();
        let snapshots = self.ctx.snapshots();

        let mut keys: Vec<ObjectKey> = map
            .iter()
            .map(|(okey, _)| *okey)
            .filter(|okey| !self.pending_new.contains(okey))
            .collect();
        keys.sort();

        let mut updates = Vec::new();
        for okey in keys {
            let Some(entity) = map.get(&okey) else {
                continue;
            };
            let explicit = self.pending_dirty.contains(&okey);
            if !explicit && self.config.dirty_checking == DirtyChecking::Explicit {
                continue;
            }

            let (fields, version) = {
                let e = entity.read();
                let changed = snapshots.changed_fields(&okey, e.fields());
                let fields: BTreeMap<String, Value> = changed
                    .into_iter()
                    .map(|name| {
                        let value = e.field(&name).cloned().unwrap_or(Value::Null);
                        (name, value)
                    })
                    .collect();
                (fields, e.version())
            };
            if fields.is_empty() && !(explicit && self.config.bump_unchanged) {
                continue;
            }

            updates.push(PlannedUpdate {
                key: okey,
                entity,
                expected: versions.expected(&okey).unwrap_or(version),
                fields,
            });
        }
        updates
    }

    /// Roll back the open backend transaction after a failed flush.
    async fn abort(&self, cx: &Cx) {
        self.ctx.versions().discard_staged();
        match self.ctx.backend().rollback_transaction(cx).await {
            Outcome::Ok(()) => tracing::debug!("Backend transaction rolled back"),
            Outcome::Err(e) => tracing::warn!(error = %e, "Backend rollback failed"),
            Outcome::Cancelled(_) => tracing::warn!("Backend rollback cancelled"),
            Outcome::Panicked(_) => tracing::warn!("Backend rollback panicked"),
        }
    }

    /// Commit pending inserts and dirty entities, reporting a conflict as a
    /// value.
    ///
    /// All-or-nothing: on conflict or error nothing is written, no in-memory
    /// version advances, and the pending inserts and dirty entities stay
    /// pending so the caller can refresh, roll back, or retry.
    #[tracing::instrument(level = "info", skip(self, cx), fields(session = %self.id()))]
    pub async fn try_commit(&mut self, cx: &Cx) -> Outcome<CommitOutcome, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }

        let inserts = self.plan_inserts();
        let updates = self.plan_updates();
        if inserts.is_empty() && updates.is_empty() {
            tracing::debug!("Nothing to commit");
            self.pending_dirty.clear();
            return Outcome::Ok(CommitOutcome::Committed(CommitSummary::default()));
        }
        tracing::info!(
            inserts = inserts.len(),
            updates = updates.len(),
            "Committing session"
        );

        match self.ctx.backend().begin_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        for insert in &inserts {
            match self
                .ctx
                .backend()
                .insert_row(cx, insert.key.entity_type(), insert.row.clone())
                .await
            {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => {
                    self.abort(cx).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.abort(cx).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.abort(cx).await;
                    return Outcome::Panicked(p);
                }
            }
        }

        for update in &updates {
            match check_and_bump(
                cx,
                self.ctx.backend(),
                update.key,
                update.expected,
                update.fields.clone(),
            )
            .await
            {
                Outcome::Ok(VersionCheck::Bumped(version)) => {
                    self.ctx.versions().stage(update.key, version);
                }
                Outcome::Ok(VersionCheck::Conflict(info)) => {
                    self.abort(cx).await;
                    return Outcome::Ok(CommitOutcome::Conflict(info));
                }
                Outcome::Err(e) => {
                    self.abort(cx).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.abort(cx).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.abort(cx).await;
                    return Outcome::Panicked(p);
                }
            }
        }

        match self.ctx.backend().commit_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(Error::OptimisticConflict(info)) => {
                self.ctx.versions().discard_staged();
                tracing::warn!(conflict = %info, "Conflict detected at backend commit");
                return Outcome::Ok(CommitOutcome::Conflict(info));
            }
            Outcome::Err(e) => {
                self.ctx.versions().discard_staged();
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.ctx.versions().discard_staged();
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.ctx.versions().discard_staged();
                return Outcome::Panicked(p);
            }
        }

        let settled = self.ctx.versions().settle();
        for update in &updates {
            if let Some((_, version)) = settled.iter().find(|(k, _)| *k == update.key) {
                update.entity.write().set_version(*version);
                self.ctx.track(update.key, &update.entity, *version);
            }
        }
        for insert in &inserts {
            insert.entity.write().set_version(insert.row.version);
            self.ctx.track(insert.key, &insert.entity, insert.row.version);
        }
        self.pending_new.clear();
        self.pending_dirty.clear();

        let summary = CommitSummary {
            inserted: inserts.len(),
            updated: updates.len(),
        };
        tracing::info!(
            inserted = summary.inserted,
            updated = summary.updated,
            "Commit complete"
        );
        Outcome::Ok(CommitOutcome::Committed(summary))
    }

    /// Commit pending inserts and dirty entities.
    ///
    /// Like [`try_commit`](Self::try_commit), but a conflict is reported as
    /// `Error::OptimisticConflict`.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<CommitSummary, Error> {
        match self.try_commit(cx).await {
            Outcome::Ok(CommitOutcome::Committed(summary)) => Outcome::Ok(summary),
            Outcome::Ok(CommitOutcome::Conflict(info)) => {
                Outcome::Err(Error::OptimisticConflict(info))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Discard every pending change without writing.
    ///
    /// Managed entities get their snapshot fields back. Pending inserts leave
    /// the identity map and lose their identity, so they can be persisted
    /// again.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;

        let mut map = self.ctx.identity_map();
        let mut versions = self.ctx.versions();
        let mut snapshots = self.ctx.snapshots();

        let discarded = self.pending_new.len();
        for okey in self.pending_new.drain(..) {
            if let Some(entity) = map.remove(&okey) {
                let mut e = entity.write();
                e.set_key(None);
                e.set_version(0);
                e.set_owner(None);
            }
            versions.forget(&okey);
            snapshots.forget(&okey);
        }

        let mut restored = 0usize;
        for (okey, entity) in map.iter() {
            let dirty = snapshots.is_dirty(okey, entity.read().fields());
            if !dirty {
                continue;
            }
            if let Some(original) = snapshots.original_fields(okey) {
                entity.write().replace_fields(original);
                restored += 1;
            }
        }

        self.pending_dirty.clear();
        versions.discard_staged();
        tracing::info!(discarded, restored, "Session rolled back");
        Ok(())
    }

    /// Close the session.
    ///
    /// Clears the identity map and trackers. Instances stay usable for their
    /// fields and loaded associations; unloaded ones fail with
    /// `DetachedAccess`. Uncommitted changes are dropped.
    pub fn close(&mut self) -> Result<()> {
        if !self.ctx.mark_closed() {
            return Err(Error::SessionClosed);
        }
        let tracked = self.ctx.release();
        let discarded = self.pending_new.len() + self.pending_dirty.len();
        self.pending_new.clear();
        self.pending_dirty.clear();
        tracing::info!(session = %self.id(), tracked, discarded, "Session closed");
        Ok(())
    }

    /// Get debug information about the session state.
    pub fn debug_info(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            id: self.id(),
            open: self.is_open(),
            tracked: self.ctx.identity_map().len(),
            pending_new: self.pending_new.len(),
            pending_dirty: self.plan_updates().len(),
        }
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        if self.ctx.mark_closed() {
            let tracked = self.ctx.release();
            tracing::debug!(session = %self.id(), tracked, "Session dropped without close");
        }
    }
}

impl<B: Backend> fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("pending_new", &self.pending_new.len())
            .field("pending_dirty", &self.pending_dirty.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use persistkit_core::{Entity, Row};
    use persistkit_memory::MemoryStore;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn store_with_author() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed(
            "author",
            Row::new(Key(1), 0)
                .with_field("first_name", "Thorben")
                .with_field("last_name", "Janssen"),
        );
        store
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.dirty_checking, DirtyChecking::Snapshot);
        assert!(config.bump_unchanged);
        assert_eq!(SessionConfig::new(), config);
    }

    #[test]
    fn test_config_serde() {
        let config = SessionConfig::new()
            .dirty_checking(DirtyChecking::Explicit)
            .bump_unchanged(false);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"dirty_checking":"explicit","bump_unchanged":false}"#);

        // Missing fields fall back to defaults.
        let partial: SessionConfig = serde_json::from_str(r#"{"bump_unchanged":false}"#).unwrap();
        assert_eq!(partial.dirty_checking, DirtyChecking::Snapshot);
        assert!(!partial.bump_unchanged);
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::new("author", Key(7));
        assert_eq!(key.to_string(), "author#7");
        assert_eq!(key.entity_type(), "author");
        assert_eq!(key.key(), Key(7));

        let unsaved = EntityRef::new(Entity::new("author"));
        assert!(ObjectKey::of(&unsaved).is_none());
    }

    #[test]
    fn test_only_changed_fields_are_written() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store_with_author();
        let factory = SessionFactory::new(store.clone());

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
            author.set("first_name", "Vlad");

            let plan = session.plan_updates();
            assert_eq!(plan.len(), 1);
            assert_eq!(plan[0].expected, 0);
            assert_eq!(
                plan[0].fields.keys().cloned().collect::<Vec<_>>(),
                vec!["first_name".to_string()]
            );

            unwrap_outcome(session.commit(&cx).await);
            let row = store.row("author", Key(1)).unwrap();
            assert_eq!(row.fields["first_name"], Value::from("Vlad"));
            assert_eq!(row.fields["last_name"], Value::from("Janssen"));
        });
    }

    #[test]
    fn test_non_finite_doubles_are_not_changes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.seed(
            "author",
            Row::new(Key(1), 0)
                .with_field("name", "A")
                .with_field("score", Value::Double(f64::NAN))
                .with_field("limit", Value::Double(f64::NEG_INFINITY)),
        );
        let factory = SessionFactory::new(store.clone());

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
            assert!(!session.is_dirty(&author));
            assert!(session.plan_updates().is_empty());

            for _ in 0..2 {
                let summary = unwrap_outcome(session.commit(&cx).await);
                assert_eq!(summary, CommitSummary::default());
            }
            assert_eq!(author.version(), 0);
            assert_eq!(store.row("author", Key(1)).unwrap().version, 0);

            author.set("name", "B");
            let plan = session.plan_updates();
            assert_eq!(plan.len(), 1);
            assert_eq!(
                plan[0].fields.keys().cloned().collect::<Vec<_>>(),
                vec!["name".to_string()]
            );

            session.rollback().unwrap();
            assert_eq!(author.get("name"), Some(Value::from("A")));
            assert!(author
                .get("score")
                .is_some_and(|v| v.same_as(&Value::Double(f64::NAN))));
            assert_eq!(author.get("limit"), Some(Value::Double(f64::NEG_INFINITY)));
            assert!(!session.is_dirty(&author));
        });
    }

    #[test]
    fn test_explicit_mode_writes_only_marked_entities() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store_with_author();
        let config = SessionConfig::new().dirty_checking(DirtyChecking::Explicit);
        let factory = SessionFactory::with_config(store.clone(), config);

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
            author.set("first_name", "Unmarked");
            assert!(!session.is_dirty(&author));
            assert_eq!(session.debug_info().pending_dirty, 0);

            session.mark_dirty(&author).unwrap();
            assert!(session.is_dirty(&author));
            let summary = unwrap_outcome(session.commit(&cx).await);
            assert_eq!(summary.updated, 1);
            assert_eq!(store.row("author", Key(1)).unwrap().version, 1);
        });
    }

    #[test]
    fn test_mark_dirty_without_changes_bumps_version() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store_with_author();
        let factory = SessionFactory::new(store.clone());

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
            session.mark_dirty(&author).unwrap();
            session.mark_dirty(&author).unwrap();

            let summary = unwrap_outcome(session.commit(&cx).await);
            assert_eq!(summary.updated, 1);
            assert_eq!(author.version(), 1);
            assert_eq!(store.row("author", Key(1)).unwrap().version, 1);
        });
    }

    #[test]
    fn test_bump_unchanged_disabled() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store_with_author();
        let factory =
            SessionFactory::with_config(store.clone(), SessionConfig::new().bump_unchanged(false));

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
            session.mark_dirty(&author).unwrap();

            let summary = unwrap_outcome(session.commit(&cx).await);
            assert_eq!(summary, CommitSummary::default());
            assert_eq!(author.version(), 0);
            assert_eq!(store.stats().commits, 0);
        });
    }

    #[test]
    fn test_mark_dirty_requires_identity() {
        let factory = SessionFactory::new(MemoryStore::new());
        let mut session = factory.open_session().unwrap();
        let unsaved = EntityRef::new(Entity::new("author"));
        assert!(matches!(session.mark_dirty(&unsaved), Err(Error::Custom(_))));
        assert!(!session.is_dirty(&unsaved));
    }

    #[test]
    fn test_mark_dirty_on_pending_insert_is_noop() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let factory = SessionFactory::new(MemoryStore::new());

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = EntityRef::new(Entity::new("author").with_field("first_name", "Gavin"));
            unwrap_outcome(session.persist(&cx, &author).await);
            session.mark_dirty(&author).unwrap();

            let info = session.debug_info();
            assert_eq!(info.pending_new, 1);
            assert_eq!(info.pending_dirty, 0);
            assert_eq!(info.tracked, 1);

            let summary = unwrap_outcome(session.commit(&cx).await);
            assert_eq!(summary.inserted, 1);
            assert_eq!(summary.updated, 0);
        });
    }

    #[test]
    fn test_evict_pending_insert_cancels_it() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let factory = SessionFactory::new(store.clone());

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = EntityRef::new(Entity::new("author"));
            unwrap_outcome(session.persist(&cx, &author).await);
            assert!(session.evict(&author));

            assert_eq!(author.key(), None);
            assert!(author.read().owner_session().is_none());
            unwrap_outcome(session.commit(&cx).await);
            assert_eq!(store.count("author"), 0);
        });
    }

    #[test]
    fn test_evicted_entity_is_detached() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let factory = SessionFactory::new(store_with_author());

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
            author.set("first_name", "Dropped");
            assert!(session.evict(&author));

            assert_eq!(author.read().owner_session(), Some(session.id()));
            assert!(!author.read().is_attached());
            assert_eq!(session.debug_info().pending_dirty, 0);
            assert!(matches!(
                session.persist(&cx, &author).await,
                Outcome::Err(Error::DetachedEntity { .. })
            ));
        });
    }

    #[test]
    fn test_refresh_discards_local_changes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = store_with_author();
        let factory = SessionFactory::new(store.clone());

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
            author.set("first_name", "Local");
            session.mark_dirty(&author).unwrap();

            store.seed(
                "author",
                Row::new(Key(1), 4).with_field("first_name", "Remote"),
            );
            unwrap_outcome(session.refresh(&cx, &author).await);

            assert_eq!(author.version(), 4);
            assert_eq!(author.get("first_name"), Some(Value::from("Remote")));
            assert_eq!(author.get("last_name"), None);
            assert!(!session.is_dirty(&author));
            assert_eq!(store.stats().row_loads, 2);
        });
    }

    #[test]
    fn test_debug_info() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let factory = SessionFactory::new(store_with_author());

        rt.block_on(async {
            let mut session = factory.open_session().unwrap();
            let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
            author.set("last_name", "Changed");

            let info = session.debug_info();
            assert_eq!(info.id, session.id());
            assert!(info.open);
            assert_eq!(info.tracked, 1);
            assert_eq!(info.pending_new, 0);
            assert_eq!(info.pending_dirty, 1);

            session.close().unwrap();
            let info = session.debug_info();
            assert!(!info.open);
            assert_eq!(info.tracked, 0);
        });
    }
}
