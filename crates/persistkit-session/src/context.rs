//! State shared between a session and the proxies it hands out.
//!
//! Entities reach their session through a `Weak<dyn AssociationLoader>`
//! pointing here, so everything a proxy load touches (backend, identity map,
//! trackers) lives behind this type rather than on `Session` itself.

use crate::change_tracker::ChangeTracker;
use crate::identity_map::IdentityMap;
use crate::version_tracker::VersionTracker;
use crate::ObjectKey;
use persistkit_core::{
    AssociationKind, AssociationLoader, AssociationValue, Backend, Cx, Entity, EntityRef, Error,
    LoadFuture, Outcome, Owner, Row, SessionId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct SessionContext<B: Backend> {
    id: SessionId,
    open: AtomicBool,
    backend: B,
    identity_map: Mutex<IdentityMap>,
    versions: Mutex<VersionTracker>,
    snapshots: Mutex<ChangeTracker>,
    loader: Weak<dyn AssociationLoader>,
}

impl<B: Backend> SessionContext<B> {
    pub(crate) fn new(id: SessionId, backend: B) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let loader: Weak<dyn AssociationLoader> = weak.clone();
            Self {
                id,
                open: AtomicBool::new(true),
                backend,
                identity_map: Mutex::new(IdentityMap::new()),
                versions: Mutex::new(VersionTracker::new()),
                snapshots: Mutex::new(ChangeTracker::new()),
                loader,
            }
        })
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    /// Owner record stamped on every entity this session manages.
    pub(crate) fn owner(&self) -> Owner {
        Owner::new(self.id, self.loader.clone())
    }

    /// Whether `owner` was issued by this session. Session ids repeat across
    /// factories, so this compares the loader, not the id.
    pub(crate) fn owns(&self, owner: &Owner) -> bool {
        owner.belongs_to(&self.loader)
    }

    /// Flip to closed. Returns false if the session was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    // Lock order: identity map, versions, snapshots.

    pub(crate) fn identity_map(&self) -> MutexGuard<'_, IdentityMap> {
        lock(&self.identity_map)
    }

    pub(crate) fn versions(&self) -> MutexGuard<'_, VersionTracker> {
        lock(&self.versions)
    }

    pub(crate) fn snapshots(&self) -> MutexGuard<'_, ChangeTracker> {
        lock(&self.snapshots)
    }

    /// Start tracking `entity` at `version`, taking a fresh snapshot.
    pub(crate) fn track(&self, key: ObjectKey, entity: &EntityRef, version: u64) {
        let fields = entity.read().fields().clone();
        self.versions().record_load(key, version);
        self.snapshots().snapshot(key, &fields);
    }

    /// Drop everything the session manages. Returns how many instances were
    /// tracked.
    pub(crate) fn release(&self) -> usize {
        let mut map = self.identity_map();
        let tracked = map.len();
        map.clear();
        self.versions().clear();
        self.snapshots().clear();
        tracked
    }

    /// Turn loaded rows into managed instances.
    ///
    /// Rows whose identity is already managed yield the existing instance
    /// unchanged; new rows become entities with every association unloaded.
    pub(crate) fn materialize(&self, entity_type: &'static str, rows: Vec<Row>) -> Vec<EntityRef> {
        let mut map = self.identity_map();
        let mut versions = self.versions();
        let mut snapshots = self.snapshots();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key = ObjectKey::new(entity_type, row.key);
            if let Some(existing) = map.get(&key) {
                tracing::trace!(%key, "Identity map hit while materializing");
                out.push(existing);
                continue;
            }

            let version = row.version;
            let mut entity = Entity::from_row(entity_type, row);
            entity.set_owner(Some(self.owner()));
            snapshots.snapshot(key, entity.fields());
            versions.record_load(key, version);

            let handle = EntityRef::new(entity);
            // The key was absent a moment ago and the lock is still held.
            if map.put(key, handle.clone()).is_ok() {
                tracing::trace!(%key, version, "Materialized entity");
            }
            out.push(handle);
        }
        out
    }
}

impl<B: Backend> AssociationLoader for SessionContext<B> {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn load_association<'a>(
        &'a self,
        cx: &'a Cx,
        owner: &'a EntityRef,
        association: &'a str,
    ) -> LoadFuture<'a> {
        Box::pin(async move {
            let (entity_type, key, target_type, kind) = {
                let entity = owner.read();
                let entity_type = entity.entity_type();
                let Some(info) = entity.association_info(association) else {
                    return Outcome::Err(Error::UnknownAssociation {
                        entity_type,
                        association: association.to_string(),
                    });
                };
                (entity_type, entity.key(), info.target_type(), info.kind())
            };

            if !self.is_open() {
                return Outcome::Err(Error::DetachedAccess {
                    entity_type,
                    association: association.to_string(),
                });
            }
            // A new instance has no stored association to load.
            let Some(key) = key else {
                tracing::trace!(entity_type, association, "Owner not yet inserted");
                return Outcome::Ok(AssociationValue::empty(kind));
            };

            tracing::debug!(
                session = %self.id,
                entity_type,
                key = %key,
                association,
                "Loading association"
            );
            let rows = match self
                .backend
                .load_association(cx, entity_type, key, association)
                .await
            {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            let instances = self.materialize(target_type, rows);
            let value = match kind {
                AssociationKind::One => AssociationValue::One(instances.into_iter().next()),
                AssociationKind::Many => AssociationValue::Many(instances),
            };
            Outcome::Ok(value)
        })
    }
}
