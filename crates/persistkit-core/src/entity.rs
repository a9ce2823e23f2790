//! Entities and shared entity handles.
//!
//! An [`Entity`] is a dynamically shaped record: a type name, an optional key,
//! a version stamp, scalar fields and associations. Sessions hand out
//! [`EntityRef`]s, shared handles to one in-memory instance, so that every
//! lookup of the same identity within a session observes the same object.

use crate::association::{Association, AssociationState, AssociationValue, Owner, SessionId};
use crate::row::Row;
use crate::value::{Key, Value};
use crate::{Error, Result};
use asupersync::{Cx, Outcome};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A persistent record.
#[derive(Debug, Clone)]
pub struct Entity {
    entity_type: &'static str,
    key: Option<Key>,
    version: u64,
    fields: BTreeMap<String, Value>,
    associations: BTreeMap<String, Association>,
    owner: Option<Owner>,
}

impl Entity {
    /// Create a new, empty, never-persisted entity.
    #[must_use]
    pub fn new(entity_type: &'static str) -> Self {
        Self {
            entity_type,
            key: None,
            version: 0,
            fields: BTreeMap::new(),
            associations: BTreeMap::new(),
            owner: None,
        }
    }

    /// Build an entity from a backend row. All associations start unloaded.
    #[must_use]
    pub fn from_row(entity_type: &'static str, row: Row) -> Self {
        let associations = row
            .links
            .into_iter()
            .map(|(name, link)| (name, Association::unloaded(link.target_type, link.link)))
            .collect();
        Self {
            entity_type,
            key: Some(row.key),
            version: row.version,
            fields: row.fields,
            associations,
            owner: None,
        }
    }

    /// Set a field (builder pattern).
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set the key by hand (builder pattern).
    #[must_use]
    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    /// Add a loaded single-reference association (builder pattern).
    #[must_use]
    pub fn with_reference(
        mut self,
        name: impl Into<String>,
        target_type: &'static str,
        target: Option<EntityRef>,
    ) -> Self {
        self.associations.insert(
            name.into(),
            Association::loaded(target_type, AssociationValue::One(target)),
        );
        self
    }

    /// Add a loaded collection association (builder pattern).
    #[must_use]
    pub fn with_collection(
        mut self,
        name: impl Into<String>,
        target_type: &'static str,
        targets: Vec<EntityRef>,
    ) -> Self {
        self.associations.insert(
            name.into(),
            Association::loaded(target_type, AssociationValue::Many(targets)),
        );
        self
    }

    /// Entity type name.
    #[must_use]
    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    /// Identity, if assigned.
    #[must_use]
    pub fn key(&self) -> Option<Key> {
        self.key
    }

    /// Assign or clear the identity by hand.
    pub fn set_key(&mut self, key: Option<Key>) {
        self.key = key;
    }

    /// Version stamp read from (or last written to) storage.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Get a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// All scalar fields.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Set a field value, returning the previous one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Names of all associations.
    pub fn association_names(&self) -> impl Iterator<Item = &str> {
        self.associations.keys().map(String::as_str)
    }

    /// Raw association record.
    #[must_use]
    pub fn association_info(&self, name: &str) -> Option<&Association> {
        self.associations.get(name)
    }

    /// State of an association.
    #[must_use]
    pub fn association_state(&self, name: &str) -> Option<&AssociationState> {
        self.associations.get(name).map(Association::state)
    }

    /// Read a loaded association without triggering a load.
    ///
    /// Fails with `DetachedAccess` when the association is unloaded and the
    /// owning session is gone, and with `NotLoaded` when it is unloaded but
    /// could still be resolved through [`EntityRef::resolve`].
    pub fn association(&self, name: &str) -> Result<&AssociationValue> {
        let assoc = self.associations.get(name).ok_or_else(|| self.unknown(name))?;
        match assoc.state() {
            AssociationState::Loaded(value) => Ok(value),
            AssociationState::Unloaded(_) if self.is_attached() => Err(Error::NotLoaded {
                entity_type: self.entity_type,
                association: name.to_string(),
            }),
            AssociationState::Unloaded(_) => Err(self.detached_access(name)),
        }
    }

    /// Check whether an association is loaded.
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.associations.get(name).is_some_and(Association::is_loaded)
    }

    /// Current links of every association, for writing the row.
    #[must_use]
    pub fn links(&self) -> BTreeMap<String, crate::row::RowLink> {
        self.associations
            .iter()
            .map(|(name, assoc)| {
                (
                    name.clone(),
                    crate::row::RowLink::new(assoc.target_type(), assoc.link()),
                )
            })
            .collect()
    }

    /// The session that manages (or last managed) this entity.
    #[must_use]
    pub fn owner_session(&self) -> Option<SessionId> {
        self.owner.as_ref().map(Owner::session)
    }

    /// Whether the managing session is still alive and open.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.owner.as_ref().is_some_and(Owner::is_open)
    }

    /// Owner record (internal use by the session).
    #[must_use]
    pub fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    /// Attach to a session (internal use by the session).
    pub fn set_owner(&mut self, owner: Option<Owner>) {
        self.owner = owner;
    }

    /// Overwrite the version stamp (internal use by the version tracker).
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Replace all scalar fields (internal use by refresh and rollback).
    pub fn replace_fields(&mut self, fields: BTreeMap<String, Value>) {
        self.fields = fields;
    }

    /// Install a loaded value (internal use by the session and fetch planner).
    pub fn install(&mut self, name: &str, value: AssociationValue) -> Result<()> {
        let entity_type = self.entity_type;
        let assoc = self
            .associations
            .get_mut(name)
            .ok_or_else(|| Error::UnknownAssociation {
                entity_type,
                association: name.to_string(),
            })?;
        assoc.set_loaded(value);
        Ok(())
    }

    /// Reset every association to unloaded using the given links
    /// (internal use by refresh).
    pub fn reset_associations(&mut self, links: BTreeMap<String, crate::row::RowLink>) {
        self.associations = links
            .into_iter()
            .map(|(name, link)| (name, Association::unloaded(link.target_type, link.link)))
            .collect();
    }

    fn unknown(&self, name: &str) -> Error {
        Error::UnknownAssociation {
            entity_type: self.entity_type,
            association: name.to_string(),
        }
    }

    fn detached_access(&self, name: &str) -> Error {
        Error::DetachedAccess {
            entity_type: self.entity_type,
            association: name.to_string(),
        }
    }
}

/// A shared reference to one entity instance.
///
/// Cloning an `EntityRef` clones the handle, not the entity: all clones see
/// the same fields. Use [`EntityRef::ptr_eq`] to compare instances.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    /// Wrap a new entity in a handle.
    #[must_use]
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Lock for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if both handles point at the same instance.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Entity type name.
    #[must_use]
    pub fn entity_type(&self) -> &'static str {
        self.read().entity_type()
    }

    /// Identity, if assigned.
    #[must_use]
    pub fn key(&self) -> Option<Key> {
        self.read().key()
    }

    /// Version stamp.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.read().version()
    }

    /// Clone of a field value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.read().field(name).cloned()
    }

    /// Set a field value, returning the previous one.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.write().set(name, value)
    }

    /// Resolve an association, loading it through the owning session if needed.
    ///
    /// - Loaded: returns the cached value without touching the backend.
    /// - Unloaded, owning session open: one backend load, then cached.
    /// - Unloaded, owning session closed or gone: `DetachedAccess`.
    ///
    /// A failed load leaves the association unloaded.
    pub async fn resolve(&self, cx: &Cx, association: &str) -> Outcome<AssociationValue, Error> {
        let loader = {
            let entity = self.read();
            let Some(assoc) = entity.associations.get(association) else {
                return Outcome::Err(entity.unknown(association));
            };
            if let AssociationState::Loaded(value) = assoc.state() {
                tracing::trace!(
                    entity_type = entity.entity_type,
                    association,
                    "Association already loaded"
                );
                return Outcome::Ok(value.clone());
            }
            match entity.owner.as_ref().and_then(Owner::live_loader) {
                Some(loader) => loader,
                None => {
                    tracing::debug!(
                        entity_type = entity.entity_type,
                        key = ?entity.key,
                        association,
                        "Proxy touched after owning session closed"
                    );
                    return Outcome::Err(entity.detached_access(association));
                }
            }
        };

        let value = match loader.load_association(cx, self, association).await {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut entity = self.write();
        match entity.install(association, value.clone()) {
            Ok(()) => Outcome::Ok(value),
            Err(e) => Outcome::Err(e),
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Shallow on purpose: associations can form cycles.
        match self.0.try_read() {
            Ok(entity) => match entity.key {
                Some(key) => write!(f, "EntityRef({}#{})", entity.entity_type, key),
                None => write!(f, "EntityRef({}#new)", entity.entity_type),
            },
            Err(_) => write!(f, "EntityRef(<locked>)"),
        }
    }
}
