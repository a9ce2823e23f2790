//! Identity Map pattern for tracking unique entity instances per identity.
//!
//! The identity map guarantees that each stored row corresponds to exactly one
//! in-memory instance within a session:
//!
//! - **Uniqueness**: the same `(entity type, key)` always yields the same handle
//! - **Cache**: repeated lookups never reach the backend
//! - **Consistency**: a change made through one handle is visible through all
//!
//! Handles are [`EntityRef`]s (`Arc<RwLock<Entity>>`), so "the same instance"
//! means pointer equality, checked with [`EntityRef::ptr_eq`].
//!
//! # Example
//!
//! ```
//! use persistkit_core::{Entity, EntityRef, Key};
//! use persistkit_session::{IdentityMap, ObjectKey};
//!
//! let mut map = IdentityMap::new();
//! let author = EntityRef::new(Entity::new("author").with_key(Key(1)));
//! let key = ObjectKey::new("author", Key(1));
//!
//! map.put(key, author.clone()).unwrap();
//! assert!(EntityRef::ptr_eq(&map.get(&key).unwrap(), &author));
//! ```

use crate::ObjectKey;
use persistkit_core::{EntityRef, Error, Result};
use std::collections::HashMap;

/// Identity map for one session.
///
/// Keyed by [`ObjectKey`], so each entity type has its own key namespace.
/// The map never lazily evicts: an entry stays until it is removed or the
/// map is cleared.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, EntityRef>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Get the registered instance for an identity.
    ///
    /// The returned handle is a clone of the stored one, so modifications are
    /// shared.
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<EntityRef> {
        self.entries.get(key).cloned()
    }

    /// Register an instance.
    ///
    /// Registering the instance that is already present is a no-op. A
    /// different instance for an occupied identity fails with
    /// `DuplicateIdentity` and leaves the map unchanged.
    pub fn put(&mut self, key: ObjectKey, entity: EntityRef) -> Result<()> {
        if let Some(existing) = self.entries.get(&key) {
            if EntityRef::ptr_eq(existing, &entity) {
                return Ok(());
            }
            tracing::debug!(
                entity_type = key.entity_type(),
                key = %key.key(),
                "Refusing second instance for registered identity"
            );
            return Err(Error::DuplicateIdentity {
                entity_type: key.entity_type(),
                key: key.key(),
            });
        }
        self.entries.insert(key, entity);
        Ok(())
    }

    /// Check if an identity is registered.
    #[must_use]
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Check if this exact instance is the one registered for its identity.
    #[must_use]
    pub fn contains_instance(&self, key: &ObjectKey, entity: &EntityRef) -> bool {
        self.entries
            .get(key)
            .is_some_and(|existing| EntityRef::ptr_eq(existing, entity))
    }

    /// Remove an identity, returning the instance that was registered.
    pub fn remove(&mut self, key: &ObjectKey) -> Option<EntityRef> {
        self.entries.remove(key)
    }

    /// Iterate over all registered identities and instances.
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &EntityRef)> {
        self.entries.iter()
    }

    /// Clear all entries from the identity map.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Get the number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistkit_core::{Entity, Key};

    fn author(key: u64, name: &str) -> EntityRef {
        EntityRef::new(Entity::new("author").with_key(Key(key)).with_field("name", name))
    }

    #[test]
    fn test_put_and_get_same_instance() {
        let mut map = IdentityMap::new();
        let a = author(1, "Thorben");
        let key = ObjectKey::new("author", Key(1));
        map.put(key, a.clone()).unwrap();

        let fetched = map.get(&key).unwrap();
        assert!(EntityRef::ptr_eq(&fetched, &a));
        assert!(map.contains(&key));
        assert!(map.contains_instance(&key, &a));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_modifications_visible_through_all_handles() {
        let mut map = IdentityMap::new();
        let a = author(1, "Thorben");
        let key = ObjectKey::new("author", Key(1));
        map.put(key, a.clone()).unwrap();

        a.set("name", "Changed");
        assert_eq!(
            map.get(&key).unwrap().get("name").unwrap().as_str(),
            Some("Changed")
        );
    }

    #[test]
    fn test_put_same_instance_twice_is_noop() {
        let mut map = IdentityMap::new();
        let a = author(1, "Thorben");
        let key = ObjectKey::new("author", Key(1));
        map.put(key, a.clone()).unwrap();
        map.put(key, a).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_put_different_instance_fails() {
        let mut map = IdentityMap::new();
        let key = ObjectKey::new("author", Key(1));
        let first = author(1, "Thorben");
        map.put(key, first.clone()).unwrap();

        let err = map.put(key, author(1, "Impostor")).unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity { key: Key(1), .. }));
        assert!(map.contains_instance(&key, &first));
    }

    #[test]
    fn test_types_have_separate_namespaces() {
        let mut map = IdentityMap::new();
        map.put(ObjectKey::new("author", Key(1)), author(1, "A"))
            .unwrap();
        map.put(
            ObjectKey::new("book", Key(1)),
            EntityRef::new(Entity::new("book").with_key(Key(1))),
        )
        .unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut map = IdentityMap::new();
        let key = ObjectKey::new("author", Key(1));
        map.put(key, author(1, "A")).unwrap();
        map.put(ObjectKey::new("author", Key(2)), author(2, "B"))
            .unwrap();

        assert!(map.remove(&key).is_some());
        assert!(map.remove(&key).is_none());
        assert!(!map.contains(&key));

        map.clear();
        assert!(map.is_empty());
    }
}
