//! Association state for lazily loaded relationships.
//!
//! Every association on an [`Entity`](crate::Entity) is in exactly one of two
//! states:
//!
//! - **Unloaded**: only the target identities are known (a proxy).
//! - **Loaded**: the related instances have been materialized and cached.
//!
//! An unloaded association can only be resolved through the session that
//! owns the entity, and only while that session is open. The session is
//! reached through an [`AssociationLoader`], held weakly so a dropped session
//! never keeps its backend alive through a stray entity.

use crate::entity::EntityRef;
use crate::value::Key;
use crate::Error;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

/// Cardinality of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// Single reference (many-to-one / one-to-one).
    One,
    /// Collection of references (one-to-many / many-to-many).
    Many,
}

/// Target identities of an association as stored in a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Link {
    /// Single reference; `None` is a null foreign key.
    One(Option<Key>),
    /// Ordered collection of references.
    Many(Vec<Key>),
}

impl Link {
    /// Cardinality of this link.
    #[must_use]
    pub fn kind(&self) -> AssociationKind {
        match self {
            Link::One(_) => AssociationKind::One,
            Link::Many(_) => AssociationKind::Many,
        }
    }

    /// All target keys, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Link::One(key) => key.iter().copied().collect(),
            Link::Many(keys) => keys.clone(),
        }
    }
}

/// Resolved value of an association.
#[derive(Debug, Clone)]
pub enum AssociationValue {
    /// A single related instance, or `None` for a null reference.
    One(Option<EntityRef>),
    /// The related instances, in link order.
    Many(Vec<EntityRef>),
}

impl AssociationValue {
    /// An empty value of the given cardinality.
    #[must_use]
    pub fn empty(kind: AssociationKind) -> Self {
        match kind {
            AssociationKind::One => AssociationValue::One(None),
            AssociationKind::Many => AssociationValue::Many(Vec::new()),
        }
    }

    /// Cardinality of this value.
    #[must_use]
    pub fn kind(&self) -> AssociationKind {
        match self {
            AssociationValue::One(_) => AssociationKind::One,
            AssociationValue::Many(_) => AssociationKind::Many,
        }
    }

    /// Number of related instances.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            AssociationValue::One(one) => usize::from(one.is_some()),
            AssociationValue::Many(many) => many.len(),
        }
    }

    /// True if there are no related instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the related instances.
    pub fn iter(&self) -> std::slice::Iter<'_, EntityRef> {
        match self {
            AssociationValue::One(one) => one.as_slice().iter(),
            AssociationValue::Many(many) => many.iter(),
        }
    }

    /// The single related instance, if this is a `One`.
    #[must_use]
    pub fn as_one(&self) -> Option<&EntityRef> {
        match self {
            AssociationValue::One(one) => one.as_ref(),
            AssociationValue::Many(_) => None,
        }
    }

    /// The related instances, if this is a `Many`.
    #[must_use]
    pub fn as_many(&self) -> Option<&[EntityRef]> {
        match self {
            AssociationValue::One(_) => None,
            AssociationValue::Many(many) => Some(many),
        }
    }

    /// Link describing the current targets.
    ///
    /// Instances that have no identity yet are skipped.
    #[must_use]
    pub fn to_link(&self) -> Link {
        match self {
            AssociationValue::One(one) => Link::One(one.as_ref().and_then(EntityRef::key)),
            AssociationValue::Many(many) => {
                Link::Many(many.iter().filter_map(EntityRef::key).collect())
            }
        }
    }
}

/// State of a single association.
#[derive(Debug, Clone)]
pub enum AssociationState {
    /// Not fetched yet; only the target identities are known.
    Unloaded(Link),
    /// Fetched and cached.
    Loaded(AssociationValue),
}

/// An association field on an entity.
#[derive(Debug, Clone)]
pub struct Association {
    target_type: &'static str,
    kind: AssociationKind,
    state: AssociationState,
}

impl Association {
    /// Create an unloaded association (proxy) for the given link.
    #[must_use]
    pub fn unloaded(target_type: &'static str, link: Link) -> Self {
        Self {
            target_type,
            kind: link.kind(),
            state: AssociationState::Unloaded(link),
        }
    }

    /// Create an association with an already-loaded value.
    #[must_use]
    pub fn loaded(target_type: &'static str, value: AssociationValue) -> Self {
        Self {
            target_type,
            kind: value.kind(),
            state: AssociationState::Loaded(value),
        }
    }

    /// Entity type on the other side.
    #[must_use]
    pub fn target_type(&self) -> &'static str {
        self.target_type
    }

    /// Cardinality.
    #[must_use]
    pub fn kind(&self) -> AssociationKind {
        self.kind
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &AssociationState {
        &self.state
    }

    /// Check if the association has been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self.state, AssociationState::Loaded(_))
    }

    /// Get the loaded value (None if still unloaded).
    #[must_use]
    pub fn get(&self) -> Option<&AssociationValue> {
        match &self.state {
            AssociationState::Loaded(value) => Some(value),
            AssociationState::Unloaded(_) => None,
        }
    }

    /// Link describing the targets, loaded or not.
    #[must_use]
    pub fn link(&self) -> Link {
        match &self.state {
            AssociationState::Unloaded(link) => link.clone(),
            AssociationState::Loaded(value) => value.to_link(),
        }
    }

    /// Set the loaded value (internal use by the session and fetch planner).
    pub fn set_loaded(&mut self, value: AssociationValue) {
        self.state = AssociationState::Loaded(value);
    }
}

/// Identifier of a session, unique within one session factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Boxed future returned by [`AssociationLoader::load_association`].
pub type LoadFuture<'a> =
    Pin<Box<dyn Future<Output = Outcome<AssociationValue, Error>> + Send + 'a>>;

/// Minimal session interface needed to resolve association proxies.
///
/// This trait lives in `persistkit-core` to avoid circular dependencies: the
/// concrete session is defined in `persistkit-session`, which provides the
/// implementation. It is object-safe so entities can hold it type-erased.
pub trait AssociationLoader: Send + Sync {
    /// Whether the session is still open.
    fn is_open(&self) -> bool;

    /// Load one association of `owner` through the backend, materializing the
    /// related rows through the session's identity map.
    fn load_association<'a>(
        &'a self,
        cx: &'a Cx,
        owner: &'a EntityRef,
        association: &'a str,
    ) -> LoadFuture<'a>;
}

/// Back-reference from an entity to the session that manages it.
#[derive(Clone)]
pub struct Owner {
    session: SessionId,
    loader: Weak<dyn AssociationLoader>,
    evicted: bool,
}

impl Owner {
    /// Create an owner record for a session.
    pub fn new(session: SessionId, loader: Weak<dyn AssociationLoader>) -> Self {
        Self {
            session,
            loader,
            evicted: false,
        }
    }

    /// The same owner after the instance was evicted: it still identifies the
    /// session, but never resolves proxies again.
    #[must_use]
    pub fn evicted(&self) -> Self {
        Self {
            evicted: true,
            ..self.clone()
        }
    }

    /// The owning session's id. Ids are only unique within one factory; use
    /// [`Owner::belongs_to`] to test ownership.
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Whether this owner record was issued by the session behind `loader`.
    #[must_use]
    pub fn belongs_to(&self, loader: &Weak<dyn AssociationLoader>) -> bool {
        Weak::ptr_eq(&self.loader, loader)
    }

    /// The loader, if the owning session is still alive and open.
    #[must_use]
    pub fn live_loader(&self) -> Option<Arc<dyn AssociationLoader>> {
        if self.evicted {
            return None;
        }
        self.loader.upgrade().filter(|loader| loader.is_open())
    }

    /// Whether the owning session is still alive and open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.live_loader().is_some()
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("session", &self.session)
            .field("open", &self.is_open())
            .field("evicted", &self.evicted)
            .finish()
    }
}
