//! Session factory: the explicit, non-global entry point.
//!
//! A factory owns the backend source, the default [`SessionConfig`] and the
//! registry of named fetch specs. Every session it opens gets its own backend
//! connection and a unique [`SessionId`].

use crate::{Session, SessionConfig};
use persistkit_core::{BackendSource, Error, FetchSpec, Result, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Named fetch specs shared by a factory and its sessions.
#[derive(Debug, Clone, Default)]
pub(crate) struct FetchSpecRegistry(Arc<RwLock<HashMap<String, Arc<FetchSpec>>>>);

impl FetchSpecRegistry {
    pub(crate) fn register(&self, spec: FetchSpec) -> Option<Arc<FetchSpec>> {
        let mut specs = self.0.write().unwrap_or_else(PoisonError::into_inner);
        specs.insert(spec.name().to_string(), Arc::new(spec))
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<FetchSpec>> {
        let specs = self.0.read().unwrap_or_else(PoisonError::into_inner);
        specs.get(name).cloned()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let specs = self.0.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = specs.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Hands out sessions over one backend source.
///
/// # Example
///
/// ```ignore
/// let factory = SessionFactory::new(store);
/// factory.register_fetch_spec(FetchSpec::new("graph.AuthorBooks", "author").include("books"));
///
/// let mut session = factory.open_session()?;
/// let author = session.find_with_named(&cx, "author", Key(1), "graph.AuthorBooks").await;
/// session.close()?;
/// ```
pub struct SessionFactory<S: BackendSource> {
    source: S,
    config: SessionConfig,
    fetch_specs: FetchSpecRegistry,
    next_session: AtomicU64,
    closed: AtomicBool,
}

impl<S: BackendSource> SessionFactory<S> {
    /// Create a factory with the default session configuration.
    pub fn new(source: S) -> Self {
        Self::with_config(source, SessionConfig::default())
    }

    /// Create a factory with a custom session configuration.
    pub fn with_config(source: S, config: SessionConfig) -> Self {
        Self {
            source,
            config,
            fetch_specs: FetchSpecRegistry::default(),
            next_session: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// The backend source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Configuration given to new sessions.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a named fetch spec, replacing any spec with the same name.
    ///
    /// Returns the replaced spec. Open sessions see the new spec immediately.
    pub fn register_fetch_spec(&self, spec: FetchSpec) -> Option<Arc<FetchSpec>> {
        tracing::debug!(name = spec.name(), root_type = spec.root_type(), "Registering fetch spec");
        self.fetch_specs.register(spec)
    }

    /// Look up a registered fetch spec.
    pub fn fetch_spec(&self, name: &str) -> Option<Arc<FetchSpec>> {
        self.fetch_specs.get(name)
    }

    /// Names of all registered fetch specs, sorted.
    pub fn fetch_spec_names(&self) -> Vec<String> {
        self.fetch_specs.names()
    }

    /// Open a new session with its own backend connection.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn open_session(&self) -> Result<Session<S::Backend>> {
        if self.is_closed() {
            return Err(Error::FactoryClosed);
        }
        let backend = self.source.connect()?;
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        tracing::info!(session = %id, "Opened session");
        Ok(Session::new(
            id,
            backend,
            self.config.clone(),
            self.fetch_specs.clone(),
        ))
    }

    /// Close the factory. Sessions already open are unaffected.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Session factory closed");
        }
    }

    /// Check whether the factory has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
