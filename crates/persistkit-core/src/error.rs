//! Error types for persistkit operations.

use crate::value::Key;
use std::fmt;

/// The primary error type for all persistkit operations.
///
/// Every contract violation is a distinct variant so callers can branch on
/// conflict vs. detachment vs. not-found without inspecting messages.
#[derive(Debug)]
pub enum Error {
    /// No row exists for the requested identity.
    NotFound {
        entity_type: &'static str,
        key: Key,
    },
    /// An unloaded association was touched after its owning session closed.
    DetachedAccess {
        entity_type: &'static str,
        association: String,
    },
    /// An unloaded association was read without resolving it first.
    NotLoaded {
        entity_type: &'static str,
        association: String,
    },
    /// The session has been closed.
    SessionClosed,
    /// A different instance is already registered for this identity.
    DuplicateIdentity {
        entity_type: &'static str,
        key: Key,
    },
    /// `persist` was given an entity whose identity was set outside any session.
    IdentityAlreadyAssigned {
        entity_type: &'static str,
        key: Key,
    },
    /// The entity belongs to another (typically closed) session.
    DetachedEntity {
        entity_type: &'static str,
        key: Key,
    },
    /// A conditional write found a different stored version.
    OptimisticConflict(ConflictInfo),
    /// The backend could not be reached or timed out.
    BackendUnavailable(BackendError),
    /// The entity has no association with this name.
    UnknownAssociation {
        entity_type: &'static str,
        association: String,
    },
    /// A fetch spec does not apply to the requested entity type.
    InvalidFetchSpec(String),
    /// The session factory has been closed.
    FactoryClosed,
    /// Custom error with message
    Custom(String),
}

/// Details of an optimistic-lock conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    /// Type of the offending entity.
    pub entity_type: &'static str,
    /// Identity of the offending entity.
    pub key: Key,
    /// Version this session read and expected to overwrite.
    pub expected_version: u64,
    /// Version found in storage, `None` if the row no longer exists.
    pub actual_version: Option<u64>,
}

/// Failure reported by a backend adapter.
///
/// Always retryable: the session keeps its pending changes.
#[derive(Debug)]
pub struct BackendError {
    /// What went wrong.
    pub kind: BackendErrorKind,
    /// Human-readable detail from the adapter.
    pub message: String,
    /// Underlying driver or I/O error, if any.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Category of a [`BackendError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Backend refused or could not accept the request
    Unavailable,
    /// Backend did not answer in time
    Timeout,
    /// Connection to the backend was lost
    Disconnected,
}

impl BackendError {
    /// Create a backend error of the given kind.
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl Error {
    /// Shorthand for a `BackendUnavailable` error.
    pub fn backend(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Error::BackendUnavailable(BackendError::new(kind, message))
    }

    /// Is this an optimistic-lock conflict?
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::OptimisticConflict(_))
    }

    /// Is this a detachment error (closed-session proxy or foreign entity)?
    pub fn is_detached(&self) -> bool {
        matches!(self, Error::DetachedAccess { .. } | Error::DetachedEntity { .. })
    }

    /// Can the caller reasonably retry the same operation?
    ///
    /// Conflicts need a reload before the retry; backend outages do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::OptimisticConflict(_) | Error::BackendUnavailable(_)
        )
    }

    /// The conflict details, if this is a conflict.
    pub fn conflict(&self) -> Option<&ConflictInfo> {
        match self {
            Error::OptimisticConflict(info) => Some(info),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.actual_version {
            Some(actual) => write!(
                f,
                "{}#{} expected version {} but found {}",
                self.entity_type, self.key, self.expected_version, actual
            ),
            None => write!(
                f,
                "{}#{} expected version {} but the row no longer exists",
                self.entity_type, self.key, self.expected_version
            ),
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErrorKind::Unavailable => write!(f, "unavailable"),
            BackendErrorKind::Timeout => write!(f, "timeout"),
            BackendErrorKind::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound { entity_type, key } => {
                write!(f, "No {} row with key {}", entity_type, key)
            }
            Error::DetachedAccess {
                entity_type,
                association,
            } => write!(
                f,
                "Cannot load {}.{}: the owning session is closed",
                entity_type, association
            ),
            Error::NotLoaded {
                entity_type,
                association,
            } => write!(
                f,
                "{}.{} is not loaded; resolve it through the session first",
                entity_type, association
            ),
            Error::SessionClosed => write!(f, "Session is closed"),
            Error::DuplicateIdentity { entity_type, key } => write!(
                f,
                "Another {} instance is already managed with key {}",
                entity_type, key
            ),
            Error::IdentityAlreadyAssigned { entity_type, key } => write!(
                f,
                "Cannot persist {} with preassigned key {}",
                entity_type, key
            ),
            Error::DetachedEntity { entity_type, key } => write!(
                f,
                "{}#{} belongs to another session",
                entity_type, key
            ),
            Error::OptimisticConflict(info) => write!(f, "Optimistic lock conflict: {}", info),
            Error::BackendUnavailable(e) => {
                write!(f, "Backend unavailable ({}): {}", e.kind, e.message)
            }
            Error::UnknownAssociation {
                entity_type,
                association,
            } => write!(f, "{} has no association '{}'", entity_type, association),
            Error::InvalidFetchSpec(msg) => write!(f, "Invalid fetch spec: {}", msg),
            Error::FactoryClosed => write!(f, "Session factory is closed"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::BackendUnavailable(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

/// Result type alias for persistkit operations.
pub type Result<T> = std::result::Result<T, Error>;
