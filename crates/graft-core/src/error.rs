//! Error types for graft operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all graft operations.
#[derive(Debug)]
pub enum Error {
    /// Optimistic-lock conflict: the row moved since the source was read
    StaleState(StaleStateError),
    /// Requested identifier or runtime type disagrees with the entity
    IdentityMismatch(IdentityMismatchError),
    /// Operation is not legal for the instance's current lifecycle state
    IllegalState(IllegalStateError),
    /// No row exists for a reference that had to resolve
    NotFound(NotFoundError),
    /// Listener registration or instantiation failed
    Registration(RegistrationError),
    /// An event group was requested for a kind the registry never seeded
    UnregisteredEventType(String),
    /// Metamodel or relational mapping is inconsistent
    Mapping(MappingError),
    /// A value cannot be represented by its attribute's type
    Type(TypeError),
    /// Identifier generator could not produce a value
    IdentifierGeneration(IdentifierGenerationError),
    /// Storage layer failure
    Storage(StorageError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct StaleStateError {
    pub entity: String,
    pub id: Value,
    pub message: String,
}

#[derive(Debug)]
pub struct IdentityMismatchError {
    pub kind: IdentityMismatchKind,
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMismatchKind {
    /// Caller-supplied id differs from the instance's own id
    RequestedId,
    /// Loaded instance is of a different entity type than expected
    WrongClass,
}

#[derive(Debug)]
pub struct IllegalStateError {
    pub kind: IllegalStateKind,
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalStateKind {
    /// Instance is scheduled for deletion in this session
    ObjectDeleted,
    /// A "detached" instance turned out to be the managed instance itself
    NotDetached,
    /// Detached instance passed to persist
    DetachedPersist,
    /// Another instance with the same identity is already managed
    NonUniqueObject,
    /// Flushed state references an unsaved, unmanaged instance
    TransientReference,
    /// Instance is not associated with this session
    NotManaged,
    /// Several source instances merged onto one managed instance
    MultipleRepresentations,
    /// Internal merge bookkeeping was contradicted
    MergeContextConflict,
    /// Session was closed
    SessionClosed,
    /// Version counter has no successor within its type
    VersionOverflow,
}

#[derive(Debug)]
pub struct NotFoundError {
    pub entity: String,
    pub id: Value,
}

#[derive(Debug)]
pub struct RegistrationError {
    pub listener: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct MappingError {
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub attribute: Option<String>,
}

#[derive(Debug)]
pub struct IdentifierGenerationError {
    pub entity: String,
    pub message: String,
}

#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Unique or foreign key constraint violated
    Constraint,
    /// Deadlock detected (retry may succeed)
    Deadlock,
    /// Backend unavailable
    Unavailable,
    /// Other storage failure
    Other,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Shorthand for an [`IllegalStateError`].
    pub fn illegal_state(
        kind: IllegalStateKind,
        entity: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::IllegalState(IllegalStateError {
            kind,
            entity: entity.map(str::to_string),
            message: message.into(),
        })
    }

    /// Shorthand for a [`MappingError`].
    pub fn mapping(entity: Option<&str>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity: entity.map(str::to_string),
            message: message.into(),
        })
    }

    /// Is this an optimistic-lock failure?
    pub fn is_stale_state(&self) -> bool {
        matches!(self, Error::StaleState(_))
    }

    /// Is this a retryable error?
    ///
    /// The engine never retries by itself; this is a hint for the
    /// transaction layer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StaleState(_) => true,
            Error::Storage(e) => matches!(e.kind, StorageErrorKind::Deadlock),
            _ => false,
        }
    }

    /// The entity name this error concerns, if any.
    pub fn entity_name(&self) -> Option<&str> {
        match self {
            Error::StaleState(e) => Some(&e.entity),
            Error::IdentityMismatch(e) => Some(&e.entity),
            Error::IllegalState(e) => e.entity.as_deref(),
            Error::NotFound(e) => Some(&e.entity),
            Error::Mapping(e) => e.entity.as_deref(),
            Error::IdentifierGeneration(e) => Some(&e.entity),
            _ => None,
        }
    }

    /// The illegal-state kind, when this is an illegal-state error.
    pub fn illegal_state_kind(&self) -> Option<IllegalStateKind> {
        match self {
            Error::IllegalState(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StaleState(e) => write!(
                f,
                "Row was updated or deleted by another transaction: [{}#{}] {}",
                e.entity, e.id, e.message
            ),
            Error::IdentityMismatch(e) => write!(f, "Identity mismatch for {}: {}", e.entity, e.message),
            Error::IllegalState(e) => match &e.entity {
                Some(entity) => write!(f, "Illegal state for {}: {}", entity, e.message),
                None => write!(f, "Illegal state: {}", e.message),
            },
            Error::NotFound(e) => write!(f, "No row with the given identifier exists: [{}#{}]", e.entity, e.id),
            Error::Registration(e) => {
                write!(f, "Unable to register listener {}: {}", e.listener, e.message)
            }
            Error::UnregisteredEventType(name) => {
                write!(f, "Unrecognized listener group for event type: {}", name)
            }
            Error::Mapping(e) => match &e.entity {
                Some(entity) => write!(f, "Mapping error in {}: {}", entity, e.message),
                None => write!(f, "Mapping error: {}", e.message),
            },
            Error::Type(e) => match &e.attribute {
                Some(attribute) => write!(
                    f,
                    "Type error in attribute '{}': expected {}, found {}",
                    attribute, e.expected, e.actual
                ),
                None => write!(f, "Type error: expected {}, found {}", e.expected, e.actual),
            },
            Error::IdentifierGeneration(e) => {
                write!(f, "Identifier generation failed for {}: {}", e.entity, e.message)
            }
            Error::Storage(e) => write!(f, "Storage error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Registration(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<StaleStateError> for Error {
    fn from(err: StaleStateError) -> Self {
        Error::StaleState(err)
    }
}

impl From<IdentityMismatchError> for Error {
    fn from(err: IdentityMismatchError) -> Self {
        Error::IdentityMismatch(err)
    }
}

impl From<IllegalStateError> for Error {
    fn from(err: IllegalStateError) -> Self {
        Error::IllegalState(err)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

impl From<RegistrationError> for Error {
    fn from(err: RegistrationError) -> Self {
        Error::Registration(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for graft operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_stale_state_is_retryable() {
        let err = Error::StaleState(StaleStateError {
            entity: "Order".to_string(),
            id: Value::BigInt(7),
            message: "version 3 != 4".to_string(),
        });
        assert!(err.is_stale_state());
        assert!(err.is_retryable());
        assert_eq!(err.entity_name(), Some("Order"));
        assert!(err.to_string().contains("[Order#7]"));
    }

    #[test]
    fn test_storage_deadlock_is_retryable_but_constraint_is_not() {
        let deadlock = Error::Storage(StorageError {
            kind: StorageErrorKind::Deadlock,
            message: "deadlock".to_string(),
            source: None,
        });
        let constraint = Error::Storage(StorageError {
            kind: StorageErrorKind::Constraint,
            message: "duplicate key".to_string(),
            source: None,
        });
        assert!(deadlock.is_retryable());
        assert!(!constraint.is_retryable());
        assert!(!constraint.is_stale_state());
    }

    #[test]
    fn test_registration_error_exposes_source() {
        let inner = std::io::Error::other("boom");
        let err = Error::Registration(RegistrationError {
            listener: "AuditListener".to_string(),
            message: "instantiation failed".to_string(),
            source: Some(Box::new(inner)),
        });
        assert!(err.source().is_some());
        assert!(err.to_string().contains("AuditListener"));
    }

    #[test]
    fn test_illegal_state_kind_accessor() {
        let err = Error::illegal_state(IllegalStateKind::ObjectDeleted, Some("Item"), "deleted");
        assert_eq!(err.illegal_state_kind(), Some(IllegalStateKind::ObjectDeleted));
        assert_eq!(err.entity_name(), Some("Item"));
        assert_eq!(Error::Custom("x".into()).illegal_state_kind(), None);
    }

    #[test]
    fn test_type_error_names_the_attribute() {
        let err = Error::Type(TypeError {
            expected: "integer",
            actual: "TEXT".to_string(),
            attribute: Some("version".to_string()),
        });
        assert_eq!(
            err.to_string(),
            "Type error in attribute 'version': expected integer, found TEXT"
        );
        assert!(!err.is_retryable());
    }
}
