//! Core types for graft.
//!
//! `graft-core` is the **foundation layer** of the workspace. It defines the
//! static description of entity types and the in-memory objects the session
//! layer manages.
//!
//! # Role In The Architecture
//!
//! - **Values**: [`Value`] is the disassembled form of every attribute.
//! - **Errors**: [`Error`] and [`Result`] are shared by every crate.
//! - **Metamodel**: [`EntityDescriptor`]s, attribute types, version policies
//!   and per-lock-mode loaders, assembled once by [`MetamodelBuilder`].
//! - **Relational model**: tables, columns and sequences registered at boot.
//! - **Instances**: [`EntityInstance`], [`EntityReference`] and [`LazyProxy`].

pub mod error;
pub mod identifiers;
pub mod instance;
pub mod metamodel;
pub mod relational;
pub mod value;

pub use error::{
    ConfigError, Error, IdentifierGenerationError, IdentityMismatchError, IdentityMismatchKind,
    IllegalStateError, IllegalStateKind, MappingError, NotFoundError, RegistrationError, Result,
    StaleStateError, StorageError, StorageErrorKind, TypeError,
};
pub use identifiers::{quote_ident, unquote_ident};
pub use instance::{
    DirtinessTracking, EntityInstance, EntityRef, EntityReference, Indirection, InstanceHandle,
    LazyProxy, PropertyValue, ProxyRef,
};
pub use metamodel::{
    AttributeDescriptor, AttributeKind, AttributeType, CascadeAction, CascadeStyle,
    EntityDescriptor, EntityDescriptorBuilder, EntityLoader, ForeignKeyDirection, IdGeneration,
    IdentifierUnsaved, LockMode, Metamodel, MetamodelBuilder, VersionContext, VersionSupport,
    VersionUnsaved,
};
pub use relational::{Column, DatabaseModel, Identifier, QualifiedName, Sequence, Table};
pub use value::Value;
