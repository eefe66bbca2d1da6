//! graft - a unit-of-work, merge and optimistic-versioning engine for
//! object graphs.
//!
//! This crate re-exports the workspace:
//!
//! - [`graft_core`]: values, errors, the metamodel and in-memory instances
//! - [`graft_session`]: sessions, cascades, merge, flush and listeners
//!
//! # Quick Start
//!
//! ```ignore
//! use graft::prelude::*;
//! use graft::metamodel::{IntegerType, LongType, StringType};
//!
//! let metamodel = Metamodel::builder()
//!     .entity(
//!         EntityDescriptor::builder("Customer")
//!             .id("id", LongType)
//!             .sequence_generated("customer_seq")
//!             .version("version", IntegerType)
//!             .basic("name", StringType)
//!             .build()?,
//!     )
//!     .build()?;
//! let factory = SessionFactory::builder(metamodel).build()?;
//!
//! let mut session = factory.open_session();
//! let customer = EntityInstance::new(factory.metamodel().entity("Customer")?);
//! customer.set_basic("name", "Ada")?;
//! session.persist(&customer)?;
//! session.commit()?;
//!
//! // Later, in another session: reattach a modified copy.
//! let mut session = factory.open_session();
//! let managed = session.merge(&customer)?;
//! session.commit()?;
//! ```
//!
//! # Features
//!
//! - **Identity**: one managed instance per entity key and session
//! - **Merge**: detached and transient graphs, with version checks
//! - **Cascades**: per-association styles at defined points of each operation
//! - **Events**: every operation dispatched to replaceable listener groups
//! - **Versioning**: numeric and timestamp versions, seeded and incremented

pub use graft_core::{
    AttributeDescriptor, AttributeKind, CascadeAction, CascadeStyle, DirtinessTracking,
    EntityDescriptor, EntityInstance, EntityRef, EntityReference, Error, ForeignKeyDirection,
    IdentityMismatchKind, IllegalStateKind, Indirection, InstanceHandle, LazyProxy, LockMode,
    Metamodel, PropertyValue, Result, Sequence, Value, metamodel,
};
pub use graft_session::{
    Clock, EntityCopyPolicy, EntityEntry, EntityStatus, FlushResult, MemoryStorage, Session,
    SessionDebugInfo, SessionFactory, SessionFactoryBuilder, Settings, Statistics, StatisticsSink,
    Storage, event, listeners,
};

pub mod prelude {
    pub use crate::{
        // Metamodel
        AttributeDescriptor,
        CascadeStyle,
        EntityDescriptor,
        // Instances
        EntityInstance,
        EntityRef,
        EntityReference,
        // Errors
        Error,
        Indirection,
        LockMode,
        Metamodel,
        Result,
        // Session
        Session,
        SessionFactory,
        Settings,
        Value,
    };
}
