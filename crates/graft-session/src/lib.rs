//! Sessions, merge and event dispatch for graft.
//!
//! `graft-session` is the **unit-of-work layer**. It manages the instances
//! described by a `graft-core` metamodel: identity, versions, cascades,
//! merges of detached graphs, and the listeners every operation runs
//! through.
//!
//! # Role In The Architecture
//!
//! - **Persistence context**: one managed instance per entity key.
//! - **Versioning**: seed and increment of optimistic-lock versions.
//! - **Cascades**: operations propagated along associations at fixed points.
//! - **Merge**: detached or transient graphs copied onto managed instances.
//! - **Events**: typed listener groups, replaceable per factory.
//! - **Flush**: dirty checking and an ordered action queue against [`Storage`].
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder(metamodel).build()?;
//! let mut session = factory.open_session();
//!
//! let order = session.get("Order", 7_i64)?.expect("order exists");
//! let managed = session.merge(detached_line)?;
//! session.commit()?;
//! ```

pub mod action_queue;
pub mod cascade;
pub mod config;
pub mod event;
pub mod factory;
pub mod id_generator;
pub mod listeners;
pub mod merge;
pub mod persistence_context;
pub mod session;
pub mod statistics;
pub mod storage;
pub mod versioning;

pub use action_queue::{ActionQueue, FlushResult};
pub use cascade::{CascadeContext, CascadePoint, CascadingAction};
pub use config::{EntityCopyPolicy, Settings};
pub use event::{EventKind, EventListenerRegistry, EventType};
pub use factory::{Clock, SessionFactory, SessionFactoryBuilder, SystemClock};
pub use id_generator::{IdentifierGenerator, SequenceIdentifierGenerator};
pub use merge::{EntityCopyObserver, MergeContext};
pub use persistence_context::{EntityEntry, EntityKey, EntityStatus, PersistenceContext};
pub use session::{Session, SessionDebugInfo};
pub use statistics::{Statistics, StatisticsSink, StatisticsSnapshot};
pub use storage::{MemoryStorage, Storage, StoredRow};
