//! Default event listeners.
//!
//! Every session operation is implemented by one of these listeners. They
//! are registered on each factory's registry before user configuration runs,
//! so applications can wrap or replace them.

pub mod common;
pub mod delete;
pub mod evict;
pub mod flush;
pub mod load;
pub mod lock;
pub mod merge;
pub mod persist;
pub mod refresh;

pub use common::EntityState;
pub use delete::DefaultDeleteEventListener;
pub use evict::DefaultEvictEventListener;
pub use flush::DefaultFlushEventListener;
pub use load::DefaultLoadEventListener;
pub use lock::DefaultLockEventListener;
pub use merge::DefaultMergeEventListener;
pub use persist::DefaultPersistEventListener;
pub use refresh::DefaultRefreshEventListener;

use crate::event::{
    DELETE, EVICT, EventListenerRegistry, FLUSH, LOAD, LOCK, MERGE, PERSIST, REFRESH,
};
use graft_core::Result;

/// Install the default listener of every operation event.
pub fn register_default_listeners(registry: &mut EventListenerRegistry) -> Result<()> {
    registry.set_listener_class::<_, DefaultLoadEventListener>(&LOAD)?;
    registry.set_listener_class::<_, DefaultPersistEventListener>(&PERSIST)?;
    registry.set_listener_class::<_, DefaultMergeEventListener>(&MERGE)?;
    registry.set_listener_class::<_, DefaultDeleteEventListener>(&DELETE)?;
    registry.set_listener_class::<_, DefaultEvictEventListener>(&EVICT)?;
    registry.set_listener_class::<_, DefaultRefreshEventListener>(&REFRESH)?;
    registry.set_listener_class::<_, DefaultLockEventListener>(&LOCK)?;
    registry.set_listener_class::<_, DefaultFlushEventListener>(&FLUSH)?;
    tracing::debug!("Registered default event listeners");
    Ok(())
}
