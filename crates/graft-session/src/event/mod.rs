//! Event dispatch.
//!
//! Every session operation is raised as an event and handed to the ordered
//! listener group registered for its kind. The default listeners in
//! [`crate::listeners`] implement the engine's behaviour; applications
//! prepend, append or replace listeners on the factory's registry.

pub mod event_type;
pub mod events;
pub mod listener;
pub mod registry;

pub use event_type::{
    CLEAR, DELETE, EVICT, EventKind, EventType, FLUSH, LOAD, LOCK, MERGE, PERSIST, POST_COMMIT_DELETE,
    POST_COMMIT_INSERT, POST_COMMIT_UPDATE, POST_DELETE, POST_INSERT, POST_LOAD, POST_UPDATE,
    PRE_DELETE, PRE_INSERT, PRE_UPDATE, REFRESH,
};
pub use events::{
    ClearEvent, DeleteEvent, EvictEvent, FlushEvent, LoadEvent, LockEvent, MergeEvent,
    PersistEvent, PostDeleteEvent, PostInsertEvent, PostLoadEvent, PostUpdateEvent,
    PreDeleteEvent, PreInsertEvent, PreUpdateEvent, RefreshEvent,
};
pub use listener::{
    ClearEventListener, DeleteEventListener, EvictEventListener, FlushEventListener,
    InstantiableListener, IntoListener, Listener, ListenerClass, LoadEventListener,
    LockEventListener, MergeEventListener, PersistEventListener, PostDeleteEventListener,
    PostInsertEventListener, PostLoadEventListener, PostUpdateEventListener,
    PreDeleteEventListener, PreInsertEventListener, PreUpdateEventListener, RefreshEventListener,
};
pub use registry::{
    DuplicationAction, DuplicationStrategy, EventListenerGroup, EventListenerRegistry,
    ListenerIdentity, SameClassStrategy,
};
