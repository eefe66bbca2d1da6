//! Listener traits, one per event family.
//!
//! Every listener is `Send + Sync` and shared behind an `Arc` by all sessions
//! of a factory, so listeners keep no per-session state. Operations that
//! recurse through cascades come in two flavours: the top-level entry point
//! (`on_merge`, `on_persist`, ...) and an `_in_context` variant that shares
//! the bookkeeping of the operation already in progress.

use super::events::{
    ClearEvent, DeleteEvent, EvictEvent, FlushEvent, LoadEvent, LockEvent, MergeEvent,
    PersistEvent, PostDeleteEvent, PostInsertEvent, PostLoadEvent, PostUpdateEvent,
    PreDeleteEvent, PreInsertEvent, PreUpdateEvent, RefreshEvent,
};
use crate::merge::MergeContext;
use crate::session::Session;
use graft_core::{EntityDescriptor, InstanceHandle, Result};
use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ============================================================================
// Listener identity
// ============================================================================

/// Runtime class of a listener.
#[derive(Debug, Clone, Copy)]
pub struct ListenerClass {
    pub type_id: TypeId,
    pub name: &'static str,
}

impl PartialEq for ListenerClass {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ListenerClass {}

impl Hash for ListenerClass {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Display for ListenerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Base of every listener trait.
pub trait Listener: Any + Send + Sync {
    fn listener_class(&self) -> ListenerClass {
        ListenerClass {
            type_id: Any::type_id(self),
            name: std::any::type_name::<Self>(),
        }
    }
}

/// Listeners the registry can create by type.
pub trait InstantiableListener: Listener + Sized {
    fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>>;
}

/// Upcast of a concrete listener to the trait object a group stores.
pub trait IntoListener<L: ?Sized> {
    fn into_listener(self: Arc<Self>) -> Arc<L>;
}

macro_rules! into_listener {
    ($($listener:ident),* $(,)?) => {
        $(
            impl<T: $listener> IntoListener<dyn $listener> for T {
                fn into_listener(self: Arc<Self>) -> Arc<dyn $listener> {
                    self
                }
            }
        )*
    };
}

// ============================================================================
// Lifecycle listeners
// ============================================================================

pub trait LoadEventListener: Listener {
    fn on_load(&self, session: &mut Session, event: &mut LoadEvent) -> Result<()>;
}

pub trait PostLoadEventListener: Listener {
    fn on_post_load(&self, session: &mut Session, event: &PostLoadEvent) -> Result<()>;
}

pub trait PersistEventListener: Listener {
    fn on_persist(&self, session: &mut Session, event: &mut PersistEvent) -> Result<()> {
        let mut created = HashSet::new();
        self.on_persist_in_context(session, event, &mut created)
    }

    /// `created` holds the instances this persist already handled.
    fn on_persist_in_context(
        &self,
        session: &mut Session,
        event: &mut PersistEvent,
        created: &mut HashSet<InstanceHandle>,
    ) -> Result<()>;
}

pub trait MergeEventListener: Listener {
    /// Merge with a fresh context, cleared afterwards whatever the outcome.
    fn on_merge(&self, session: &mut Session, event: &mut MergeEvent) -> Result<()> {
        let mut ctx = MergeContext::for_policy(session.settings().entity_copy_observer);
        let result = self
            .on_merge_in_context(session, event, &mut ctx)
            .and_then(|()| ctx.top_level_merge_complete());
        ctx.clear();
        result
    }

    fn on_merge_in_context(
        &self,
        session: &mut Session,
        event: &mut MergeEvent,
        ctx: &mut MergeContext,
    ) -> Result<()>;
}

pub trait DeleteEventListener: Listener {
    fn on_delete(&self, session: &mut Session, event: &mut DeleteEvent) -> Result<()> {
        let mut transient = HashSet::new();
        self.on_delete_in_context(session, event, &mut transient)
    }

    /// `transient` holds unmanaged instances already walked by this delete.
    fn on_delete_in_context(
        &self,
        session: &mut Session,
        event: &mut DeleteEvent,
        transient: &mut HashSet<InstanceHandle>,
    ) -> Result<()>;
}

pub trait EvictEventListener: Listener {
    fn on_evict(&self, session: &mut Session, event: &mut EvictEvent) -> Result<()>;
}

pub trait RefreshEventListener: Listener {
    fn on_refresh(&self, session: &mut Session, event: &mut RefreshEvent) -> Result<()> {
        let mut refreshed = HashSet::new();
        self.on_refresh_in_context(session, event, &mut refreshed)
    }

    fn on_refresh_in_context(
        &self,
        session: &mut Session,
        event: &mut RefreshEvent,
        refreshed: &mut HashSet<InstanceHandle>,
    ) -> Result<()>;
}

pub trait LockEventListener: Listener {
    fn on_lock(&self, session: &mut Session, event: &mut LockEvent) -> Result<()>;
}

pub trait FlushEventListener: Listener {
    fn on_flush(&self, session: &mut Session, event: &mut FlushEvent) -> Result<()>;
}

pub trait ClearEventListener: Listener {
    fn on_clear(&self, event: &ClearEvent);
}

// ============================================================================
// Action listeners
// ============================================================================

/// Returning `true` vetoes the insert.
pub trait PreInsertEventListener: Listener {
    fn on_pre_insert(&self, event: &mut PreInsertEvent) -> bool;
}

/// Returning `true` vetoes the update.
pub trait PreUpdateEventListener: Listener {
    fn on_pre_update(&self, event: &mut PreUpdateEvent) -> bool;
}

/// Returning `true` vetoes the delete.
pub trait PreDeleteEventListener: Listener {
    fn on_pre_delete(&self, event: &mut PreDeleteEvent) -> bool;
}

pub trait PostInsertEventListener: Listener {
    fn on_post_insert(&self, event: &PostInsertEvent) -> Result<()>;

    /// Registered under a post-commit group, an event for `descriptor` is
    /// buffered until commit only when some listener returns `true` here.
    fn requires_post_commit_handling(&self, _descriptor: &EntityDescriptor) -> bool {
        true
    }
}

pub trait PostUpdateEventListener: Listener {
    fn on_post_update(&self, event: &PostUpdateEvent) -> Result<()>;

    /// See [`PostInsertEventListener::requires_post_commit_handling`].
    fn requires_post_commit_handling(&self, _descriptor: &EntityDescriptor) -> bool {
        true
    }
}

pub trait PostDeleteEventListener: Listener {
    fn on_post_delete(&self, event: &PostDeleteEvent) -> Result<()>;

    /// See [`PostInsertEventListener::requires_post_commit_handling`].
    fn requires_post_commit_handling(&self, _descriptor: &EntityDescriptor) -> bool {
        true
    }
}

into_listener!(
    LoadEventListener,
    PostLoadEventListener,
    PersistEventListener,
    MergeEventListener,
    DeleteEventListener,
    EvictEventListener,
    RefreshEventListener,
    LockEventListener,
    FlushEventListener,
    ClearEventListener,
    PreInsertEventListener,
    PreUpdateEventListener,
    PreDeleteEventListener,
    PostInsertEventListener,
    PostUpdateEventListener,
    PostDeleteEventListener,
);
