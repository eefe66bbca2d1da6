//! The closed set of session events.
//!
//! [`EventKind`] names every event a session can raise. [`EventType`] pairs a
//! kind with the listener trait its group holds, so that registry lookups are
//! typed: `registry.group(&MERGE)` yields listeners implementing
//! [`MergeEventListener`].

use super::listener::{
    ClearEventListener, DeleteEventListener, EvictEventListener, FlushEventListener,
    LoadEventListener, LockEventListener, MergeEventListener, PersistEventListener,
    PostDeleteEventListener, PostInsertEventListener, PostLoadEventListener,
    PostUpdateEventListener, PreDeleteEventListener, PreInsertEventListener,
    PreUpdateEventListener, RefreshEventListener,
};
use std::fmt;
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Load,
    PostLoad,
    Persist,
    Merge,
    Delete,
    Evict,
    Refresh,
    Lock,
    Flush,
    Clear,
    PreInsert,
    PreUpdate,
    PreDelete,
    PostInsert,
    PostUpdate,
    PostDelete,
    PostCommitInsert,
    PostCommitUpdate,
    PostCommitDelete,
}

impl EventKind {
    pub const ALL: [EventKind; 19] = [
        EventKind::Load,
        EventKind::PostLoad,
        EventKind::Persist,
        EventKind::Merge,
        EventKind::Delete,
        EventKind::Evict,
        EventKind::Refresh,
        EventKind::Lock,
        EventKind::Flush,
        EventKind::Clear,
        EventKind::PreInsert,
        EventKind::PreUpdate,
        EventKind::PreDelete,
        EventKind::PostInsert,
        EventKind::PostUpdate,
        EventKind::PostDelete,
        EventKind::PostCommitInsert,
        EventKind::PostCommitUpdate,
        EventKind::PostCommitDelete,
    ];

    /// External name, e.g. `"post-commit-insert"`.
    pub const fn name(self) -> &'static str {
        match self {
            EventKind::Load => "load",
            EventKind::PostLoad => "post-load",
            EventKind::Persist => "persist",
            EventKind::Merge => "merge",
            EventKind::Delete => "delete",
            EventKind::Evict => "evict",
            EventKind::Refresh => "refresh",
            EventKind::Lock => "lock",
            EventKind::Flush => "flush",
            EventKind::Clear => "clear",
            EventKind::PreInsert => "pre-insert",
            EventKind::PreUpdate => "pre-update",
            EventKind::PreDelete => "pre-delete",
            EventKind::PostInsert => "post-insert",
            EventKind::PostUpdate => "post-update",
            EventKind::PostDelete => "post-delete",
            EventKind::PostCommitInsert => "post-commit-insert",
            EventKind::PostCommitUpdate => "post-commit-update",
            EventKind::PostCommitDelete => "post-commit-delete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Listeners of this kind only run once the transaction commits.
    pub const fn is_post_commit(self) -> bool {
        matches!(
            self,
            EventKind::PostCommitInsert | EventKind::PostCommitUpdate | EventKind::PostCommitDelete
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An event kind tied to its listener trait `L`.
pub struct EventType<L: ?Sized> {
    kind: EventKind,
    _listener: PhantomData<fn() -> Box<L>>,
}

impl<L: ?Sized> EventType<L> {
    const fn new(kind: EventKind) -> Self {
        Self {
            kind,
            _listener: PhantomData,
        }
    }

    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    pub const fn name(&self) -> &'static str {
        self.kind.name()
    }
}

impl<L: ?Sized> Clone for EventType<L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: ?Sized> Copy for EventType<L> {}

impl<L: ?Sized> fmt::Debug for EventType<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventType({})", self.kind)
    }
}

impl<L: ?Sized> fmt::Display for EventType<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const LOAD: EventType<dyn LoadEventListener> = EventType::new(EventKind::Load);
pub const POST_LOAD: EventType<dyn PostLoadEventListener> = EventType::new(EventKind::PostLoad);
pub const PERSIST: EventType<dyn PersistEventListener> = EventType::new(EventKind::Persist);
pub const MERGE: EventType<dyn MergeEventListener> = EventType::new(EventKind::Merge);
pub const DELETE: EventType<dyn DeleteEventListener> = EventType::new(EventKind::Delete);
pub const EVICT: EventType<dyn EvictEventListener> = EventType::new(EventKind::Evict);
pub const REFRESH: EventType<dyn RefreshEventListener> = EventType::new(EventKind::Refresh);
pub const LOCK: EventType<dyn LockEventListener> = EventType::new(EventKind::Lock);
pub const FLUSH: EventType<dyn FlushEventListener> = EventType::new(EventKind::Flush);
pub const CLEAR: EventType<dyn ClearEventListener> = EventType::new(EventKind::Clear);
pub const PRE_INSERT: EventType<dyn PreInsertEventListener> = EventType::new(EventKind::PreInsert);
pub const PRE_UPDATE: EventType<dyn PreUpdateEventListener> = EventType::new(EventKind::PreUpdate);
pub const PRE_DELETE: EventType<dyn PreDeleteEventListener> = EventType::new(EventKind::PreDelete);
pub const POST_INSERT: EventType<dyn PostInsertEventListener> =
    EventType::new(EventKind::PostInsert);
pub const POST_UPDATE: EventType<dyn PostUpdateEventListener> =
    EventType::new(EventKind::PostUpdate);
pub const POST_DELETE: EventType<dyn PostDeleteEventListener> =
    EventType::new(EventKind::PostDelete);
pub const POST_COMMIT_INSERT: EventType<dyn PostInsertEventListener> =
    EventType::new(EventKind::PostCommitInsert);
pub const POST_COMMIT_UPDATE: EventType<dyn PostUpdateEventListener> =
    EventType::new(EventKind::PostCommitUpdate);
pub const POST_COMMIT_DELETE: EventType<dyn PostDeleteEventListener> =
    EventType::new(EventKind::PostCommitDelete);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EventKind::from_name("save"), None);
    }

    #[test]
    fn test_post_commit_kinds_share_listener_traits() {
        assert_eq!(POST_COMMIT_INSERT.kind(), EventKind::PostCommitInsert);
        assert!(POST_COMMIT_INSERT.kind().is_post_commit());
        assert!(!POST_INSERT.kind().is_post_commit());
        assert_eq!(MERGE.to_string(), "merge");
        assert_eq!(format!("{:?}", FLUSH), "EventType(flush)");
    }
}
