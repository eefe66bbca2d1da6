//! Event payloads handed to listeners.

use crate::action_queue::FlushResult;
use graft_core::{EntityRef, EntityReference, Indirection, LockMode, Value};

/// Request to load an instance by identifier.
#[derive(Debug)]
pub struct LoadEvent {
    pub entity_name: String,
    pub id: Value,
    pub lock_mode: LockMode,
    /// Set by the listener that resolved the instance.
    pub result: Option<EntityRef>,
}

impl LoadEvent {
    pub fn new(entity_name: impl Into<String>, id: Value, lock_mode: LockMode) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            lock_mode,
            result: None,
        }
    }
}

/// Raised after an instance was assembled from a stored row.
#[derive(Debug, Clone)]
pub struct PostLoadEvent {
    pub entity: EntityRef,
    pub id: Value,
}

#[derive(Debug, Clone)]
pub struct PersistEvent {
    pub entity: EntityRef,
}

/// Request to merge `original` into the session.
#[derive(Debug)]
pub struct MergeEvent {
    /// Association target name when raised by a cascade.
    pub entity_name: Option<String>,
    pub original: EntityReference,
    /// Identifier the caller expects the instance to carry.
    pub requested_id: Option<Value>,
    /// The managed instance the original was merged into.
    pub result: Option<EntityRef>,
}

impl MergeEvent {
    pub fn new(original: impl Into<EntityReference>) -> Self {
        Self {
            entity_name: None,
            original: original.into(),
            requested_id: None,
            result: None,
        }
    }

    #[must_use]
    pub fn with_entity_name(mut self, entity_name: impl Into<String>) -> Self {
        self.entity_name = Some(entity_name.into());
        self
    }

    #[must_use]
    pub fn with_requested_id(mut self, id: Value) -> Self {
        self.requested_id = Some(id);
        self
    }

    pub fn entity_name(&self) -> &str {
        self.entity_name
            .as_deref()
            .unwrap_or_else(|| self.original.entity_name())
    }

    /// Identifier of the original, when it has one.
    pub fn original_id(&self) -> Option<Value> {
        self.original.identity()
    }
}

#[derive(Debug, Clone)]
pub struct DeleteEvent {
    pub entity: EntityRef,
}

#[derive(Debug, Clone)]
pub struct EvictEvent {
    pub entity: EntityReference,
}

#[derive(Debug, Clone)]
pub struct RefreshEvent {
    pub entity: EntityRef,
    pub lock_mode: LockMode,
}

#[derive(Debug, Clone)]
pub struct LockEvent {
    pub entity: EntityRef,
    pub lock_mode: LockMode,
}

#[derive(Debug, Default)]
pub struct FlushEvent {
    pub result: FlushResult,
}

/// Raised before the persistence context is cleared.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearEvent {
    /// Number of managed instances about to be detached.
    pub managed: usize,
}

/// Raised before a row is inserted. Listeners may adjust `state`.
#[derive(Debug)]
pub struct PreInsertEvent {
    pub entity: EntityRef,
    pub id: Value,
    pub state: Vec<Value>,
}

/// Raised before a row is updated. Listeners may adjust `state`.
#[derive(Debug)]
pub struct PreUpdateEvent {
    pub entity: EntityRef,
    pub id: Value,
    pub state: Vec<Value>,
    pub old_state: Vec<Value>,
}

#[derive(Debug)]
pub struct PreDeleteEvent {
    pub entity: EntityRef,
    pub id: Value,
    pub deleted_state: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct PostInsertEvent {
    pub entity: EntityRef,
    pub id: Value,
    pub state: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct PostUpdateEvent {
    pub entity: EntityRef,
    pub id: Value,
    pub state: Vec<Value>,
    pub old_state: Vec<Value>,
    /// Indexes of the attributes that changed.
    pub dirty: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct PostDeleteEvent {
    pub entity: EntityRef,
    pub id: Value,
    pub deleted_state: Vec<Value>,
}
