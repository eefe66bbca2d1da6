//! Pending writes and their execution at flush.
//!
//! Actions execute in a fixed order:
//! - INSERT in scheduling order (parents are saved before cascaded children)
//! - UPDATE in flush order
//! - DELETE in scheduling order
//!
//! Post-commit events produced while executing are buffered until the
//! transaction commits and dropped on rollback.

use crate::event::{
    EventListenerRegistry, POST_COMMIT_DELETE, POST_COMMIT_INSERT, POST_COMMIT_UPDATE,
    POST_DELETE, POST_INSERT, POST_UPDATE, PRE_DELETE, PRE_INSERT, PRE_UPDATE, PostDeleteEvent,
    PostInsertEvent, PostUpdateEvent, PreDeleteEvent, PreInsertEvent, PreUpdateEvent,
};
use crate::factory::SessionFactory;
use crate::persistence_context::{EntityKey, EntityStatus};
use crate::session::Session;
use crate::versioning;
use graft_core::{
    EntityInstance, EntityRef, Error, IllegalStateKind, Indirection, InstanceHandle, LockMode,
    Result, StaleStateError, Value,
};
use std::sync::Arc;

// ============================================================================
// Actions
// ============================================================================

/// Insert of a newly saved instance. State is captured when it executes.
#[derive(Debug, Clone)]
pub struct InsertAction {
    pub entity: EntityRef,
}

/// Update of a dirty managed instance, prepared by the flush.
#[derive(Debug, Clone)]
pub struct UpdateAction {
    pub entity: EntityRef,
    pub id: Value,
    /// State to write, version already incremented.
    pub state: Vec<Value>,
    pub old_state: Vec<Value>,
    /// Version the row is expected to carry.
    pub previous_version: Option<Value>,
    pub next_version: Option<Value>,
    /// Indexes of changed attributes.
    pub dirty: Vec<usize>,
}

/// Delete of a removed instance.
#[derive(Debug, Clone)]
pub struct DeleteAction {
    pub entity: EntityRef,
    pub id: Value,
    pub version: Option<Value>,
    pub deleted_state: Vec<Value>,
}

/// Post-commit notification waiting for the transaction outcome.
#[derive(Debug, Clone)]
pub enum PostCommitEvent {
    Insert(PostInsertEvent),
    Update(PostUpdateEvent),
    Delete(PostDeleteEvent),
}

impl PostCommitEvent {
    fn dispatch(&self, registry: &EventListenerRegistry) -> Result<()> {
        match self {
            PostCommitEvent::Insert(event) => registry
                .group(&POST_COMMIT_INSERT)?
                .iter()
                .filter(|l| l.requires_post_commit_handling(event.entity.descriptor()))
                .try_for_each(|l| l.on_post_insert(event)),
            PostCommitEvent::Update(event) => registry
                .group(&POST_COMMIT_UPDATE)?
                .iter()
                .filter(|l| l.requires_post_commit_handling(event.entity.descriptor()))
                .try_for_each(|l| l.on_post_update(event)),
            PostCommitEvent::Delete(event) => registry
                .group(&POST_COMMIT_DELETE)?
                .iter()
                .filter(|l| l.requires_post_commit_handling(event.entity.descriptor()))
                .try_for_each(|l| l.on_post_delete(event)),
        }
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

// ============================================================================
// ActionQueue
// ============================================================================

/// Writes scheduled by one session.
#[derive(Debug, Default)]
pub struct ActionQueue {
    insertions: Vec<InsertAction>,
    updates: Vec<UpdateAction>,
    deletions: Vec<DeleteAction>,
    post_commit: Vec<PostCommitEvent>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_insert(&mut self, entity: EntityRef) {
        tracing::trace!(entity = %entity.entity_name(), handle = %entity.handle(), "Scheduling insert");
        self.insertions.push(InsertAction { entity });
    }

    pub fn add_update(&mut self, action: UpdateAction) {
        self.updates.push(action);
    }

    pub fn add_delete(&mut self, action: DeleteAction) {
        tracing::trace!(entity = %action.entity.entity_name(), id = %action.id, "Scheduling delete");
        self.deletions.push(action);
    }

    /// Drop a scheduled delete; returns whether one was found.
    pub fn unschedule_deletion(&mut self, handle: InstanceHandle) -> bool {
        let before = self.deletions.len();
        self.deletions.retain(|d| d.entity.handle() != handle);
        before != self.deletions.len()
    }

    /// Drop every action scheduled for the instance.
    pub fn remove_actions_for(&mut self, handle: InstanceHandle) {
        self.insertions.retain(|a| a.entity.handle() != handle);
        self.updates.retain(|a| a.entity.handle() != handle);
        self.deletions.retain(|a| a.entity.handle() != handle);
    }

    pub fn has_pending_insert(&self, handle: InstanceHandle) -> bool {
        self.insertions.iter().any(|a| a.entity.handle() == handle)
    }

    pub fn has_pending_deletion(&self, handle: InstanceHandle) -> bool {
        self.deletions.iter().any(|a| a.entity.handle() == handle)
    }

    pub fn insertion_count(&self) -> usize {
        self.insertions.len()
    }

    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    pub fn deletion_count(&self) -> usize {
        self.deletions.len()
    }

    pub fn has_pending_actions(&self) -> bool {
        !(self.insertions.is_empty() && self.updates.is_empty() && self.deletions.is_empty())
    }

    pub fn post_commit_count(&self) -> usize {
        self.post_commit.len()
    }

    /// Drop pending actions; buffered post-commit events are kept.
    pub fn clear(&mut self) {
        self.insertions.clear();
        self.updates.clear();
        self.deletions.clear();
    }

    pub fn take_post_commit(&mut self) -> Vec<PostCommitEvent> {
        std::mem::take(&mut self.post_commit)
    }

    pub fn discard_post_commit(&mut self) -> usize {
        let discarded = self.post_commit.len();
        self.post_commit.clear();
        discarded
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Fail if `entity` references an unsaved instance the session does not manage.
pub(crate) fn check_transient_references(session: &Session, entity: &EntityInstance) -> Result<()> {
    let descriptor = Arc::clone(entity.descriptor());
    for (attr, value) in descriptor.attributes().iter().zip(entity.properties()) {
        for reference in value.references() {
            let Some(target) = reference.implementation() else {
                continue;
            };
            if session.persistence_context().contains(target.handle()) {
                continue;
            }
            let unsaved = target
                .descriptor()
                .is_transient(target.id().as_ref(), target.version().as_ref())
                .unwrap_or(false);
            if unsaved {
                return Err(Error::illegal_state(
                    IllegalStateKind::TransientReference,
                    Some(entity.entity_name()),
                    format!(
                        "object references an unsaved transient instance, save it before flushing: {}.{} -> {}",
                        entity.entity_name(),
                        attr.name,
                        target.entity_name()
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn stale_state(factory: &SessionFactory, entity: &EntityInstance, id: &Value) -> Error {
    let statistics = factory.statistics();
    if statistics.is_enabled() {
        statistics.optimistic_failure(entity.entity_name());
    }
    Error::StaleState(StaleStateError {
        entity: entity.entity_name().to_string(),
        id: id.clone(),
        message: "row was updated or deleted by another transaction".to_string(),
    })
}

fn buffer_post_commit(session: &mut Session, event: PostCommitEvent, listening: bool) {
    if listening {
        session.action_queue_mut().post_commit.push(event);
    }
}

/// Execute every scheduled action against storage.
pub(crate) fn execute_actions(session: &mut Session) -> Result<FlushResult> {
    let factory = Arc::clone(session.factory());
    let mut result = FlushResult::new();

    let insertions = std::mem::take(&mut session.action_queue_mut().insertions);
    for action in insertions {
        if execute_insert(session, &factory, &action)? {
            result.inserted += 1;
        }
    }

    let updates = std::mem::take(&mut session.action_queue_mut().updates);
    for action in updates {
        if execute_update(session, &factory, action)? {
            result.updated += 1;
        }
    }

    let deletions = std::mem::take(&mut session.action_queue_mut().deletions);
    for action in deletions {
        if execute_delete(session, &factory, action)? {
            result.deleted += 1;
        }
    }

    tracing::debug!(
        inserted = result.inserted,
        updated = result.updated,
        deleted = result.deleted,
        "Executed scheduled actions"
    );
    Ok(result)
}

fn execute_insert(session: &mut Session, factory: &SessionFactory, action: &InsertAction) -> Result<bool> {
    let entity = &action.entity;
    let Some(entry) = session.persistence_context().entry(entity.handle()) else {
        tracing::trace!(handle = %entity.handle(), "Skipping insert of instance no longer managed");
        return Ok(false);
    };
    if entry.exists_in_database {
        return Ok(false);
    }
    let id = entry.id.clone();
    let descriptor = Arc::clone(entry.descriptor());
    check_transient_references(session, entity)?;

    let listeners = factory.listeners();
    let mut event = PreInsertEvent {
        entity: Arc::clone(entity),
        id: id.clone(),
        state: entity.disassemble(),
    };
    let mut vetoed = false;
    for listener in listeners.group(&PRE_INSERT)?.iter() {
        vetoed |= listener.on_pre_insert(&mut event);
    }
    if vetoed {
        tracing::debug!(entity = %descriptor.name(), id = %id, "Insert vetoed");
        return Ok(false);
    }

    factory.storage().insert(&descriptor, &id, &event.state)?;
    if let Some(entry) = session.persistence_context_mut().entry_mut(entity.handle()) {
        entry.exists_in_database = true;
        entry.version = versioning::get_version(&event.state, &descriptor);
        entry.loaded_state = event.state.clone();
    }
    if let Some(tracker) = entity.dirtiness() {
        tracker.clear_dirty();
    }
    factory.statistics().entity_inserted(descriptor.name());

    let post = PostInsertEvent {
        entity: Arc::clone(entity),
        id,
        state: event.state,
    };
    for listener in listeners.group(&POST_INSERT)?.iter() {
        listener.on_post_insert(&post)?;
    }
    let listening = listeners
        .group(&POST_COMMIT_INSERT)?
        .iter()
        .any(|l| l.requires_post_commit_handling(&descriptor));
    buffer_post_commit(session, PostCommitEvent::Insert(post), listening);
    Ok(true)
}

fn execute_update(session: &mut Session, factory: &SessionFactory, action: UpdateAction) -> Result<bool> {
    let entity = &action.entity;
    let Some(entry) = session.persistence_context().entry(entity.handle()) else {
        return Ok(false);
    };
    if entry.is_deleted() {
        return Ok(false);
    }
    let descriptor = Arc::clone(entry.descriptor());
    check_transient_references(session, entity)?;

    let listeners = factory.listeners();
    let mut event = PreUpdateEvent {
        entity: Arc::clone(entity),
        id: action.id.clone(),
        state: action.state,
        old_state: action.old_state,
    };
    let mut vetoed = false;
    for listener in listeners.group(&PRE_UPDATE)?.iter() {
        vetoed |= listener.on_pre_update(&mut event);
    }
    if vetoed {
        tracing::debug!(entity = %descriptor.name(), id = %action.id, "Update vetoed");
        return Ok(false);
    }

    let expected = if descriptor.is_versioned() {
        action.previous_version.as_ref()
    } else {
        None
    };
    tracing::trace!(
        entity = %descriptor.name(),
        id = %action.id,
        dirty = ?action.dirty,
        previous_version = ?action.previous_version,
        next_version = ?action.next_version,
        "Updating row"
    );
    if !factory
        .storage()
        .update(&descriptor, &action.id, &event.state, expected)?
    {
        return Err(stale_state(factory, entity, &action.id));
    }

    if let Some(entry) = session.persistence_context_mut().entry_mut(entity.handle()) {
        entry.loaded_state = event.state.clone();
        entry.version = action.next_version;
        entry.lock_mode = match entry.lock_mode {
            LockMode::OptimisticForceIncrement => LockMode::Read,
            LockMode::PessimisticForceIncrement => LockMode::PessimisticWrite,
            other => other,
        };
    }
    if let Some(tracker) = entity.dirtiness() {
        tracker.clear_dirty();
    }
    factory.statistics().entity_updated(descriptor.name());

    let post = PostUpdateEvent {
        entity: Arc::clone(entity),
        id: action.id,
        state: event.state,
        old_state: event.old_state,
        dirty: action.dirty,
    };
    for listener in listeners.group(&POST_UPDATE)?.iter() {
        listener.on_post_update(&post)?;
    }
    let listening = listeners
        .group(&POST_COMMIT_UPDATE)?
        .iter()
        .any(|l| l.requires_post_commit_handling(&descriptor));
    buffer_post_commit(session, PostCommitEvent::Update(post), listening);
    Ok(true)
}

fn execute_delete(session: &mut Session, factory: &SessionFactory, action: DeleteAction) -> Result<bool> {
    let entity = &action.entity;
    let descriptor = Arc::clone(entity.descriptor());
    let listeners = factory.listeners();
    let mut event = PreDeleteEvent {
        entity: Arc::clone(entity),
        id: action.id.clone(),
        deleted_state: action.deleted_state,
    };
    let mut vetoed = false;
    for listener in listeners.group(&PRE_DELETE)?.iter() {
        vetoed |= listener.on_pre_delete(&mut event);
    }
    if vetoed {
        tracing::debug!(entity = %descriptor.name(), id = %action.id, "Delete vetoed");
        return Ok(false);
    }

    let expected = if descriptor.is_versioned() {
        action.version.as_ref()
    } else {
        None
    };
    if !factory.storage().delete(&descriptor, &action.id, expected)? {
        return Err(stale_state(factory, entity, &action.id));
    }

    let context = session.persistence_context_mut();
    if let Some(entry) = context.entry_mut(entity.handle()) {
        entry.status = EntityStatus::Gone;
    }
    context.remove_entity(entity.handle());
    context.remove_proxy(&EntityKey::new(&descriptor, action.id.clone()));
    factory.statistics().entity_deleted(descriptor.name());

    let post = PostDeleteEvent {
        entity: Arc::clone(entity),
        id: action.id,
        deleted_state: event.deleted_state,
    };
    for listener in listeners.group(&POST_DELETE)?.iter() {
        listener.on_post_delete(&post)?;
    }
    let listening = listeners
        .group(&POST_COMMIT_DELETE)?
        .iter()
        .any(|l| l.requires_post_commit_handling(&descriptor));
    buffer_post_commit(session, PostCommitEvent::Delete(post), listening);
    Ok(true)
}

/// Replay buffered post-commit events.
///
/// Every event is delivered; the first failure is returned and later ones
/// are logged.
pub(crate) fn fire_post_commit(
    registry: &EventListenerRegistry,
    events: Vec<PostCommitEvent>,
) -> Result<()> {
    let mut first_error = None;
    for event in &events {
        if let Err(error) = event.dispatch(registry) {
            if first_error.is_none() {
                first_error = Some(error);
            } else {
                tracing::warn!(error = %error, "Post-commit listener failed");
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::EntityDescriptor;
    use graft_core::metamodel::{LongType, StringType};

    fn entity(id: i64) -> EntityRef {
        let desc = Arc::new(
            EntityDescriptor::builder("Memo")
                .id("id", LongType)
                .basic("text", StringType)
                .build()
                .unwrap(),
        );
        EntityInstance::with_id(&desc, id)
    }

    fn delete_of(entity: &EntityRef) -> DeleteAction {
        DeleteAction {
            entity: Arc::clone(entity),
            id: entity.id().unwrap(),
            version: None,
            deleted_state: vec![Value::Null],
        }
    }

    #[test]
    fn test_flush_result_total() {
        let result = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 3,
        };
        assert_eq!(result.total(), 6);
        assert_eq!(FlushResult::new().total(), 0);
    }

    #[test]
    fn test_unschedule_deletion() {
        let (a, b) = (entity(1), entity(2));
        let mut queue = ActionQueue::new();
        queue.add_delete(delete_of(&a));
        queue.add_delete(delete_of(&b));
        assert!(queue.has_pending_deletion(a.handle()));

        assert!(queue.unschedule_deletion(a.handle()));
        assert!(!queue.unschedule_deletion(a.handle()));
        assert_eq!(queue.deletion_count(), 1);
        assert!(queue.has_pending_deletion(b.handle()));
    }

    #[test]
    fn test_remove_actions_for_instance() {
        let (a, b) = (entity(1), entity(2));
        let mut queue = ActionQueue::new();
        queue.add_insert(Arc::clone(&a));
        queue.add_insert(Arc::clone(&b));
        queue.add_delete(delete_of(&a));
        queue.remove_actions_for(a.handle());

        assert!(!queue.has_pending_insert(a.handle()));
        assert!(queue.has_pending_insert(b.handle()));
        assert_eq!(queue.deletion_count(), 0);
        assert!(queue.has_pending_actions());
        queue.clear();
        assert!(!queue.has_pending_actions());
    }

    #[test]
    fn test_post_commit_buffer() {
        let a = entity(1);
        let mut queue = ActionQueue::new();
        queue.post_commit.push(PostCommitEvent::Insert(PostInsertEvent {
            entity: Arc::clone(&a),
            id: Value::BigInt(1),
            state: vec![Value::Null],
        }));
        queue.clear();
        assert_eq!(queue.post_commit_count(), 1);
        assert_eq!(queue.take_post_commit().len(), 1);
        assert_eq!(queue.discard_post_commit(), 0);

        let registry = EventListenerRegistry::new();
        let events = vec![PostCommitEvent::Delete(PostDeleteEvent {
            entity: a,
            id: Value::BigInt(1),
            deleted_state: Vec::new(),
        })];
        assert!(fire_post_commit(&registry, events).is_ok());
    }
}
