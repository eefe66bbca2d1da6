//! The unit of work.
//!
//! A [`Session`] owns one persistence context and one action queue. Every
//! public operation is raised as an event and dispatched to the listener
//! group the factory registered for it; the default listeners in
//! [`crate::listeners`] implement the behaviour. Cascades re-enter the
//! session through the `*_in_context` methods so that one logical operation
//! shares its bookkeeping (visited sets, merge context) across the graph.
//!
//! Sessions are single-threaded. Share the [`SessionFactory`] instead.

use crate::action_queue::{ActionQueue, FlushResult, fire_post_commit};
use crate::config::Settings;
use crate::event::{
    CLEAR, ClearEvent, DELETE, DeleteEvent, EVICT, EvictEvent, FLUSH, FlushEvent, LOAD, LOCK,
    LoadEvent, LockEvent, MERGE, MergeEvent, PERSIST, PersistEvent, REFRESH, RefreshEvent,
};
use crate::factory::SessionFactory;
use crate::listeners::{flush, load, persist};
use crate::merge::MergeContext;
use crate::persistence_context::{EntityEntry, EntityKey, PersistenceContext};
use crate::storage::StoredRow;
use crate::versioning;
use graft_core::{
    EntityDescriptor, EntityInstance, EntityRef, EntityReference, Error, IllegalStateKind,
    InstanceHandle, LazyProxy, LockMode, NotFoundError, Result, StaleStateError, Value,
    VersionContext,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Snapshot of session bookkeeping, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SessionDebugInfo {
    /// Instances in the persistence context.
    pub tracked: usize,
    pub pending_inserts: usize,
    pub pending_updates: usize,
    pub pending_deletes: usize,
    /// Post-commit notifications waiting for `commit()`.
    pub pending_post_commit: usize,
    pub cascade_level: usize,
    pub open: bool,
}

pub struct Session {
    factory: Arc<SessionFactory>,
    persistence_context: PersistenceContext,
    action_queue: ActionQueue,
    open: bool,
}

impl Session {
    pub(crate) fn new(factory: Arc<SessionFactory>) -> Self {
        tracing::debug!("Opened session");
        Self {
            factory,
            persistence_context: PersistenceContext::new(),
            action_queue: ActionQueue::new(),
            open: true,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    pub fn settings(&self) -> &Settings {
        self.factory.settings()
    }

    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.persistence_context
    }

    pub fn persistence_context_mut(&mut self) -> &mut PersistenceContext {
        &mut self.persistence_context
    }

    pub fn action_queue(&self) -> &ActionQueue {
        &self.action_queue
    }

    pub fn action_queue_mut(&mut self) -> &mut ActionQueue {
        &mut self.action_queue
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::illegal_state(
                IllegalStateKind::SessionClosed,
                None,
                "session is closed",
            ))
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Instance of `entity_name` with `id`, from the session or storage.
    ///
    /// Returns `None` when no row exists or the managed instance was deleted.
    pub fn get(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        self.get_with_lock(entity_name, id, LockMode::None)
    }

    pub fn get_with_lock(
        &mut self,
        entity_name: &str,
        id: impl Into<Value>,
        lock_mode: LockMode,
    ) -> Result<Option<EntityRef>> {
        self.check_open()?;
        let mut event = LoadEvent::new(entity_name, id.into(), lock_mode);
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&LOAD)?.iter() {
            listener.on_load(self, &mut event)?;
        }
        Ok(event.result)
    }

    /// Reference to `entity_name` with `id` without loading it.
    ///
    /// A managed instance is returned directly; otherwise one proxy per
    /// identity is shared within the session.
    pub fn reference(&mut self, entity_name: &str, id: Value) -> Result<EntityReference> {
        self.check_open()?;
        let descriptor = self.factory.metamodel().entity(entity_name)?;
        let key = EntityKey::new(descriptor, id.clone());
        if let Some(entity) = self.persistence_context.entity_by_key(&key) {
            return Ok(EntityReference::Direct(entity));
        }
        if let Some(proxy) = self.persistence_context.proxy_for_key(&key) {
            return Ok(EntityReference::Proxy(proxy));
        }
        tracing::trace!(key = %key, "Creating proxy");
        let proxy = LazyProxy::new(entity_name, id);
        self.persistence_context.add_proxy(key, Arc::clone(&proxy));
        Ok(EntityReference::Proxy(proxy))
    }

    /// Resolve a reference to its instance, loading a proxy's target.
    pub fn initialize(&mut self, reference: &EntityReference) -> Result<EntityRef> {
        let proxy = match reference {
            EntityReference::Direct(entity) => return Ok(Arc::clone(entity)),
            EntityReference::Proxy(proxy) => proxy,
        };
        if let Some(entity) = proxy.implementation() {
            return Ok(entity);
        }
        let entity = self
            .get(proxy.entity_name(), proxy.id().clone())?
            .ok_or_else(|| {
                Error::NotFound(NotFoundError {
                    entity: proxy.entity_name().to_string(),
                    id: proxy.id().clone(),
                })
            })?;
        if proxy.set_implementation(Arc::clone(&entity)).is_err() {
            tracing::trace!(entity = %proxy.entity_name(), id = %proxy.id(), "Proxy initialized during load");
        }
        Ok(entity)
    }

    /// Current stored row, bypassing the persistence context.
    pub fn database_snapshot(&self, descriptor: &EntityDescriptor, id: &Value) -> Result<Option<StoredRow>> {
        load::load_row(self, descriptor, id, LockMode::None)
    }

    // ========================================================================
    // Entity operations
    // ========================================================================

    /// Make a transient instance managed; it is inserted at the next flush.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        let mut event = PersistEvent {
            entity: Arc::clone(entity),
        };
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&PERSIST)?.iter() {
            listener.on_persist(self, &mut event)?;
        }
        Ok(())
    }

    /// Copy the state of `entity` onto the instance this session manages.
    ///
    /// Returns the managed instance, which is never `entity` itself unless
    /// it was already managed.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn merge(&mut self, entity: impl Into<EntityReference>) -> Result<EntityRef> {
        self.check_open()?;
        self.fire_merge(MergeEvent::new(entity))
    }

    /// Merge, requiring the instance to carry `id`.
    #[tracing::instrument(level = "debug", skip(self, entity, id))]
    pub fn merge_with_id(&mut self, entity: impl Into<EntityReference>, id: impl Into<Value>) -> Result<EntityRef> {
        self.check_open()?;
        self.fire_merge(MergeEvent::new(entity).with_requested_id(id.into()))
    }

    fn fire_merge(&mut self, mut event: MergeEvent) -> Result<EntityRef> {
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&MERGE)?.iter() {
            listener.on_merge(self, &mut event)?;
        }
        let entity_name = event.entity_name().to_string();
        event.result.ok_or_else(|| {
            Error::Custom(format!("no merge listener produced a result for {entity_name}"))
        })
    }

    /// Schedule removal of a managed or detached instance.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        let mut event = DeleteEvent {
            entity: Arc::clone(entity),
        };
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&DELETE)?.iter() {
            listener.on_delete(self, &mut event)?;
        }
        Ok(())
    }

    /// Re-read the state of `entity`, discarding unflushed changes.
    pub fn refresh(&mut self, entity: &EntityRef) -> Result<()> {
        self.refresh_with_lock(entity, LockMode::None)
    }

    pub fn refresh_with_lock(&mut self, entity: &EntityRef, lock_mode: LockMode) -> Result<()> {
        self.check_open()?;
        let mut event = RefreshEvent {
            entity: Arc::clone(entity),
            lock_mode,
        };
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&REFRESH)?.iter() {
            listener.on_refresh(self, &mut event)?;
        }
        Ok(())
    }

    /// Acquire `lock_mode` on `entity`, reassociating it when detached.
    pub fn lock(&mut self, entity: &EntityRef, lock_mode: LockMode) -> Result<()> {
        self.check_open()?;
        self.fire_lock(&mut LockEvent {
            entity: Arc::clone(entity),
            lock_mode,
        })
    }

    /// Detach `entity` (or a proxy) and drop its pending actions.
    pub fn evict(&mut self, entity: impl Into<EntityReference>) -> Result<()> {
        self.check_open()?;
        self.fire_evict(&mut EvictEvent {
            entity: entity.into(),
        })
    }

    // ========================================================================
    // Cascade entry points
    // ========================================================================

    pub fn merge_in_context(&mut self, event: &mut MergeEvent, ctx: &mut MergeContext) -> Result<()> {
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&MERGE)?.iter() {
            listener.on_merge_in_context(self, event, ctx)?;
        }
        Ok(())
    }

    pub fn persist_in_context(&mut self, entity: &EntityRef, created: &mut HashSet<InstanceHandle>) -> Result<()> {
        let mut event = PersistEvent {
            entity: Arc::clone(entity),
        };
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&PERSIST)?.iter() {
            listener.on_persist_in_context(self, &mut event, created)?;
        }
        Ok(())
    }

    /// Save a reachable transient instance during flush.
    pub fn save_update_in_context(&mut self, entity: &EntityRef, visited: &mut HashSet<InstanceHandle>) -> Result<()> {
        persist::save_or_update(self, entity, visited)
    }

    pub fn delete_in_context(&mut self, entity: &EntityRef, transient: &mut HashSet<InstanceHandle>) -> Result<()> {
        let mut event = DeleteEvent {
            entity: Arc::clone(entity),
        };
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&DELETE)?.iter() {
            listener.on_delete_in_context(self, &mut event, transient)?;
        }
        Ok(())
    }

    pub fn refresh_in_context(
        &mut self,
        event: &mut RefreshEvent,
        refreshed: &mut HashSet<InstanceHandle>,
    ) -> Result<()> {
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&REFRESH)?.iter() {
            listener.on_refresh_in_context(self, event, refreshed)?;
        }
        Ok(())
    }

    pub fn fire_lock(&mut self, event: &mut LockEvent) -> Result<()> {
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&LOCK)?.iter() {
            listener.on_lock(self, event)?;
        }
        Ok(())
    }

    pub fn fire_evict(&mut self, event: &mut EvictEvent) -> Result<()> {
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&EVICT)?.iter() {
            listener.on_evict(self, event)?;
        }
        Ok(())
    }

    // ========================================================================
    // Flush and transaction
    // ========================================================================

    /// Write all pending changes to storage.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.check_open()?;
        let mut event = FlushEvent::default();
        let factory = Arc::clone(&self.factory);
        for listener in factory.listeners().group(&FLUSH)?.iter() {
            listener.on_flush(self, &mut event)?;
        }
        Ok(event.result)
    }

    /// Flush (unless disabled), verify optimistic locks, commit storage and
    /// deliver post-commit notifications.
    ///
    /// The persistence context is cleared afterwards; managed instances
    /// become detached.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        if self.factory.settings().flush_before_commit {
            self.flush()?;
        }
        self.verify_optimistic_locks()?;
        self.factory.storage().commit()?;

        let events = self.action_queue.take_post_commit();
        let delivered = events.len();
        let factory = Arc::clone(&self.factory);
        let result = fire_post_commit(factory.listeners(), events);
        self.reset();
        tracing::info!(post_commit = delivered, "Committed transaction");
        result
    }

    /// Undo storage writes since the last commit and detach everything.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        let result = self.factory.storage().rollback();
        let discarded = self.action_queue.discard_post_commit();
        self.reset();
        tracing::info!(discarded_post_commit = discarded, "Rolled back transaction");
        result
    }

    fn verify_optimistic_locks(&self) -> Result<()> {
        for (entity, entry) in self.persistence_context.entries() {
            if entry.lock_mode != LockMode::Optimistic || !entry.exists_in_database || entry.is_deleted() {
                continue;
            }
            let descriptor = entry.descriptor();
            let current = self
                .database_snapshot(descriptor, &entry.id)?
                .and_then(|row| versioning::get_version(&row.values, descriptor));
            if current != entry.version {
                let statistics = self.factory.statistics();
                if statistics.is_enabled() {
                    statistics.optimistic_failure(entity.entity_name());
                }
                return Err(Error::StaleState(StaleStateError {
                    entity: entry.entity_name.clone(),
                    id: entry.id.clone(),
                    message: "version changed since the optimistic lock was taken".to_string(),
                }));
            }
            tracing::trace!(entity = %entry.entity_name, id = %entry.id, "Optimistic lock verified");
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.action_queue.clear();
        self.persistence_context.clear();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Detach every managed instance and drop pending actions.
    pub fn clear(&mut self) -> Result<()> {
        self.check_open()?;
        let event = ClearEvent {
            managed: self.persistence_context.len(),
        };
        for listener in self.factory.listeners().group(&CLEAR)?.iter() {
            listener.on_clear(&event);
        }
        self.reset();
        tracing::debug!(detached = event.managed, "Cleared session");
        Ok(())
    }

    /// Close the session. Unflushed changes and uncommitted notifications
    /// are discarded.
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        let discarded = self.action_queue.discard_post_commit();
        if self.action_queue.has_pending_actions() || discarded > 0 {
            tracing::warn!(
                pending = self.action_queue.insertion_count()
                    + self.action_queue.update_count()
                    + self.action_queue.deletion_count(),
                discarded_post_commit = discarded,
                "Closing session with uncommitted work"
            );
        }
        self.reset();
        self.open = false;
        tracing::debug!("Closed session");
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Is `entity` managed by this session and not scheduled for deletion?
    pub fn contains(&self, entity: &EntityInstance) -> bool {
        self.persistence_context
            .entry(entity.handle())
            .is_some_and(|entry| !entry.is_deleted())
    }

    pub fn entry(&self, entity: &EntityInstance) -> Option<&EntityEntry> {
        self.persistence_context.entry(entity.handle())
    }

    /// Would a flush write anything?
    pub fn is_dirty(&self) -> Result<bool> {
        self.check_open()?;
        Ok(self.action_queue.has_pending_actions() || flush::has_dirty_entities(self))
    }

    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            tracked: self.persistence_context.len(),
            pending_inserts: self.action_queue.insertion_count(),
            pending_updates: self.action_queue.update_count(),
            pending_deletes: self.action_queue.deletion_count(),
            pending_post_commit: self.action_queue.post_commit_count(),
            cascade_level: self.persistence_context.cascade_level(),
            open: self.open,
        }
    }
}

impl VersionContext for Session {
    fn current_timestamp_micros(&self) -> i64 {
        self.factory.clock().now_micros()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.debug_state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use graft_core::metamodel::{IntegerType, LongType, StringType};
    use graft_core::{Indirection, Metamodel};

    fn fixture() -> (Arc<SessionFactory>, Arc<MemoryStorage>) {
        let metamodel = Metamodel::builder()
            .entity(
                EntityDescriptor::builder("Note")
                    .id("id", LongType)
                    .sequence_generated("note_seq")
                    .version("version", IntegerType)
                    .basic("text", StringType)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let factory = SessionFactory::builder(metamodel)
            .storage(Arc::clone(&storage) as Arc<dyn crate::storage::Storage>)
            .build()
            .unwrap();
        (factory, storage)
    }

    fn seed(factory: &SessionFactory, storage: &MemoryStorage, id: i64, text: &str) {
        let descriptor = factory.metamodel().entity("Note").unwrap();
        storage.put_row(
            descriptor,
            id,
            vec![Value::Int(0), Value::Text(text.to_string())],
        );
    }

    #[test]
    fn test_get_loads_once_per_identity() {
        let (factory, storage) = fixture();
        seed(&factory, &storage, 1, "hello");
        let mut session = factory.open_session();

        let first = session.get("Note", 1_i64).unwrap().unwrap();
        let second = session.get("Note", 1_i64).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.basic("text").unwrap(), Value::Text("hello".into()));
        assert_eq!(storage.load_count(), 1);
        assert!(session.get("Note", 2_i64).unwrap().is_none());
    }

    #[test]
    fn test_reference_shares_one_proxy_until_initialized() {
        let (factory, storage) = fixture();
        seed(&factory, &storage, 4, "lazy");
        let mut session = factory.open_session();

        let a = session.reference("Note", Value::BigInt(4)).unwrap();
        let b = session.reference("Note", Value::BigInt(4)).unwrap();
        assert!(a.same_as(&b));
        assert!(a.is_uninitialized());
        assert_eq!(storage.load_count(), 0);

        let entity = session.initialize(&a).unwrap();
        assert!(!a.is_uninitialized());
        assert!(matches!(
            session.reference("Note", Value::BigInt(4)).unwrap(),
            EntityReference::Direct(e) if Arc::ptr_eq(&e, &entity)
        ));
    }

    #[test]
    fn test_initialize_missing_row_is_not_found() {
        let (factory, _storage) = fixture();
        let mut session = factory.open_session();
        let reference = session.reference("Note", Value::BigInt(9)).unwrap();
        let err = session.initialize(&reference).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_persist_then_commit_writes_and_detaches() {
        let (factory, storage) = fixture();
        let mut session = factory.open_session();
        let descriptor = Arc::clone(factory.metamodel().entity("Note").unwrap());
        let note = EntityInstance::new(&descriptor);
        note.set_basic("text", "draft").unwrap();

        session.persist(&note).unwrap();
        assert_eq!(session.debug_state().pending_inserts, 1);
        assert!(session.is_dirty().unwrap());

        session.commit().unwrap();
        assert_eq!(storage.insert_count(), 1);
        assert_eq!(note.id(), Some(Value::BigInt(1)));
        assert!(!session.contains(&note));
        assert_eq!(session.debug_state().tracked, 0);
    }

    #[test]
    fn test_rollback_undoes_flushed_writes() {
        let (factory, storage) = fixture();
        let mut session = factory.open_session();
        let descriptor = Arc::clone(factory.metamodel().entity("Note").unwrap());
        let note = EntityInstance::new(&descriptor);
        session.persist(&note).unwrap();
        session.flush().unwrap();
        assert_eq!(storage.row_count(), 1);

        session.rollback().unwrap();
        assert_eq!(storage.row_count(), 0);
        assert!(!session.contains(&note));
    }

    #[test]
    fn test_optimistic_lock_verified_at_commit() {
        let (factory, storage) = fixture();
        seed(&factory, &storage, 1, "v0");
        let mut session = factory.open_session();
        let note = session.get("Note", 1_i64).unwrap().unwrap();
        session.lock(&note, LockMode::Optimistic).unwrap();

        let descriptor = factory.metamodel().entity("Note").unwrap();
        storage.put_row(descriptor, 1_i64, vec![Value::Int(1), Value::Text("moved".into())]);

        let err = session.commit().unwrap_err();
        assert!(err.is_stale_state());
    }

    #[test]
    fn test_closed_session_rejects_operations() {
        let (factory, _storage) = fixture();
        let mut session = factory.open_session();
        session.close().unwrap();
        assert!(!session.is_open());

        let err = session.get("Note", 1_i64).unwrap_err();
        assert_eq!(err.illegal_state_kind(), Some(IllegalStateKind::SessionClosed));
        assert!(session.flush().is_err());
        assert!(session.close().is_err());
    }

    #[test]
    fn test_clear_detaches_and_drops_pending_work() {
        let (factory, storage) = fixture();
        seed(&factory, &storage, 1, "kept");
        let mut session = factory.open_session();
        let note = session.get("Note", 1_i64).unwrap().unwrap();
        session.delete(&note).unwrap();
        assert_eq!(session.debug_state().pending_deletes, 1);

        session.clear().unwrap();
        assert_eq!(session.debug_state().pending_deletes, 0);
        session.flush().unwrap();
        assert_eq!(storage.row_count(), 1);
    }
}
