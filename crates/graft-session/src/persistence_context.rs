//! The persistence context: per-session identity map and entity entries.
//!
//! Every managed instance has exactly one [`EntityEntry`] holding the
//! disassembled snapshot it was loaded or last flushed with. Dirty checking
//! compares current state against that snapshot, never against storage.

use graft_core::{
    EntityDescriptor, EntityRef, EntityReference, Error, Indirection, InstanceHandle,
    IllegalStateKind, LockMode, ProxyRef, Result, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ============================================================================
// EntityKey
// ============================================================================

/// Identity of a row: hierarchy root name plus identifier.
#[derive(Debug, Clone)]
pub struct EntityKey {
    root: String,
    id: Value,
    id_hash: u64,
}

impl EntityKey {
    pub fn new(descriptor: &EntityDescriptor, id: Value) -> Self {
        Self::for_root(descriptor.root_name(), id)
    }

    pub fn for_root(root: impl Into<String>, id: Value) -> Self {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        id.hash_into(&mut hasher);
        Self {
            root: root.into(),
            id,
            id_hash: hasher.finish(),
        }
    }

    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn id_hash(&self) -> u64 {
        self.id_hash
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.id_hash == other.id_hash && self.root == other.root && self.id == other.id
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.hash(state);
        self.id_hash.hash(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{}]", self.root, self.id)
    }
}

// ============================================================================
// EntityEntry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Managed,
    ReadOnly,
    Deleted,
    Gone,
}

/// Session bookkeeping for one managed instance.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub entity_name: String,
    pub id: Value,
    pub status: EntityStatus,
    /// Disassembled state as of the last load or flush.
    pub loaded_state: Vec<Value>,
    /// State captured when the entity was scheduled for deletion.
    pub deleted_state: Option<Vec<Value>>,
    pub version: Option<Value>,
    pub lock_mode: LockMode,
    /// False until the row has been inserted.
    pub exists_in_database: bool,
    descriptor: Arc<EntityDescriptor>,
}

impl EntityEntry {
    pub fn new(
        descriptor: &Arc<EntityDescriptor>,
        id: Value,
        status: EntityStatus,
        loaded_state: Vec<Value>,
        version: Option<Value>,
        lock_mode: LockMode,
        exists_in_database: bool,
    ) -> Self {
        Self {
            entity_name: descriptor.name().to_string(),
            id,
            status,
            loaded_state,
            deleted_state: None,
            version,
            lock_mode,
            exists_in_database,
            descriptor: Arc::clone(descriptor),
        }
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.descriptor, self.id.clone())
    }

    /// Deleted in this session or already gone from storage.
    pub fn is_deleted(&self) -> bool {
        matches!(self.status, EntityStatus::Deleted | EntityStatus::Gone)
    }
}

// ============================================================================
// PersistenceContext
// ============================================================================

#[derive(Debug)]
struct Managed {
    entity: EntityRef,
    entry: EntityEntry,
}

/// Identity map plus entries for one session.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    managed: BTreeMap<InstanceHandle, Managed>,
    by_key: HashMap<EntityKey, InstanceHandle>,
    proxies: HashMap<EntityKey, ProxyRef>,
    cascade_level: usize,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start managing `entity`.
    ///
    /// Fails if a different instance is already managed under the same key.
    pub fn add_entity(&mut self, entity: &EntityRef, entry: EntityEntry) -> Result<()> {
        let key = entry.key();
        if let Some(existing) = self.by_key.get(&key) {
            if *existing != entity.handle() {
                return Err(Error::illegal_state(
                    IllegalStateKind::NonUniqueObject,
                    Some(entry.entity_name.as_str()),
                    format!(
                        "a different object with the same identifier value was already associated with the session: {key}"
                    ),
                ));
            }
        }
        tracing::trace!(
            entity = %entry.entity_name,
            id = %entry.id,
            handle = %entity.handle(),
            status = ?entry.status,
            "Adding entity to persistence context"
        );
        self.by_key.insert(key, entity.handle());
        self.managed.insert(
            entity.handle(),
            Managed {
                entity: Arc::clone(entity),
                entry,
            },
        );
        Ok(())
    }

    pub fn entry(&self, handle: InstanceHandle) -> Option<&EntityEntry> {
        self.managed.get(&handle).map(|m| &m.entry)
    }

    pub fn entry_mut(&mut self, handle: InstanceHandle) -> Option<&mut EntityEntry> {
        self.managed.get_mut(&handle).map(|m| &mut m.entry)
    }

    pub fn entry_by_key(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.by_key.get(key).and_then(|h| self.entry(*h))
    }

    pub fn entity_by_key(&self, key: &EntityKey) -> Option<EntityRef> {
        self.by_key
            .get(key)
            .and_then(|h| self.managed.get(h))
            .map(|m| Arc::clone(&m.entity))
    }

    /// Stop managing the instance, returning its entry.
    pub fn remove_entity(&mut self, handle: InstanceHandle) -> Option<EntityEntry> {
        let managed = self.managed.remove(&handle)?;
        let key = managed.entry.key();
        if self.by_key.get(&key) == Some(&handle) {
            self.by_key.remove(&key);
        }
        tracing::trace!(
            entity = %managed.entry.entity_name,
            id = %managed.entry.id,
            "Removed entity from persistence context"
        );
        Some(managed.entry)
    }

    pub fn contains(&self, handle: InstanceHandle) -> bool {
        self.managed.contains_key(&handle)
    }

    pub fn proxy_for_key(&self, key: &EntityKey) -> Option<ProxyRef> {
        self.proxies.get(key).cloned()
    }

    pub fn add_proxy(&mut self, key: EntityKey, proxy: ProxyRef) {
        self.proxies.insert(key, proxy);
    }

    pub fn remove_proxy(&mut self, key: &EntityKey) -> Option<ProxyRef> {
        self.proxies.remove(key)
    }

    /// Concrete instance behind a reference, without loading.
    ///
    /// Uninitialized proxies resolve to the managed instance with the same
    /// key when there is one.
    pub fn unproxy(&self, reference: &EntityReference) -> Option<EntityRef> {
        if let Some(entity) = reference.implementation() {
            return Some(entity);
        }
        match reference {
            EntityReference::Proxy(p) => self
                .managed
                .values()
                .find(|m| {
                    m.entry.id == *p.id()
                        && (m.entity.entity_name() == p.entity_name()
                            || m.entity.descriptor().root_name() == p.entity_name())
                })
                .map(|m| Arc::clone(&m.entity)),
            EntityReference::Direct(_) => None,
        }
    }

    pub fn increment_cascade_level(&mut self) -> usize {
        self.cascade_level += 1;
        self.cascade_level
    }

    pub fn decrement_cascade_level(&mut self) -> usize {
        self.cascade_level = self.cascade_level.saturating_sub(1);
        self.cascade_level
    }

    pub fn cascade_level(&self) -> usize {
        self.cascade_level
    }

    pub fn clear(&mut self) {
        tracing::debug!(count = self.managed.len(), "Clearing persistence context");
        self.managed.clear();
        self.by_key.clear();
        self.proxies.clear();
        self.cascade_level = 0;
    }

    /// Managed instances with their entries, in handle order.
    pub fn entries(&self) -> impl Iterator<Item = (&EntityRef, &EntityEntry)> {
        self.managed.values().map(|m| (&m.entity, &m.entry))
    }

    /// Snapshot of the managed instances, in handle order.
    pub fn managed_entities(&self) -> Vec<EntityRef> {
        self.managed
            .values()
            .map(|m| Arc::clone(&m.entity))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.managed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::metamodel::{LongType, StringType};
    use graft_core::{EntityInstance, LazyProxy};

    fn descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::builder("Item")
                .id("id", LongType)
                .basic("name", StringType)
                .build()
                .unwrap(),
        )
    }

    fn entry_for(desc: &Arc<EntityDescriptor>, id: i64) -> EntityEntry {
        EntityEntry::new(
            desc,
            Value::BigInt(id),
            EntityStatus::Managed,
            vec![Value::Null],
            None,
            LockMode::None,
            true,
        )
    }

    #[test]
    fn test_entity_key_equality() {
        let a = EntityKey::for_root("Item", Value::BigInt(1));
        let b = EntityKey::for_root("Item", Value::BigInt(1));
        let c = EntityKey::for_root("Item", Value::Int(1));
        let d = EntityKey::for_root("Other", Value::BigInt(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.to_string(), "[Item#1]");
    }

    #[test]
    fn test_add_lookup_remove() {
        let desc = descriptor();
        let item = EntityInstance::with_id(&desc, 1_i64);
        let mut pc = PersistenceContext::new();
        pc.add_entity(&item, entry_for(&desc, 1)).unwrap();

        let key = EntityKey::new(&desc, Value::BigInt(1));
        assert!(pc.contains(item.handle()));
        assert!(Arc::ptr_eq(&pc.entity_by_key(&key).unwrap(), &item));
        assert_eq!(pc.entry_by_key(&key).unwrap().id, Value::BigInt(1));
        assert_eq!(pc.len(), 1);

        let removed = pc.remove_entity(item.handle()).unwrap();
        assert_eq!(removed.entity_name, "Item");
        assert!(pc.entity_by_key(&key).is_none());
        assert!(pc.is_empty());
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let desc = descriptor();
        let first = EntityInstance::with_id(&desc, 1_i64);
        let second = EntityInstance::with_id(&desc, 1_i64);
        let mut pc = PersistenceContext::new();
        pc.add_entity(&first, entry_for(&desc, 1)).unwrap();
        // re-adding the same instance is allowed
        pc.add_entity(&first, entry_for(&desc, 1)).unwrap();
        let err = pc.add_entity(&second, entry_for(&desc, 1)).unwrap_err();
        assert_eq!(err.illegal_state_kind(), Some(IllegalStateKind::NonUniqueObject));
    }

    #[test]
    fn test_cascade_level_counter() {
        let mut pc = PersistenceContext::new();
        assert_eq!(pc.increment_cascade_level(), 1);
        assert_eq!(pc.increment_cascade_level(), 2);
        assert_eq!(pc.decrement_cascade_level(), 1);
        assert_eq!(pc.decrement_cascade_level(), 0);
        assert_eq!(pc.decrement_cascade_level(), 0);
    }

    #[test]
    fn test_unproxy_resolves_managed_instance() {
        let desc = descriptor();
        let item = EntityInstance::with_id(&desc, 5_i64);
        let mut pc = PersistenceContext::new();
        pc.add_entity(&item, entry_for(&desc, 5)).unwrap();

        let proxy = LazyProxy::new("Item", Value::BigInt(5));
        let resolved = pc.unproxy(&EntityReference::Proxy(proxy)).unwrap();
        assert!(Arc::ptr_eq(&resolved, &item));

        let missing = LazyProxy::new("Item", Value::BigInt(6));
        assert!(pc.unproxy(&EntityReference::Proxy(missing)).is_none());
    }
}
