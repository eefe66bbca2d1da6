//! Storage abstraction consumed by sessions.
//!
//! Rows are exchanged in disassembled form: one [`Value`] per attribute of
//! the entity descriptor, associations as target identifiers. The engine
//! never issues SQL itself; a loader's statement is passed through so that
//! real backends can execute it.
//!
//! [`MemoryStorage`] keeps rows in a map and undoes uncommitted writes on
//! rollback. It serves tests and embedded use.

use crate::persistence_context::EntityKey;
use graft_core::{
    EntityDescriptor, EntityLoader, Error, Result, StorageError, StorageErrorKind, Value,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Concrete entity name of the row.
    pub entity_name: String,
    /// Disassembled attribute values in descriptor order.
    pub values: Vec<Value>,
}

/// Backend the session reads and writes rows through.
///
/// `update` and `delete` take the version the caller last saw. When it is
/// given the write only applies if the stored version still matches, and
/// `Ok(false)` reports a row that moved or vanished.
pub trait Storage: Send + Sync {
    fn load(
        &self,
        loader: &EntityLoader,
        descriptor: &EntityDescriptor,
        id: &Value,
    ) -> Result<Option<StoredRow>>;

    fn insert(&self, descriptor: &EntityDescriptor, id: &Value, values: &[Value]) -> Result<()>;

    fn update(
        &self,
        descriptor: &EntityDescriptor,
        id: &Value,
        values: &[Value],
        expected_version: Option<&Value>,
    ) -> Result<bool>;

    fn delete(
        &self,
        descriptor: &EntityDescriptor,
        id: &Value,
        expected_version: Option<&Value>,
    ) -> Result<bool>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;
}

// ============================================================================
// MemoryStorage
// ============================================================================

#[derive(Debug)]
enum Undo {
    Inserted(EntityKey),
    Replaced(EntityKey, StoredRow),
    Removed(EntityKey, StoredRow),
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<EntityKey, StoredRow>,
    undo: Vec<Undo>,
    loads: usize,
    inserts: usize,
    updates: usize,
    deletes: usize,
    last_sql: Option<String>,
}

/// In-process storage with transactional undo.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a committed row, bypassing the undo log.
    pub fn put_row(&self, descriptor: &EntityDescriptor, id: impl Into<Value>, values: Vec<Value>) {
        let key = EntityKey::new(descriptor, id.into());
        self.lock().rows.insert(
            key,
            StoredRow {
                entity_name: descriptor.name().to_string(),
                values,
            },
        );
    }

    /// Current row for `root` entity name and `id`.
    pub fn row(&self, root: &str, id: impl Into<Value>) -> Option<StoredRow> {
        self.lock()
            .rows
            .get(&EntityKey::for_root(root, id.into()))
            .cloned()
    }

    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn load_count(&self) -> usize {
        self.lock().loads
    }

    pub fn insert_count(&self) -> usize {
        self.lock().inserts
    }

    pub fn update_count(&self) -> usize {
        self.lock().updates
    }

    pub fn delete_count(&self) -> usize {
        self.lock().deletes
    }

    /// Statement of the most recent load.
    pub fn last_sql(&self) -> Option<String> {
        self.lock().last_sql.clone()
    }
}

fn version_matches(
    descriptor: &EntityDescriptor,
    row: &StoredRow,
    expected: Option<&Value>,
) -> bool {
    let (Some(expected), Some(index)) = (expected, descriptor.version_index()) else {
        return true;
    };
    let stored = row.values.get(index).unwrap_or(&Value::Null);
    descriptor
        .attribute(index)
        .is_some_and(|attr| attr.is_equal(stored, expected))
}

impl Storage for MemoryStorage {
    fn load(
        &self,
        loader: &EntityLoader,
        descriptor: &EntityDescriptor,
        id: &Value,
    ) -> Result<Option<StoredRow>> {
        let mut state = self.lock();
        state.loads += 1;
        state.last_sql = Some(loader.sql.clone());
        tracing::trace!(
            entity = %descriptor.name(),
            id = %id,
            lock_mode = %loader.lock_mode,
            "Loading row"
        );
        Ok(state
            .rows
            .get(&EntityKey::new(descriptor, id.clone()))
            .cloned())
    }

    fn insert(&self, descriptor: &EntityDescriptor, id: &Value, values: &[Value]) -> Result<()> {
        let key = EntityKey::new(descriptor, id.clone());
        let mut state = self.lock();
        if state.rows.contains_key(&key) {
            return Err(Error::Storage(StorageError {
                kind: StorageErrorKind::Constraint,
                message: format!("duplicate primary key {key}"),
                source: None,
            }));
        }
        state.rows.insert(
            key.clone(),
            StoredRow {
                entity_name: descriptor.name().to_string(),
                values: values.to_vec(),
            },
        );
        state.undo.push(Undo::Inserted(key));
        state.inserts += 1;
        Ok(())
    }

    fn update(
        &self,
        descriptor: &EntityDescriptor,
        id: &Value,
        values: &[Value],
        expected_version: Option<&Value>,
    ) -> Result<bool> {
        let key = EntityKey::new(descriptor, id.clone());
        let mut state = self.lock();
        let Some(row) = state.rows.get_mut(&key) else {
            return Ok(false);
        };
        if !version_matches(descriptor, row, expected_version) {
            return Ok(false);
        }
        let previous = std::mem::replace(&mut row.values, values.to_vec());
        let entity_name = row.entity_name.clone();
        state.undo.push(Undo::Replaced(
            key,
            StoredRow {
                entity_name,
                values: previous,
            },
        ));
        state.updates += 1;
        Ok(true)
    }

    fn delete(
        &self,
        descriptor: &EntityDescriptor,
        id: &Value,
        expected_version: Option<&Value>,
    ) -> Result<bool> {
        let key = EntityKey::new(descriptor, id.clone());
        let mut state = self.lock();
        let matches = state
            .rows
            .get(&key)
            .is_some_and(|row| version_matches(descriptor, row, expected_version));
        if !matches {
            return Ok(false);
        }
        if let Some(row) = state.rows.remove(&key) {
            state.undo.push(Undo::Removed(key, row));
        }
        state.deletes += 1;
        Ok(true)
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.lock();
        tracing::debug!(writes = state.undo.len(), "Committing memory storage");
        state.undo.clear();
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.lock();
        tracing::debug!(writes = state.undo.len(), "Rolling back memory storage");
        while let Some(undo) = state.undo.pop() {
            match undo {
                Undo::Inserted(key) => {
                    state.rows.remove(&key);
                }
                Undo::Replaced(key, row) | Undo::Removed(key, row) => {
                    state.rows.insert(key, row);
                }
            }
        }
        Ok(())
    }
}
