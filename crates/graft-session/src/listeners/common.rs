//! Helpers shared by the default listeners.

use crate::persistence_context::{EntityEntry, EntityKey, EntityStatus};
use crate::session::Session;
use crate::versioning;
use graft_core::{
    EntityInstance, EntityRef, Error, IdGeneration, IdentifierGenerationError, LockMode,
    PropertyValue, Result, Value,
};
use std::sync::Arc;

/// Lifecycle state of an instance relative to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Managed and not removed.
    Persistent,
    /// Never saved.
    Transient,
    /// Saved, but not associated with this session.
    Detached,
    /// Removed in this session.
    Deleted,
}

/// Whether `entity` has never been saved.
///
/// The descriptor's unsaved-value heuristics decide first, then `assumed`.
/// When both are silent the storage is asked for the row.
pub fn is_transient(session: &Session, entity: &EntityInstance, assumed: Option<bool>) -> Result<bool> {
    let id = entity.id();
    if let Some(decided) = entity
        .descriptor()
        .is_transient(id.as_ref(), entity.version().as_ref())
    {
        return Ok(decided);
    }
    if let Some(assumed) = assumed {
        return Ok(assumed);
    }
    let Some(id) = id else {
        return Ok(true);
    };
    Ok(session.database_snapshot(entity.descriptor(), &id)?.is_none())
}

/// Classify `entity`, consulting its entry first.
pub fn entity_state(session: &Session, entity: &EntityInstance, assumed: Option<bool>) -> Result<EntityState> {
    if let Some(entry) = session.persistence_context().entry(entity.handle()) {
        return Ok(if entry.is_deleted() {
            EntityState::Deleted
        } else {
            EntityState::Persistent
        });
    }
    if is_transient(session, entity, assumed)? {
        Ok(EntityState::Transient)
    } else {
        Ok(EntityState::Detached)
    }
}

fn generate_id(session: &Session, entity: &EntityInstance, requested_id: Option<Value>) -> Result<Value> {
    if let Some(id) = requested_id {
        return Ok(id);
    }
    let descriptor = entity.descriptor();
    match &descriptor.identifier().generation {
        IdGeneration::Assigned => entity.id().ok_or_else(|| {
            Error::IdentifierGeneration(IdentifierGenerationError {
                entity: descriptor.name().to_string(),
                message: "ids for this entity must be manually assigned before saving".to_string(),
            })
        }),
        IdGeneration::Sequence(_) => session.factory().id_generator().next_id(descriptor),
    }
}

/// Make a transient instance managed and schedule its insert.
///
/// Assigns the identifier and seeds the version. Cascades are left to the
/// caller.
pub fn save_transient(session: &mut Session, entity: &EntityRef, requested_id: Option<Value>) -> Result<Value> {
    let descriptor = Arc::clone(entity.descriptor());
    let id = generate_id(session, entity, requested_id)?;
    entity.set_id(Some(id.clone()));

    let mut state = entity.disassemble();
    if let (Some(index), Some(support)) = (descriptor.version_index(), descriptor.version_support()) {
        if versioning::seed_version(&mut state, index, support, &*session) {
            let mut properties = entity.properties();
            if let Some(slot) = properties.get_mut(index) {
                *slot = PropertyValue::Basic(state[index].clone());
            }
            entity.replace_properties(properties);
        }
    }

    let status = if descriptor.is_mutable() {
        EntityStatus::Managed
    } else {
        EntityStatus::ReadOnly
    };
    let version = versioning::get_version(&state, &descriptor);
    let entry = EntityEntry::new(&descriptor, id.clone(), status, state, version, LockMode::None, false);
    session.persistence_context_mut().add_entity(entity, entry)?;
    session.action_queue_mut().add_insert(Arc::clone(entity));
    tracing::debug!(entity = %descriptor.name(), id = %id, "Saved transient instance");
    Ok(id)
}

/// Associate a detached instance with the session as it currently is.
pub fn reassociate(session: &mut Session, entity: &EntityRef, id: Value) -> Result<()> {
    let descriptor = Arc::clone(entity.descriptor());
    let state = entity.disassemble();
    let status = if descriptor.is_mutable() {
        EntityStatus::Managed
    } else {
        EntityStatus::ReadOnly
    };
    let version = versioning::get_version(&state, &descriptor);
    tracing::trace!(entity = %descriptor.name(), id = %id, "Reassociating detached instance");
    let entry = EntityEntry::new(&descriptor, id, status, state, version, LockMode::None, true);
    session.persistence_context_mut().add_entity(entity, entry)
}

/// Key of an unmanaged instance, if it has an identifier.
pub fn key_of(entity: &EntityInstance) -> Option<EntityKey> {
    entity.id().map(|id| EntityKey::new(entity.descriptor(), id))
}
