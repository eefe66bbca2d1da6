//! Default load listener and row assembly.

use super::lock::upgrade_lock;
use crate::event::{InstantiableListener, Listener, LoadEvent, LoadEventListener, POST_LOAD, PostLoadEvent};
use crate::persistence_context::{EntityEntry, EntityKey, EntityStatus};
use crate::session::Session;
use crate::storage::StoredRow;
use crate::versioning;
use graft_core::{
    AttributeKind, EntityDescriptor, EntityInstance, EntityRef, Error, IdentityMismatchError,
    IdentityMismatchKind, LockMode, PropertyValue, Result, Value,
};
use std::sync::Arc;

/// Resolves loads from the persistence context first, then from storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLoadEventListener;

impl Listener for DefaultLoadEventListener {}

impl InstantiableListener for DefaultLoadEventListener {
    fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }
}

impl LoadEventListener for DefaultLoadEventListener {
    fn on_load(&self, session: &mut Session, event: &mut LoadEvent) -> Result<()> {
        if event.result.is_some() {
            return Ok(());
        }
        let descriptor = Arc::clone(session.factory().metamodel().entity(&event.entity_name)?);
        let key = EntityKey::new(&descriptor, event.id.clone());

        let cached = session.persistence_context().entity_by_key(&key);
        if let Some(entity) = cached {
            let deleted = session
                .persistence_context()
                .entry(entity.handle())
                .is_some_and(EntityEntry::is_deleted);
            if deleted {
                tracing::trace!(key = %key, "Load resolved to a removed instance");
                return Ok(());
            }
            check_subtype(session, &event.entity_name, &entity)?;
            upgrade_lock(session, &entity, event.lock_mode)?;
            tracing::trace!(key = %key, "Resolved load from persistence context");
            event.result = Some(entity);
            return Ok(());
        }

        let Some(row) = load_row(session, &descriptor, &event.id, event.lock_mode)? else {
            tracing::trace!(key = %key, "No row found");
            return Ok(());
        };
        let metamodel = session.factory().metamodel();
        if !metamodel.is_subtype(&row.entity_name, descriptor.name()) {
            return Err(wrong_class(&event.entity_name, &row.entity_name));
        }
        let concrete = Arc::clone(metamodel.entity(&row.entity_name)?);
        let entity = EntityInstance::with_id(&concrete, event.id.clone());
        assemble(session, &entity, &row)?;
        register_loaded(session, &entity, row.values, event.lock_mode, false)?;
        event.result = Some(entity);
        Ok(())
    }
}

fn wrong_class(expected: &str, actual: &str) -> Error {
    Error::IdentityMismatch(IdentityMismatchError {
        kind: IdentityMismatchKind::WrongClass,
        entity: expected.to_string(),
        message: format!("object with the given identifier is of type {actual}, not {expected}"),
    })
}

fn check_subtype(session: &Session, expected: &str, entity: &EntityInstance) -> Result<()> {
    if session
        .factory()
        .metamodel()
        .is_subtype(entity.entity_name(), expected)
    {
        Ok(())
    } else {
        Err(wrong_class(expected, entity.entity_name()))
    }
}

/// Read one row through the descriptor's loader for `lock_mode`.
pub fn load_row(
    session: &Session,
    descriptor: &EntityDescriptor,
    id: &Value,
    lock_mode: LockMode,
) -> Result<Option<StoredRow>> {
    let loader = descriptor.loader(lock_mode);
    tracing::trace!(entity = %descriptor.name(), id = %id, lock_mode = %lock_mode, "Loading row");
    session.factory().storage().load(&loader, descriptor, id)
}

/// Turn a stored row into property values on `entity`.
///
/// Associations become session references; nothing is loaded eagerly.
pub fn assemble(session: &mut Session, entity: &EntityInstance, row: &StoredRow) -> Result<()> {
    let descriptor = Arc::clone(entity.descriptor());
    let mut properties = Vec::with_capacity(descriptor.attributes().len());
    for (attr, value) in descriptor.attributes().iter().zip(&row.values) {
        let property = match &attr.kind {
            AttributeKind::Basic(_) => PropertyValue::Basic(value.clone()),
            AttributeKind::ToOne { target, .. } => {
                if value.is_null() {
                    PropertyValue::ToOne(None)
                } else {
                    PropertyValue::ToOne(Some(session.reference(target, value.clone())?))
                }
            }
            AttributeKind::ToMany { target, .. } => {
                let ids = value.as_array().unwrap_or_default();
                PropertyValue::ToMany(
                    ids.iter()
                        .map(|id| session.reference(target, id.clone()))
                        .collect::<Result<_>>()?,
                )
            }
        };
        properties.push(property);
    }
    entity.replace_properties(properties);
    if let Some(tracker) = entity.dirtiness() {
        tracker.clear_dirty();
    }
    Ok(())
}

/// Add an entry for a freshly loaded instance and notify post-load listeners.
pub fn register_loaded(
    session: &mut Session,
    entity: &EntityRef,
    loaded_state: Vec<Value>,
    lock_mode: LockMode,
    read_only: bool,
) -> Result<()> {
    let descriptor = Arc::clone(entity.descriptor());
    let id = entity.id().unwrap_or(Value::Null);
    let status = if read_only || !descriptor.is_mutable() {
        EntityStatus::ReadOnly
    } else {
        EntityStatus::Managed
    };
    let version = versioning::get_version(&loaded_state, &descriptor);
    let entry = EntityEntry::new(&descriptor, id.clone(), status, loaded_state, version, lock_mode, true);
    let key = entry.key();
    session.persistence_context_mut().add_entity(entity, entry)?;
    if let Some(proxy) = session.persistence_context().proxy_for_key(&key) {
        if proxy.set_implementation(Arc::clone(entity)).is_err() {
            tracing::trace!(key = %key, "Proxy already initialized");
        }
    }

    let factory = Arc::clone(session.factory());
    let event = PostLoadEvent {
        entity: Arc::clone(entity),
        id,
    };
    for listener in factory.listeners().group(&POST_LOAD)?.iter() {
        listener.on_post_load(session, &event)?;
    }
    factory.statistics().entity_loaded(descriptor.name());
    tracing::debug!(entity = %descriptor.name(), id = %event.id, "Loaded entity");
    Ok(())
}
