//! Default lock listener and lock upgrades.

use super::common::{is_transient, reassociate};
use super::load::load_row;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction, cascade};
use crate::event::{InstantiableListener, Listener, LockEvent, LockEventListener};
use crate::persistence_context::EntityStatus;
use crate::session::Session;
use crate::versioning;
use graft_core::{
    EntityInstance, Error, IllegalStateKind, LockMode, Result, StaleStateError,
};
use std::sync::Arc;

/// Reassociates unmanaged instances and raises lock modes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLockEventListener;

impl Listener for DefaultLockEventListener {}

impl InstantiableListener for DefaultLockEventListener {
    fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }
}

impl LockEventListener for DefaultLockEventListener {
    fn on_lock(&self, session: &mut Session, event: &mut LockEvent) -> Result<()> {
        let entity = Arc::clone(&event.entity);
        if !session.persistence_context().contains(entity.handle()) {
            if is_transient(session, &entity, Some(false))? {
                return Err(Error::illegal_state(
                    IllegalStateKind::TransientReference,
                    Some(entity.entity_name()),
                    format!("cannot lock an unsaved transient instance: {}", entity.entity_name()),
                ));
            }
            let id = entity.id().ok_or_else(|| {
                Error::mapping(Some(entity.entity_name()), "cannot lock an instance without identifier")
            })?;
            reassociate(session, &entity, id)?;
            cascade(
                session,
                CascadingAction::Lock(event.lock_mode),
                CascadePoint::AfterLock,
                &entity,
                &mut CascadeContext::None,
            )?;
        }
        upgrade_lock(session, &entity, event.lock_mode)
    }
}

/// Raise the entry's lock mode to `requested` if it is higher.
///
/// Read and pessimistic modes verify the row against the entry's version.
/// Optimistic modes are checked at commit, forced increments apply at the
/// next flush.
pub fn upgrade_lock(session: &mut Session, entity: &EntityInstance, requested: LockMode) -> Result<()> {
    let Some(entry) = session.persistence_context().entry(entity.handle()) else {
        return Err(Error::illegal_state(
            IllegalStateKind::NotManaged,
            Some(entity.entity_name()),
            "cannot lock an instance that is not associated with the session",
        ));
    };
    if requested <= entry.lock_mode {
        return Ok(());
    }
    if entry.status != EntityStatus::Managed {
        return Err(Error::illegal_state(
            IllegalStateKind::ObjectDeleted,
            Some(entry.entity_name.as_str()),
            format!("attempted to lock a deleted instance: {}", entry.key()),
        ));
    }
    let descriptor = Arc::clone(entry.descriptor());
    let (id, version) = (entry.id.clone(), entry.version.clone());
    let optimistic = matches!(
        requested,
        LockMode::Optimistic | LockMode::OptimisticForceIncrement
    );
    if optimistic && !descriptor.is_versioned() {
        return Err(Error::mapping(
            Some(descriptor.name()),
            format!("lock mode {requested} requires a versioned entity"),
        ));
    }

    tracing::trace!(
        entity = %descriptor.name(),
        id = %id,
        from = %entry.lock_mode,
        to = %requested,
        "Upgrading lock"
    );
    if !optimistic && entry.exists_in_database {
        let row = load_row(session, &descriptor, &id, requested)?;
        let moved = match row {
            None => true,
            Some(row) => {
                descriptor.is_versioned() && versioning::get_version(&row.values, &descriptor) != version
            }
        };
        if moved {
            let statistics = session.factory().statistics();
            if statistics.is_enabled() {
                statistics.optimistic_failure(descriptor.name());
            }
            return Err(Error::StaleState(StaleStateError {
                entity: descriptor.name().to_string(),
                id,
                message: "row was updated or deleted by another transaction".to_string(),
            }));
        }
    }

    if let Some(entry) = session.persistence_context_mut().entry_mut(entity.handle()) {
        entry.lock_mode = requested;
    }
    Ok(())
}
