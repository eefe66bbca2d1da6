//! Default refresh listener.

use super::load::{assemble, load_row, register_loaded};
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction, cascade};
use crate::event::{InstantiableListener, Listener, RefreshEvent, RefreshEventListener};
use crate::persistence_context::{EntityKey, EntityStatus};
use crate::session::Session;
use graft_core::{
    Error, IdentityMismatchError, IdentityMismatchKind, IllegalStateKind, InstanceHandle,
    NotFoundError, Result,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Re-reads instance state from storage, discarding unflushed changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRefreshEventListener;

impl Listener for DefaultRefreshEventListener {}

impl InstantiableListener for DefaultRefreshEventListener {
    fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }
}

impl RefreshEventListener for DefaultRefreshEventListener {
    fn on_refresh_in_context(
        &self,
        session: &mut Session,
        event: &mut RefreshEvent,
        refreshed: &mut HashSet<InstanceHandle>,
    ) -> Result<()> {
        let entity = Arc::clone(&event.entity);
        if refreshed.contains(&entity.handle()) {
            tracing::trace!(entity = %entity.entity_name(), "Already refreshed");
            return Ok(());
        }

        let descriptor = Arc::clone(entity.descriptor());
        let entry = session.persistence_context().entry(entity.handle()).cloned();
        let id = match &entry {
            None => {
                let id = entity.id().ok_or_else(|| {
                    Error::illegal_state(
                        IllegalStateKind::NotManaged,
                        Some(entity.entity_name()),
                        "transient instance passed to refresh",
                    )
                })?;
                let key = EntityKey::new(&descriptor, id.clone());
                if session.persistence_context().entry_by_key(&key).is_some() {
                    return Err(Error::illegal_state(
                        IllegalStateKind::NonUniqueObject,
                        Some(entity.entity_name()),
                        format!(
                            "attempted to refresh a detached instance while a persistent instance is associated with the session: {key}"
                        ),
                    ));
                }
                id
            }
            Some(entry) => {
                if !entry.exists_in_database {
                    return Err(Error::NotFound(NotFoundError {
                        entity: entry.entity_name.clone(),
                        id: entry.id.clone(),
                    }));
                }
                entry.id.clone()
            }
        };

        refreshed.insert(entity.handle());
        cascade(
            session,
            CascadingAction::Refresh,
            CascadePoint::BeforeRefresh,
            &entity,
            &mut CascadeContext::Visited(refreshed),
        )?;

        let read_only = entry
            .as_ref()
            .is_some_and(|e| e.status == EntityStatus::ReadOnly);
        if entry.is_some() {
            session.persistence_context_mut().remove_entity(entity.handle());
        }

        let Some(row) = load_row(session, &descriptor, &id, event.lock_mode)? else {
            return Err(Error::NotFound(NotFoundError {
                entity: descriptor.name().to_string(),
                id,
            }));
        };
        if row.entity_name != descriptor.name() {
            return Err(Error::IdentityMismatch(IdentityMismatchError {
                kind: IdentityMismatchKind::WrongClass,
                entity: descriptor.name().to_string(),
                message: format!("row for {} is now of type {}", descriptor.name(), row.entity_name),
            }));
        }
        assemble(session, &entity, &row)?;
        tracing::debug!(entity = %descriptor.name(), id = %id, "Refreshed entity");
        register_loaded(session, &entity, row.values, event.lock_mode, read_only)
    }
}
