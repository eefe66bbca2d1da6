//! Default persist listener and the save-update cascade used by flush.

use super::common::{EntityState, entity_state, is_transient, save_transient};
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction, cascade};
use crate::event::{InstantiableListener, Listener, PersistEvent, PersistEventListener};
use crate::persistence_context::EntityStatus;
use crate::session::Session;
use graft_core::{EntityRef, Error, IllegalStateKind, InstanceHandle, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// Makes transient instances persistent, cascading `persist`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPersistEventListener;

impl Listener for DefaultPersistEventListener {}

impl InstantiableListener for DefaultPersistEventListener {
    fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }
}

impl PersistEventListener for DefaultPersistEventListener {
    fn on_persist_in_context(
        &self,
        session: &mut Session,
        event: &mut PersistEvent,
        created: &mut HashSet<InstanceHandle>,
    ) -> Result<()> {
        let entity = Arc::clone(&event.entity);
        match entity_state(session, &entity, None)? {
            EntityState::Detached => Err(Error::illegal_state(
                IllegalStateKind::DetachedPersist,
                Some(entity.entity_name()),
                format!("detached entity passed to persist: {}", entity.entity_name()),
            )),
            EntityState::Persistent => {
                if created.insert(entity.handle()) {
                    just_cascade(session, &entity, created)?;
                }
                Ok(())
            }
            EntityState::Transient => {
                if created.insert(entity.handle()) {
                    save_with_cascades(session, CascadingAction::Persist, &entity, created)?;
                }
                Ok(())
            }
            EntityState::Deleted => {
                if let Some(entry) = session.persistence_context_mut().entry_mut(entity.handle()) {
                    entry.status = EntityStatus::Managed;
                    entry.deleted_state = None;
                }
                session.action_queue_mut().unschedule_deletion(entity.handle());
                tracing::debug!(entity = %entity.entity_name(), "Un-deleting instance on persist");
                if created.insert(entity.handle()) {
                    just_cascade(session, &entity, created)?;
                }
                Ok(())
            }
        }
    }
}

fn just_cascade(session: &mut Session, entity: &EntityRef, created: &mut HashSet<InstanceHandle>) -> Result<()> {
    for point in [CascadePoint::BeforeInsertAfterDelete, CascadePoint::AfterInsertBeforeDelete] {
        cascade(
            session,
            CascadingAction::Persist,
            point,
            entity,
            &mut CascadeContext::Visited(&mut *created),
        )?;
    }
    Ok(())
}

/// Save a transient instance between its before-insert and after-insert cascades.
fn save_with_cascades(
    session: &mut Session,
    action: CascadingAction,
    entity: &EntityRef,
    visited: &mut HashSet<InstanceHandle>,
) -> Result<()> {
    cascade(
        session,
        action,
        CascadePoint::BeforeInsertAfterDelete,
        entity,
        &mut CascadeContext::Visited(&mut *visited),
    )?;
    save_transient(session, entity, None)?;
    cascade(
        session,
        action,
        CascadePoint::AfterInsertBeforeDelete,
        entity,
        &mut CascadeContext::Visited(&mut *visited),
    )
}

/// Save-update reached through a flush cascade.
///
/// Unmanaged transient instances are saved; detached ones are left alone.
pub fn save_or_update(session: &mut Session, entity: &EntityRef, visited: &mut HashSet<InstanceHandle>) -> Result<()> {
    if session.persistence_context().contains(entity.handle()) || !visited.insert(entity.handle()) {
        return Ok(());
    }
    if !is_transient(session, entity, None)? {
        tracing::trace!(entity = %entity.entity_name(), "Skipping detached instance in save-update cascade");
        return Ok(());
    }
    save_with_cascades(session, CascadingAction::SaveUpdate, entity, visited)
}
