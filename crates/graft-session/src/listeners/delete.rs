//! Default delete listener.

use super::common::{is_transient, reassociate};
use crate::action_queue::DeleteAction;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction, cascade};
use crate::event::{DeleteEvent, DeleteEventListener, InstantiableListener, Listener};
use crate::persistence_context::EntityStatus;
use crate::session::Session;
use graft_core::{Error, IllegalStateKind, InstanceHandle, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// Schedules removal of managed or detached instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDeleteEventListener;

impl Listener for DefaultDeleteEventListener {}

impl InstantiableListener for DefaultDeleteEventListener {
    fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }
}

impl DeleteEventListener for DefaultDeleteEventListener {
    fn on_delete_in_context(
        &self,
        session: &mut Session,
        event: &mut DeleteEvent,
        transient: &mut HashSet<InstanceHandle>,
    ) -> Result<()> {
        let entity = Arc::clone(&event.entity);

        if !session.persistence_context().contains(entity.handle()) {
            if is_transient(session, &entity, None)? {
                if transient.insert(entity.handle()) {
                    tracing::trace!(entity = %entity.entity_name(), "Deleting transient instance");
                    for point in [CascadePoint::AfterInsertBeforeDelete, CascadePoint::BeforeInsertAfterDelete] {
                        cascade(
                            session,
                            CascadingAction::Delete,
                            point,
                            &entity,
                            &mut CascadeContext::Visited(&mut *transient),
                        )?;
                    }
                }
                return Ok(());
            }
            let id = entity.id().ok_or_else(|| {
                Error::illegal_state(
                    IllegalStateKind::NotManaged,
                    Some(entity.entity_name()),
                    "the detached instance passed to delete had a null identifier",
                )
            })?;
            reassociate(session, &entity, id)?;
        }

        let Some(entry) = session.persistence_context_mut().entry_mut(entity.handle()) else {
            return Ok(());
        };
        if entry.is_deleted() {
            tracing::trace!(entity = %entry.entity_name, id = %entry.id, "Instance was already deleted");
            return Ok(());
        }
        let deleted_state = entity.disassemble();
        entry.deleted_state = Some(deleted_state.clone());
        entry.status = EntityStatus::Deleted;
        let action = DeleteAction {
            entity: Arc::clone(&entity),
            id: entry.id.clone(),
            version: entry.version.clone(),
            deleted_state,
        };
        tracing::debug!(entity = %entry.entity_name, id = %entry.id, "Deleting entity");

        cascade(
            session,
            CascadingAction::Delete,
            CascadePoint::AfterInsertBeforeDelete,
            &entity,
            &mut CascadeContext::Visited(&mut *transient),
        )?;
        session.action_queue_mut().add_delete(action);
        cascade(
            session,
            CascadingAction::Delete,
            CascadePoint::BeforeInsertAfterDelete,
            &entity,
            &mut CascadeContext::Visited(&mut *transient),
        )
    }
}
