//! Default evict listener.

use crate::cascade::{CascadeContext, CascadePoint, CascadingAction, cascade};
use crate::event::{EvictEvent, EvictEventListener, InstantiableListener, Listener};
use crate::persistence_context::EntityKey;
use crate::session::Session;
use graft_core::{EntityReference, EntityRef, Result};

/// Detaches instances (and proxies) from the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEvictEventListener;

impl Listener for DefaultEvictEventListener {}

impl InstantiableListener for DefaultEvictEventListener {
    fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }
}

impl EvictEventListener for DefaultEvictEventListener {
    fn on_evict(&self, session: &mut Session, event: &mut EvictEvent) -> Result<()> {
        match &event.entity {
            EntityReference::Proxy(proxy) => {
                let descriptor = session.factory().metamodel().entity(proxy.entity_name())?;
                let key = EntityKey::new(descriptor, proxy.id().clone());
                session.persistence_context_mut().remove_proxy(&key);
                if let Some(entity) = proxy.implementation() {
                    evict_entity(session, &entity)?;
                }
                Ok(())
            }
            EntityReference::Direct(entity) => evict_entity(session, entity),
        }
    }
}

fn evict_entity(session: &mut Session, entity: &EntityRef) -> Result<()> {
    let Some(entry) = session.persistence_context_mut().remove_entity(entity.handle()) else {
        tracing::trace!(entity = %entity.entity_name(), "Evicting instance the session does not manage");
        return Ok(());
    };
    session.action_queue_mut().remove_actions_for(entity.handle());
    tracing::debug!(entity = %entry.entity_name, id = %entry.id, "Evicted entity");
    cascade(
        session,
        CascadingAction::Evict,
        CascadePoint::AfterEvict,
        entity,
        &mut CascadeContext::None,
    )
}
