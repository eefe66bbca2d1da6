//! Default flush listener.
//!
//! # Design
//!
//! A flush runs in three phases:
//!
//! 1. **Cascade**: save-update cascades from every managed instance so that
//!    newly reachable transient instances get saved.
//! 2. **Dirty check**: each managed row is compared against its loaded
//!    snapshot (or its tracker) and an update is scheduled, incrementing
//!    the version when a versionable attribute changed or a lock forces it.
//! 3. **Execute**: scheduled inserts, updates and deletes run in order.

use crate::action_queue::{UpdateAction, check_transient_references, execute_actions};
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction, cascade};
use crate::event::{FlushEvent, FlushEventListener, InstantiableListener, Listener};
use crate::persistence_context::{EntityEntry, EntityStatus};
use crate::session::Session;
use crate::versioning;
use graft_core::{EntityInstance, EntityRef, PropertyValue, Result, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Synchronizes managed state with storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFlushEventListener;

impl Listener for DefaultFlushEventListener {}

impl InstantiableListener for DefaultFlushEventListener {
    fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }
}

impl FlushEventListener for DefaultFlushEventListener {
    fn on_flush(&self, session: &mut Session, event: &mut FlushEvent) -> Result<()> {
        tracing::debug!(
            managed = session.persistence_context().len(),
            "Flushing session"
        );
        prepare_entity_flushes(session)?;
        schedule_updates(session)?;
        event.result = execute_actions(session)?;
        session.factory().statistics().flushed();
        tracing::info!(
            inserted = event.result.inserted,
            updated = event.result.updated,
            deleted = event.result.deleted,
            "Flush complete"
        );
        Ok(())
    }
}

fn prepare_entity_flushes(session: &mut Session) -> Result<()> {
    let mut visited = HashSet::new();
    let candidates: Vec<EntityRef> = session
        .persistence_context()
        .entries()
        .filter(|(_, entry)| matches!(entry.status, EntityStatus::Managed | EntityStatus::ReadOnly))
        .map(|(entity, _)| Arc::clone(entity))
        .collect();
    for entity in candidates {
        cascade(
            session,
            CascadingAction::SaveUpdate,
            CascadePoint::BeforeFlush,
            &entity,
            &mut CascadeContext::Visited(&mut visited),
        )?;
    }
    Ok(())
}

/// Whether the entry takes part in dirty checking.
fn is_flushable(entry: &EntityEntry) -> bool {
    entry.status == EntityStatus::Managed && entry.exists_in_database && entry.descriptor().is_mutable()
}

/// Indexes of attributes that differ from the loaded snapshot.
///
/// Tracker-enabled instances report their own dirty attributes. The version
/// attribute is never reported.
pub fn dirty_attributes(entity: &EntityInstance, entry: &EntityEntry, current: &[Value]) -> Vec<usize> {
    let descriptor = entry.descriptor();
    let version_index = descriptor.version_index();
    let mut dirty: Vec<usize> = match entity.dirtiness() {
        Some(tracker) => tracker
            .tracked_dirty_fields()
            .iter()
            .filter_map(|name| descriptor.index_of(name))
            .collect(),
        None => descriptor
            .attributes()
            .iter()
            .enumerate()
            .filter(|(i, attr)| match (entry.loaded_state.get(*i), current.get(*i)) {
                (Some(loaded), Some(now)) => !attr.is_equal(loaded, now),
                (None, Some(_)) => true,
                _ => false,
            })
            .map(|(i, _)| i)
            .collect(),
    };
    dirty.retain(|i| Some(*i) != version_index);
    dirty.sort_unstable();
    dirty
}

/// Whether any managed instance differs from its snapshot.
pub fn has_dirty_entities(session: &Session) -> bool {
    session.persistence_context().entries().any(|(entity, entry)| {
        is_flushable(entry)
            && (entry.lock_mode.forces_increment()
                || !dirty_attributes(entity, entry, &entity.disassemble()).is_empty())
    })
}

fn schedule_updates(session: &mut Session) -> Result<()> {
    let flushable: Vec<(EntityRef, EntityEntry)> = session
        .persistence_context()
        .entries()
        .filter(|(_, entry)| is_flushable(entry))
        .map(|(entity, entry)| (Arc::clone(entity), entry.clone()))
        .collect();

    for (entity, entry) in flushable {
        check_transient_references(session, &entity)?;
        let mut state = entity.disassemble();
        let dirty = dirty_attributes(&entity, &entry, &state);
        let forced = entry.lock_mode.forces_increment();
        if dirty.is_empty() && !forced {
            continue;
        }

        let descriptor = Arc::clone(entry.descriptor());
        let has_dirty_collections = dirty
            .iter()
            .any(|&i| descriptor.attribute(i).is_some_and(|a| a.is_collection()));
        let mut next_version = entry.version.clone();
        if let (Some(index), Some(support)) = (descriptor.version_index(), descriptor.version_support()) {
            let required = versioning::is_version_increment_required(
                &dirty,
                has_dirty_collections,
                &descriptor.property_versionability(),
            );
            if required || forced {
                let current = entry.version.clone().unwrap_or(Value::Null);
                let next = versioning::increment(&current, support, &*session)?;
                if let Some(slot) = state.get_mut(index) {
                    *slot = next.clone();
                }
                let mut properties = entity.properties();
                if let Some(slot) = properties.get_mut(index) {
                    *slot = PropertyValue::Basic(next.clone());
                }
                entity.replace_properties(properties);
                next_version = Some(next);
            }
        }

        tracing::trace!(
            entity = %descriptor.name(),
            id = %entry.id,
            dirty = ?dirty,
            forced,
            "Scheduling update"
        );
        session.action_queue_mut().add_update(UpdateAction {
            entity,
            id: entry.id.clone(),
            state,
            old_state: entry.loaded_state,
            previous_version: entry.version,
            next_version,
            dirty,
        });
    }
    Ok(())
}
