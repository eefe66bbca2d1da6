//! Default merge listener.
//!
//! # Overview
//!
//! A merge copies the state of a source instance onto the instance the
//! session manages for the same identity, and returns that managed instance.
//! The source is classified first:
//!
//! - **persistent**: the source is itself managed and is its own target
//! - **transient**: a fresh copy is saved and receives the source's state
//! - **detached**: the managed instance is loaded (or taken from the
//!   persistence context) and overwritten, after a version check
//!
//! Associations are merged by cascade before the copy, so that every
//! reachable source already has a target when references are replaced.

use super::common::{EntityState, is_transient, save_transient};
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction, cascade};
use crate::event::{InstantiableListener, Listener, MergeEvent, MergeEventListener};
use crate::merge::{
    MergeContext, copy_values, copy_values_from_parent, copy_values_to_parent,
    mark_interceptor_dirty,
};
use crate::persistence_context::EntityKey;
use crate::session::Session;
use graft_core::{
    EntityInstance, EntityRef, EntityReference, Error, IdentityMismatchError,
    IdentityMismatchKind, IllegalStateKind, Indirection, Result, StaleStateError,
};
use std::sync::Arc;

/// Copies detached or transient state onto managed instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMergeEventListener;

impl Listener for DefaultMergeEventListener {}

impl InstantiableListener for DefaultMergeEventListener {
    fn instantiate() -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }
}

impl MergeEventListener for DefaultMergeEventListener {
    fn on_merge_in_context(
        &self,
        session: &mut Session,
        event: &mut MergeEvent,
        ctx: &mut MergeContext,
    ) -> Result<()> {
        let entity = match &event.original {
            EntityReference::Proxy(proxy) if !proxy.is_initialized() => {
                tracing::trace!(
                    entity = %proxy.entity_name(),
                    id = %proxy.id(),
                    "Merging uninitialized proxy; initializing it"
                );
                event.result = Some(session.initialize(&event.original)?);
                return Ok(());
            }
            reference => reference.implementation().ok_or_else(|| {
                Error::illegal_state(
                    IllegalStateKind::MergeContextConflict,
                    Some(reference.entity_name()),
                    "merge source has no implementation",
                )
            })?,
        };

        if ctx.contains(entity.handle()) {
            if ctx.is_operated_on(entity.handle()) {
                tracing::trace!(entity = %entity.entity_name(), "Already in merge process");
                event.result = ctx.get(entity.handle()).cloned();
                return Ok(());
            }
            tracing::trace!(entity = %entity.entity_name(), "Already in merge context; setting in merge process");
            ctx.set_operated_on(entity.handle(), true)?;
        }

        match classify(session, &entity)? {
            EntityState::Persistent => entity_is_persistent(session, event, &entity, ctx),
            EntityState::Transient => entity_is_transient(session, event, &entity, ctx),
            EntityState::Detached => entity_is_detached(session, event, &entity, ctx),
            EntityState::Deleted => Err(Error::illegal_state(
                IllegalStateKind::ObjectDeleted,
                Some(entity.entity_name()),
                format!("deleted instance passed to merge: {}", entity.entity_name()),
            )),
        }
    }
}

/// Classification specific to merge.
///
/// An unmanaged source whose key is managed under another instance is
/// detached. Undecided unsaved-value heuristics assume detached.
fn classify(session: &Session, entity: &EntityInstance) -> Result<EntityState> {
    let context = session.persistence_context();
    if let Some(entry) = context.entry(entity.handle()) {
        return Ok(if entry.is_deleted() {
            EntityState::Deleted
        } else {
            EntityState::Persistent
        });
    }
    if let Some(id) = entity.id() {
        let key = EntityKey::new(entity.descriptor(), id);
        if context.entry_by_key(&key).is_some() {
            return Ok(EntityState::Detached);
        }
    }
    if is_transient(session, entity, Some(false))? {
        Ok(EntityState::Transient)
    } else {
        Ok(EntityState::Detached)
    }
}

fn entity_is_persistent(
    session: &mut Session,
    event: &mut MergeEvent,
    entity: &EntityRef,
    ctx: &mut MergeContext,
) -> Result<()> {
    tracing::trace!(entity = %entity.entity_name(), "Ignoring persistent instance");
    ctx.put(entity, entity, true)?;
    cascade(
        session,
        CascadingAction::Merge,
        CascadePoint::BeforeMerge,
        entity,
        &mut CascadeContext::Merge(&mut *ctx),
    )?;
    copy_values(session, entity, entity, ctx)?;
    event.result = Some(Arc::clone(entity));
    Ok(())
}

fn entity_is_transient(
    session: &mut Session,
    event: &mut MergeEvent,
    entity: &EntityRef,
    ctx: &mut MergeContext,
) -> Result<()> {
    tracing::trace!(entity = %entity.entity_name(), "Merging transient instance");
    let id = entity.id();
    let copy = if let Some(existing) = ctx.get(entity.handle()).cloned() {
        existing.set_id(id);
        existing
    } else {
        let copy = EntityInstance::new(entity.descriptor());
        copy.set_id(id);
        ctx.put(entity, &copy, true)?;
        copy
    };

    cascade(
        session,
        CascadingAction::Merge,
        CascadePoint::BeforeInsertAfterDelete,
        entity,
        &mut CascadeContext::Merge(&mut *ctx),
    )?;
    copy_values_from_parent(session, entity, &copy, ctx)?;
    save_transient(session, &copy, event.requested_id.clone())?;
    cascade(
        session,
        CascadingAction::Merge,
        CascadePoint::AfterInsertBeforeDelete,
        entity,
        &mut CascadeContext::Merge(&mut *ctx),
    )?;
    copy_values_to_parent(session, entity, &copy, ctx)?;
    event.result = Some(copy);
    Ok(())
}

fn entity_is_detached(
    session: &mut Session,
    event: &mut MergeEvent,
    entity: &EntityRef,
    ctx: &mut MergeContext,
) -> Result<()> {
    tracing::trace!(entity = %entity.entity_name(), "Merging detached instance");
    let entity_id = entity.id();
    let id = match (&event.requested_id, &entity_id) {
        (Some(requested), Some(own)) if requested != own => {
            return Err(Error::IdentityMismatch(IdentityMismatchError {
                kind: IdentityMismatchKind::RequestedId,
                entity: entity.entity_name().to_string(),
                message: format!("merge requested with id {requested} not matching id {own} of passed entity"),
            }));
        }
        (Some(requested), _) => requested.clone(),
        (None, Some(own)) => own.clone(),
        (None, None) => {
            return Err(Error::mapping(
                Some(entity.entity_name()),
                "detached instance has no identifier",
            ));
        }
    };

    let entity_name = event.entity_name().to_string();
    let Some(result) = session.get(&entity_name, id.clone())? else {
        tracing::trace!(
            entity = %entity_name,
            id = %id,
            "Detached instance not found; merging as transient"
        );
        return entity_is_transient(session, event, entity, ctx);
    };

    ctx.put(entity, &result, true)?;
    if result.handle() == entity.handle() {
        return Err(Error::illegal_state(
            IllegalStateKind::NotDetached,
            Some(entity.entity_name()),
            "entity was not detached",
        ));
    }
    if result.entity_name() != entity.entity_name() {
        return Err(Error::IdentityMismatch(IdentityMismatchError {
            kind: IdentityMismatchKind::WrongClass,
            entity: entity.entity_name().to_string(),
            message: format!(
                "class of the given object ({}) did not match class of persistent copy ({})",
                entity.entity_name(),
                result.entity_name()
            ),
        }));
    }
    if is_version_changed(session, entity, &result) {
        let statistics = session.factory().statistics();
        if statistics.is_enabled() {
            statistics.optimistic_failure(entity.entity_name());
        }
        return Err(Error::StaleState(StaleStateError {
            entity: entity.entity_name().to_string(),
            id,
            message: format!(
                "version {} of the merged instance does not match managed version {}",
                display_version(entity.version()),
                display_version(result.version())
            ),
        }));
    }

    cascade(
        session,
        CascadingAction::Merge,
        CascadePoint::BeforeMerge,
        entity,
        &mut CascadeContext::Merge(&mut *ctx),
    )?;
    copy_values(session, entity, &result, ctx)?;
    mark_interceptor_dirty(entity, &result);
    event.result = Some(result);
    Ok(())
}

/// The versions differ and the target represents database state.
///
/// Versions are compared through the version type, so `Int(1)` and
/// `BigInt(1)` agree. A target saved earlier in the same session may be
/// merged onto even when its version moved.
fn is_version_changed(session: &Session, source: &EntityInstance, target: &EntityInstance) -> bool {
    let Some(support) = target.descriptor().version_support() else {
        return false;
    };
    let current = target.version().unwrap_or(graft_core::Value::Null);
    let incoming = source.version().unwrap_or(graft_core::Value::Null);
    if support.is_same(&current, &incoming) {
        return false;
    }
    session
        .persistence_context()
        .entry(target.handle())
        .is_some_and(|entry| entry.exists_in_database)
}

fn display_version(version: Option<graft_core::Value>) -> String {
    version.map_or_else(|| "null".to_string(), |v| v.to_string())
}
