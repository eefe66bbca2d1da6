//! Cascading session operations along associations.
//!
//! A cascade visits every association of a parent whose cascade style
//! enables the action and whose foreign-key direction allows it at the
//! current [`CascadePoint`], and applies the action to each associated
//! instance.

use crate::event::{EvictEvent, LockEvent, MergeEvent, RefreshEvent};
use crate::merge::MergeContext;
use crate::session::Session;
use graft_core::{
    CascadeAction, EntityInstance, EntityReference, Error, ForeignKeyDirection, Indirection,
    InstanceHandle, LockMode, Result,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Operation propagated to associated instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadingAction {
    SaveUpdate,
    Persist,
    Merge,
    Delete,
    Lock(LockMode),
    Refresh,
    Evict,
}

impl CascadingAction {
    /// Cascade-style flag enabling this action.
    pub fn style_action(self) -> CascadeAction {
        match self {
            CascadingAction::SaveUpdate => CascadeAction::SaveUpdate,
            CascadingAction::Persist => CascadeAction::Persist,
            CascadingAction::Merge => CascadeAction::Merge,
            CascadingAction::Delete => CascadeAction::Delete,
            CascadingAction::Lock(_) => CascadeAction::Lock,
            CascadingAction::Refresh => CascadeAction::Refresh,
            CascadingAction::Evict => CascadeAction::Evict,
        }
    }
}

impl fmt::Display for CascadingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadingAction::SaveUpdate => f.write_str("save-update"),
            CascadingAction::Persist => f.write_str("persist"),
            CascadingAction::Merge => f.write_str("merge"),
            CascadingAction::Delete => f.write_str("delete"),
            CascadingAction::Lock(mode) => write!(f, "lock({mode})"),
            CascadingAction::Refresh => f.write_str("refresh"),
            CascadingAction::Evict => f.write_str("evict"),
        }
    }
}

/// Moment in the parent's lifecycle at which a cascade runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePoint {
    /// Before the parent is inserted, after it is deleted.
    BeforeInsertAfterDelete,
    /// After the parent is inserted, before it is deleted.
    AfterInsertBeforeDelete,
    BeforeMerge,
    BeforeFlush,
    AfterUpdate,
    AfterEvict,
    BeforeRefresh,
    AfterLock,
}

impl CascadePoint {
    /// Does an association with `direction` cascade at this point?
    pub fn cascades(self, direction: ForeignKeyDirection) -> bool {
        match direction {
            ForeignKeyDirection::FromParent => self != CascadePoint::AfterInsertBeforeDelete,
            ForeignKeyDirection::ToParent => self != CascadePoint::BeforeInsertAfterDelete,
        }
    }
}

/// Per-operation bookkeeping shared along a cascade.
pub enum CascadeContext<'a> {
    Merge(&'a mut MergeContext),
    /// Instances the operation already handled.
    Visited(&'a mut HashSet<InstanceHandle>),
    None,
}

impl fmt::Debug for CascadeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeContext::Merge(ctx) => f.debug_tuple("Merge").field(ctx).finish(),
            CascadeContext::Visited(set) => write!(f, "Visited({})", set.len()),
            CascadeContext::None => f.write_str("None"),
        }
    }
}

/// Apply `action` to the associations of `parent` that cascade at `point`.
///
/// The persistence context's cascade level is raised for the duration of
/// the call, also when it fails.
pub fn cascade(
    session: &mut Session,
    action: CascadingAction,
    point: CascadePoint,
    parent: &EntityInstance,
    context: &mut CascadeContext<'_>,
) -> Result<()> {
    let descriptor = Arc::clone(parent.descriptor());
    let style_action = action.style_action();
    if !descriptor
        .attributes()
        .iter()
        .any(|a| a.cascade.includes(style_action))
    {
        return Ok(());
    }

    let level = session.persistence_context_mut().increment_cascade_level();
    tracing::trace!(
        entity = %parent.entity_name(),
        action = %action,
        point = ?point,
        level,
        "Processing cascade"
    );
    let result = cascade_associations(session, action, point, parent, context);
    session.persistence_context_mut().decrement_cascade_level();
    result
}

fn cascade_associations(
    session: &mut Session,
    action: CascadingAction,
    point: CascadePoint,
    parent: &EntityInstance,
    context: &mut CascadeContext<'_>,
) -> Result<()> {
    let descriptor = Arc::clone(parent.descriptor());
    let properties = parent.properties();
    for (attr, value) in descriptor.attributes().iter().zip(properties) {
        if !attr.cascade.includes(action.style_action()) {
            continue;
        }
        let Some(direction) = attr.foreign_key_direction() else {
            continue;
        };
        if !point.cascades(direction) {
            continue;
        }
        let target = attr.target().unwrap_or_default();
        for child in value.references() {
            tracing::trace!(
                association = %attr.name,
                target,
                action = %action,
                "Cascading to associated instance"
            );
            cascade_to_one(session, action, target, child, context)?;
        }
    }
    Ok(())
}

fn cascade_to_one(
    session: &mut Session,
    action: CascadingAction,
    entity_name: &str,
    child: &EntityReference,
    context: &mut CascadeContext<'_>,
) -> Result<()> {
    if let CascadingAction::Merge = action {
        let CascadeContext::Merge(ctx) = context else {
            return Err(Error::Custom(
                "merge cascade requires a merge context".to_string(),
            ));
        };
        let mut event = MergeEvent::new(child.clone()).with_entity_name(entity_name);
        return session.merge_in_context(&mut event, ctx);
    }

    let Some(entity) = child.implementation() else {
        tracing::trace!(
            entity = entity_name,
            action = %action,
            "Skipping uninitialized proxy"
        );
        return Ok(());
    };

    match action {
        CascadingAction::SaveUpdate => match context {
            CascadeContext::Visited(visited) => session.save_update_in_context(&entity, visited),
            _ => session.save_update_in_context(&entity, &mut HashSet::new()),
        },
        CascadingAction::Persist => match context {
            CascadeContext::Visited(visited) => session.persist_in_context(&entity, visited),
            _ => session.persist_in_context(&entity, &mut HashSet::new()),
        },
        CascadingAction::Delete => match context {
            CascadeContext::Visited(visited) => session.delete_in_context(&entity, visited),
            _ => session.delete_in_context(&entity, &mut HashSet::new()),
        },
        CascadingAction::Refresh => {
            let mut event = RefreshEvent {
                entity,
                lock_mode: LockMode::None,
            };
            match context {
                CascadeContext::Visited(visited) => session.refresh_in_context(&mut event, visited),
                _ => session.refresh_in_context(&mut event, &mut HashSet::new()),
            }
        }
        CascadingAction::Lock(lock_mode) => session.fire_lock(&mut LockEvent { entity, lock_mode }),
        CascadingAction::Evict => session.fire_evict(&mut EvictEvent {
            entity: child.clone(),
        }),
        CascadingAction::Merge => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_filters_points() {
        use CascadePoint::*;
        use ForeignKeyDirection::*;

        assert!(BeforeInsertAfterDelete.cascades(FromParent));
        assert!(!BeforeInsertAfterDelete.cascades(ToParent));
        assert!(!AfterInsertBeforeDelete.cascades(FromParent));
        assert!(AfterInsertBeforeDelete.cascades(ToParent));
        for point in [BeforeMerge, BeforeFlush, AfterUpdate, AfterEvict, BeforeRefresh, AfterLock] {
            assert!(point.cascades(FromParent));
            assert!(point.cascades(ToParent));
        }
    }

    #[test]
    fn test_style_actions() {
        assert_eq!(
            CascadingAction::Lock(LockMode::Read).style_action(),
            CascadeAction::Lock
        );
        assert_eq!(CascadingAction::Merge.to_string(), "merge");
        assert_eq!(
            CascadingAction::Lock(LockMode::PessimisticWrite).to_string(),
            format!("lock({})", LockMode::PessimisticWrite)
        );
    }
}
